//! The persistent build graph.
//!
//! Nodes live in a flat map keyed by alias; edges are alias-to-alias, not
//! object pointers, so each node is exclusively owned by the graph and
//! "I depend on X" is a lookup. Structural mutation flows through a write
//! port; readers take read ports and may coexist with each other. The
//! small per-node metadata updates made during a build run (stamps,
//! discovered dynamic edges) use per-node interior locks and never hold
//! the write port across a suspension point.

pub mod build;
pub mod node;
pub mod store;

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use color_eyre::{
    Result,
    eyre::{Context, bail, eyre},
};
use dashmap::DashMap;
use derive_more::Display;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, instrument};

use crate::{
    action::Action,
    graph::node::{Alias, Buildable, GeneratedFile, SourceFile, Stamp},
    path::AbsPath,
};

/// The kinds of dependency edge a node records.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display)]
pub enum EdgeKind {
    /// Declared during node construction.
    Static,
    /// Discovered while building.
    Dynamic,
    /// Produced and owned by the node.
    Output,
}

/// Per-node metadata: the stamp and the three disjoint edge sets.
#[derive(Clone, Default, Debug)]
pub struct NodeMeta {
    pub stamp: Option<Stamp>,
    pub static_deps: Vec<Alias>,
    pub dynamic_deps: Vec<Alias>,
    pub output_deps: Vec<Alias>,
}

impl NodeMeta {
    /// Record a dynamic edge, keeping the three sets disjoint.
    pub fn add_dynamic(&mut self, alias: Alias) {
        if self.static_deps.contains(&alias)
            || self.output_deps.contains(&alias)
            || self.dynamic_deps.contains(&alias)
        {
            return;
        }
        self.dynamic_deps.push(alias);
    }
}

/// One node: the buildable plus its metadata.
pub struct Node {
    alias: Alias,
    tag: u32,
    pub(crate) buildable: tokio::sync::Mutex<Box<dyn Buildable>>,
    pub(crate) meta: Mutex<NodeMeta>,
}

impl Node {
    /// Leaf insertion used by the build driver for nodes discovered during
    /// a run (dynamic inputs, extra outputs).
    pub(crate) fn new_for_run(buildable: Box<dyn Buildable>) -> Arc<Self> {
        Self::new(buildable, NodeMeta::default())
    }

    /// Reconstruction from a persisted store.
    pub(crate) fn new_with_meta(buildable: Box<dyn Buildable>, meta: NodeMeta) -> Arc<Self> {
        Self::new(buildable, meta)
    }

    fn new(buildable: Box<dyn Buildable>, meta: NodeMeta) -> Arc<Self> {
        Arc::new(Self {
            alias: buildable.alias(),
            tag: buildable.type_tag(),
            buildable: tokio::sync::Mutex::new(buildable),
            meta: Mutex::new(meta),
        })
    }

    pub fn alias(&self) -> &Alias {
        &self.alias
    }

    pub fn type_tag(&self) -> u32 {
        self.tag
    }

    pub fn stamp(&self) -> Option<Stamp> {
        self.meta.lock().expect("node meta lock").stamp
    }

    pub fn meta_snapshot(&self) -> NodeMeta {
        self.meta.lock().expect("node meta lock").clone()
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("alias", &self.alias)
            .field("tag", &self.tag)
            .finish_non_exhaustive()
    }
}

pub(crate) struct GraphState {
    pub(crate) nodes: DashMap<Alias, Arc<Node>>,
    /// Export basename → owning action alias, for uniqueness enforcement.
    pub(crate) exports: DashMap<String, Alias>,
}

impl Default for GraphState {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphState {
    fn new() -> Self {
        Self {
            nodes: DashMap::new(),
            exports: DashMap::new(),
        }
    }

    pub(crate) fn expect(&self, alias: &Alias) -> Result<Arc<Node>> {
        self.nodes
            .get(alias)
            .map(|node| Arc::clone(&node))
            .ok_or_else(|| eyre!("unknown alias: {alias}"))
    }
}

/// The build graph.
pub struct Graph {
    pub(crate) state: Arc<GraphState>,
    /// Port discipline: many readers or one writer.
    port_gate: Arc<RwLock<()>>,
    /// Whether the current structure has passed the cycle check.
    closed: Arc<AtomicBool>,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    pub fn new() -> Self {
        Self {
            state: Arc::new(GraphState::new()),
            port_gate: Arc::new(RwLock::new(())),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn from_state(state: GraphState) -> Self {
        Self {
            state: Arc::new(state),
            port_gate: Arc::new(RwLock::new(())),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Number of nodes currently in the graph.
    pub fn len(&self) -> usize {
        self.state.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.nodes.is_empty()
    }

    /// Look up a node or fail with an input error.
    pub fn expect(&self, alias: &Alias) -> Result<Arc<Node>> {
        self.state.expect(alias)
    }

    /// Acquire the scoped write handle. One writer at a time; the debug id
    /// shows up in port diagnostics.
    #[instrument(skip(self))]
    pub async fn write_port(&self, debug_id: &str) -> WritePort {
        let permit = Arc::clone(&self.port_gate).write_owned().await;
        debug!(debug_id, "write port open");
        WritePort {
            state: Arc::clone(&self.state),
            closed: Arc::clone(&self.closed),
            debug_id: debug_id.to_string(),
            _permit: permit,
        }
    }

    /// Acquire a scoped read handle. Readers coexist with each other.
    #[instrument(skip(self))]
    pub async fn read_port(&self, debug_id: &str) -> ReadPort {
        let permit = Arc::clone(&self.port_gate).read_owned().await;
        debug!(debug_id, "read port open");
        ReadPort {
            state: Arc::clone(&self.state),
            debug_id: debug_id.to_string(),
            _permit: permit,
        }
    }

    /// Validate acyclicity. Runs once after each structural mutation;
    /// cycles are a hard error naming the participating aliases.
    #[instrument(skip(self))]
    pub fn close(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }

        #[derive(Copy, Clone, Eq, PartialEq)]
        enum Color {
            InProgress,
            Done,
        }

        let mut colors: HashMap<Alias, Color> = HashMap::new();
        let mut stack: Vec<(Alias, usize)> = Vec::new();

        for entry in self.state.nodes.iter() {
            let root = entry.key().clone();
            if colors.contains_key(&root) {
                continue;
            }
            stack.push((root, 0));
            while let Some((alias, next_dep)) = stack.pop() {
                let deps = {
                    let node = self.state.expect(&alias)?;
                    let meta = node.meta.lock().expect("node meta lock");
                    meta.static_deps
                        .iter()
                        .chain(meta.dynamic_deps.iter())
                        .cloned()
                        .collect::<Vec<_>>()
                };
                if next_dep == 0 {
                    colors.insert(alias.clone(), Color::InProgress);
                }
                if next_dep < deps.len() {
                    let dep = deps[next_dep].clone();
                    stack.push((alias.clone(), next_dep + 1));
                    match colors.get(&dep) {
                        Some(Color::InProgress) => {
                            let mut cycle = stack
                                .iter()
                                .map(|(alias, _)| alias.to_string())
                                .collect::<Vec<_>>();
                            cycle.push(dep.to_string());
                            bail!("dependency cycle detected: {}", cycle.join(" -> "));
                        }
                        Some(Color::Done) => {}
                        None => stack.push((dep, 0)),
                    }
                } else {
                    colors.insert(alias, Color::Done);
                }
            }
        }

        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    /// Resolve a node's dependencies of one kind.
    pub fn dependencies(&self, node: &Node, kind: EdgeKind) -> Result<Vec<Arc<Node>>> {
        let aliases = {
            let meta = node.meta.lock().expect("node meta lock");
            match kind {
                EdgeKind::Static => meta.static_deps.clone(),
                EdgeKind::Dynamic => meta.dynamic_deps.clone(),
                EdgeKind::Output => meta.output_deps.clone(),
            }
        };
        aliases
            .iter()
            .map(|alias| self.state.expect(alias))
            .collect()
    }

    pub fn static_dependencies(&self, node: &Node) -> Result<Vec<Arc<Node>>> {
        self.dependencies(node, EdgeKind::Static)
    }

    pub fn dynamic_dependencies(&self, node: &Node) -> Result<Vec<Arc<Node>>> {
        self.dependencies(node, EdgeKind::Dynamic)
    }

    pub fn output_dependencies(&self, node: &Node) -> Result<Vec<Arc<Node>>> {
        self.dependencies(node, EdgeKind::Output)
    }

    /// Shortest path between two aliases as alternating node/edge records.
    #[instrument(skip(self))]
    pub fn dependency_chain(&self, from: &Alias, to: &Alias) -> Result<Vec<ChainLink>> {
        self.expect(from)?;
        self.expect(to)?;

        let mut predecessors: HashMap<Alias, (Alias, EdgeKind)> = HashMap::new();
        let mut queue = VecDeque::from([from.clone()]);
        while let Some(alias) = queue.pop_front() {
            if alias == *to {
                break;
            }
            let node = self.state.expect(&alias)?;
            let meta = node.meta_snapshot();
            let edges = meta
                .static_deps
                .iter()
                .map(|dep| (dep.clone(), EdgeKind::Static))
                .chain(
                    meta.dynamic_deps
                        .iter()
                        .map(|dep| (dep.clone(), EdgeKind::Dynamic)),
                )
                .chain(
                    meta.output_deps
                        .iter()
                        .map(|dep| (dep.clone(), EdgeKind::Output)),
                );
            for (dep, kind) in edges {
                if dep != *from && !predecessors.contains_key(&dep) {
                    predecessors.insert(dep.clone(), (alias.clone(), kind));
                    queue.push_back(dep);
                }
            }
        }

        if *from == *to {
            return Ok(vec![ChainLink {
                alias: from.clone(),
                via: None,
            }]);
        }
        if !predecessors.contains_key(to) {
            bail!("no dependency path from {from} to {to}");
        }

        let mut chain = Vec::new();
        let mut cursor = to.clone();
        loop {
            match predecessors.get(&cursor) {
                Some((previous, kind)) => {
                    chain.push(ChainLink {
                        alias: cursor.clone(),
                        via: Some(*kind),
                    });
                    cursor = previous.clone();
                }
                None => {
                    chain.push(ChainLink {
                        alias: cursor,
                        via: None,
                    });
                    break;
                }
            }
        }
        chain.reverse();
        Ok(chain)
    }

    /// Iterate all nodes (read-side snapshot).
    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.state
            .nodes
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }
}

/// One step of a dependency chain: the node plus the edge kind that led
/// into it (`None` for the chain head).
#[derive(Clone, Debug)]
pub struct ChainLink {
    pub alias: Alias,
    pub via: Option<EdgeKind>,
}

/// Scoped structural-mutation handle.
pub struct WritePort {
    state: Arc<GraphState>,
    closed: Arc<AtomicBool>,
    debug_id: String,
    _permit: OwnedRwLockWriteGuard<()>,
}

impl WritePort {
    pub fn debug_id(&self) -> &str {
        &self.debug_id
    }

    /// Insert a source-file node if absent; returns its alias.
    pub fn add_source_file(&self, path: AbsPath) -> Alias {
        let buildable = SourceFile::new(path);
        let alias = Buildable::alias(&buildable);
        self.insert_if_absent(Box::new(buildable));
        alias
    }

    /// Insert a generated-file node if absent; returns its alias.
    ///
    /// The producer edge is recorded even when a node for the path already
    /// exists, so registration order cannot lose the stitch between an
    /// action and a file some other action consumes.
    pub fn add_generated_file(&self, path: AbsPath, producer: Option<Alias>) -> Alias {
        let buildable = GeneratedFile::new(path);
        let alias = Buildable::alias(&buildable);
        self.insert_if_absent(Box::new(buildable));
        if let Some(producer) = producer {
            let node = self.state.expect(&alias).expect("just inserted");
            let mut meta = node.meta.lock().expect("node meta lock");
            if !meta.static_deps.contains(&producer) {
                meta.static_deps.push(producer);
            }
        }
        alias
    }

    /// Insert an arbitrary node if absent; returns whether it was created.
    pub fn insert_if_absent(&self, buildable: Box<dyn Buildable>) -> bool {
        let alias = buildable.alias();
        let mut created = false;
        self.state.nodes.entry(alias).or_insert_with(|| {
            created = true;
            self.closed.store(false, Ordering::Release);
            Node::new(buildable, NodeMeta::default())
        });
        created
    }

    /// Register an action: validates the export invariant, creates file
    /// nodes for inputs and outputs, and stitches the edges.
    #[instrument(skip_all, fields(debug_id = self.debug_id, alias = %action.alias()))]
    pub fn register_action(&self, action: Action) -> Result<Alias> {
        action.validate()?;
        let alias = Buildable::alias(&action);
        let export = action
            .export_basename()
            .context("action export basename")?;

        if let Some(existing) = self.exports_get(&export)
            && existing != alias
        {
            bail!("duplicate export basename {export:?}: {existing} vs {alias}");
        }
        if self.state.nodes.contains_key(&alias) {
            // Same alias means the same node; re-registration is a no-op.
            return Ok(alias);
        }

        let mut meta = NodeMeta::default();
        for input in action.static_inputs.iter() {
            meta.static_deps.push(self.add_source_file(input.clone()));
        }
        for dynamic_input in action.dynamic_input_actions.iter() {
            // The consumed artifact is the other action's export file.
            meta.static_deps.push(dynamic_input.clone());
        }
        for prerequisite in action.prerequisites.iter() {
            meta.static_deps.push(prerequisite.clone());
        }

        self.state.exports.insert(export, alias.clone());
        self.closed.store(false, Ordering::Release);
        self.state
            .nodes
            .insert(alias.clone(), Node::new(Box::new(action.clone()), meta));

        // Output files are owned by the action and depend on it.
        let mut output_aliases = Vec::new();
        for output in action.outputs.iter() {
            output_aliases.push(self.add_generated_file(output.clone(), Some(alias.clone())));
        }
        let node = self.state.expect(&alias)?;
        node.meta.lock().expect("node meta lock").output_deps = output_aliases;

        Ok(alias)
    }

    fn exports_get(&self, basename: &str) -> Option<Alias> {
        self.state
            .exports
            .get(basename)
            .map(|entry| entry.value().clone())
    }

    /// Remove a node and the output files it owns.
    pub fn remove(&self, alias: &Alias) -> Result<Vec<Alias>> {
        let node = self.state.expect(alias)?;
        let outputs = node.meta_snapshot().output_deps;
        for output in outputs.iter() {
            self.state.nodes.remove(output);
        }
        self.state.nodes.remove(alias);
        self.state.exports.retain(|_, owner| owner != alias);
        self.closed.store(false, Ordering::Release);
        Ok(outputs)
    }
}

impl Drop for WritePort {
    fn drop(&mut self) {
        debug!(debug_id = self.debug_id, "write port closed");
    }
}

/// Scoped read handle; snapshot-consistent lookups.
pub struct ReadPort {
    state: Arc<GraphState>,
    debug_id: String,
    _permit: OwnedRwLockReadGuard<()>,
}

impl ReadPort {
    pub fn debug_id(&self) -> &str {
        &self.debug_id
    }

    pub fn expect(&self, alias: &Alias) -> Result<Arc<Node>> {
        self.state.expect(alias)
    }

    pub fn len(&self) -> usize {
        self.state.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.nodes.is_empty()
    }
}

impl Drop for ReadPort {
    fn drop(&mut self) {
        debug!(debug_id = self.debug_id, "read port closed");
    }
}
