//! The diff-based incremental build driver.
//!
//! A run walks the DAG bottom-up: every alias gets at most one shared
//! future, dependencies are awaited in parallel, and a node's own build
//! only starts once all of its dependencies hold a committed stamp for
//! this run. Dependency failures poison the dependent node: it is not
//! built, its previous stamp survives, and the failure surfaces with the
//! alias of the root cause.

use std::sync::Arc;

use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use dashmap::DashMap;
use futures::{
    FutureExt,
    future::{BoxFuture, Shared, join_all},
};
use jiff::Timestamp;
use mesh::Digest;
use tracing::{debug, instrument, trace, warn};

use crate::{
    executor::Services,
    graph::{
        Graph, GraphState,
        node::{Alias, Buildable, SourceFile, Stamp},
    },
    path::AbsPath,
};

/// Options for one build invocation.
#[derive(Clone, Default)]
pub struct BuildOptions {
    /// Ignore the cached stamp and rebuild unconditionally.
    pub force: bool,
    /// Downgrade the missing-declared-output postcondition to a warning.
    pub warn_missing_output: bool,
    /// Mark matching nodes dirty before the up-to-date check.
    pub dirty_if: Option<Arc<dyn Fn(&Alias) -> bool + Send + Sync>>,
}

impl std::fmt::Debug for BuildOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildOptions")
            .field("force", &self.force)
            .field("warn_missing_output", &self.warn_missing_output)
            .field("dirty_if", &self.dirty_if.is_some())
            .finish()
    }
}

/// The successful result of building one alias.
#[derive(Clone, Debug)]
pub struct Built {
    pub alias: Alias,
    pub stamp: Stamp,
    /// Whether the node's `build` ran this time.
    pub rebuilt: bool,
    /// Whether the stamp differs from the previous run's.
    pub changed: bool,
}

/// A build failure attributed to the alias where it originated.
///
/// Poisoned dependents propagate this unchanged, so joiners always see the
/// root cause rather than the closest node.
#[derive(Clone, Debug)]
pub struct BuildFailure {
    pub alias: Alias,
    report: Arc<color_eyre::Report>,
}

impl BuildFailure {
    fn new(alias: Alias, report: color_eyre::Report) -> Self {
        Self {
            alias,
            report: Arc::new(report),
        }
    }

    pub fn to_report(&self) -> color_eyre::Report {
        eyre!("build of {} failed: {:#}", self.alias, self.report)
    }
}

/// Records a node's `build` step hands back through the driver.
pub struct BuildContext {
    pub services: Arc<Services>,
    pub options: BuildOptions,
    /// File-backed dynamic dependencies recorded in previous runs, so an
    /// action's cache key covers the inputs it discovered last time.
    pub known_dynamic_inputs: Vec<AbsPath>,
    dynamic_inputs: Vec<AbsPath>,
    produced: Vec<AbsPath>,
}

impl BuildContext {
    fn new(
        services: Arc<Services>,
        options: BuildOptions,
        known_dynamic_inputs: Vec<AbsPath>,
    ) -> Self {
        Self {
            services,
            options,
            known_dynamic_inputs,
            dynamic_inputs: Vec::new(),
            produced: Vec::new(),
        }
    }

    /// Record a file the build read that was not declared statically.
    pub fn depend_on(&mut self, path: AbsPath) {
        self.dynamic_inputs.push(path);
    }

    /// Record a file the build produced.
    pub fn produced(&mut self, path: AbsPath) {
        self.produced.push(path);
    }
}

type RunOutcome = Result<Built, BuildFailure>;

struct BuildRun {
    state: Arc<GraphState>,
    services: Arc<Services>,
    options: BuildOptions,
    results: DashMap<Alias, Shared<BoxFuture<'static, RunOutcome>>>,
}

impl Graph {
    /// Build one alias to completion.
    #[instrument(skip(self, options, services))]
    pub async fn build(
        &self,
        alias: &Alias,
        options: BuildOptions,
        services: Arc<Services>,
    ) -> Result<Built> {
        self.build_many(std::slice::from_ref(alias), options, services)
            .await
            .map(|mut built| built.pop().expect("one result per alias"))
    }

    /// Build a set of aliases in parallel and join the results.
    ///
    /// The first failure is returned, attributed to the alias where it
    /// originated.
    #[instrument(skip(self, options, services), fields(count = aliases.len()))]
    pub async fn build_many(
        &self,
        aliases: &[Alias],
        options: BuildOptions,
        services: Arc<Services>,
    ) -> Result<Vec<Built>> {
        self.close().context("close graph")?;
        let run = Arc::new(BuildRun {
            state: Arc::clone(&self.state),
            services,
            options,
            results: DashMap::new(),
        });

        let futures = aliases
            .iter()
            .map(|alias| run.node_future(alias.clone()))
            .collect::<Vec<_>>();
        let outcomes = join_all(futures).await;

        let mut built = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            built.push(outcome.map_err(|failure| failure.to_report())?);
        }
        Ok(built)
    }
}

impl BuildRun {
    /// The memoized shared future for one alias.
    ///
    /// The future is spawned onto the runtime when first created so
    /// sibling dependencies make progress in parallel instead of being
    /// polled one by one inside their dependent's join.
    fn node_future(
        self: &Arc<Self>,
        alias: Alias,
    ) -> Shared<BoxFuture<'static, RunOutcome>> {
        if let Some(existing) = self.results.get(&alias) {
            return existing.clone();
        }
        let mut created = false;
        let shared = self
            .results
            .entry(alias.clone())
            .or_insert_with(|| {
                created = true;
                let run = Arc::clone(self);
                async move { run.build_node(alias).await }.boxed().shared()
            })
            .clone();
        if created {
            tokio::spawn(shared.clone().map(drop));
        }
        shared
    }

    #[instrument(skip(self), fields(%alias))]
    async fn build_node(self: Arc<Self>, alias: Alias) -> RunOutcome {
        if self.services.cancel.is_cancelled() {
            return Err(BuildFailure::new(alias, eyre!("build cancelled")));
        }

        let node = self
            .state
            .expect(&alias)
            .map_err(|err| BuildFailure::new(alias.clone(), err))?;

        // Dependencies build in parallel; they are unordered.
        let meta = node.meta_snapshot();
        let dep_aliases = meta
            .static_deps
            .iter()
            .chain(meta.dynamic_deps.iter())
            .cloned()
            .collect::<Vec<_>>();
        let dep_outcomes = join_all(
            dep_aliases
                .iter()
                .map(|dep| self.node_future(dep.clone()))
                .collect::<Vec<_>>(),
        )
        .await;

        let mut deps_changed = false;
        for outcome in dep_outcomes {
            match outcome {
                Ok(dep) => deps_changed |= dep.changed,
                // Poisoned: not built, prior stamp preserved, root failure
                // propagated untouched.
                Err(failure) => {
                    warn!(%alias, root = %failure.alias, "dependency failure poisons node");
                    return Err(failure);
                }
            }
        }

        let previous = meta.stamp;
        let dirty = self
            .is_dirty(&alias, &node, previous, deps_changed)
            .await
            .map_err(|err| BuildFailure::new(alias.clone(), err))?;

        if !dirty {
            let stamp = previous.expect("clean nodes have a stamp");
            trace!(%alias, "up to date");
            return Ok(Built {
                alias,
                stamp,
                rebuilt: false,
                changed: false,
            });
        }

        debug!(%alias, "building");
        let known_dynamic_inputs = meta
            .dynamic_deps
            .iter()
            .filter_map(|dep| AbsPath::new(dep.as_str()).ok())
            .collect();
        let mut ctx = BuildContext::new(
            Arc::clone(&self.services),
            self.options.clone(),
            known_dynamic_inputs,
        );
        {
            let mut buildable = node.buildable.lock().await;
            if let Err(err) = buildable.build(&mut ctx).await {
                return Err(BuildFailure::new(alias, err));
            }
        }

        self.ingest(&alias, &node, ctx)
            .await
            .map_err(|err| BuildFailure::new(alias.clone(), err))?;

        // Stamp: fresh fingerprint plus the node's idea of its mtime.
        let stamp = {
            let mut buildable = node.buildable.lock().await;
            let fingerprint = Digest::of(buildable.as_mut() as &mut dyn Buildable)
                .map_err(|err| BuildFailure::new(alias.clone(), err))?;
            Stamp {
                fingerprint,
                mtime: buildable.stamp_mtime().unwrap_or_else(Timestamp::now),
            }
        };
        let changed = previous != Some(stamp);
        node.meta.lock().expect("node meta lock").stamp = Some(stamp);

        Ok(Built {
            alias,
            stamp,
            rebuilt: true,
            changed,
        })
    }

    async fn is_dirty(
        &self,
        alias: &Alias,
        node: &crate::graph::Node,
        previous: Option<Stamp>,
        deps_changed: bool,
    ) -> Result<bool> {
        if self.options.force {
            return Ok(true);
        }
        if let Some(predicate) = self.options.dirty_if.as_ref()
            && predicate(alias)
        {
            return Ok(true);
        }
        let Some(previous) = previous else {
            return Ok(true);
        };
        if deps_changed {
            return Ok(true);
        }

        // Replay the serializer; a definition change flips the node dirty
        // even when every dependency is quiet.
        let replayed = {
            let mut buildable = node.buildable.lock().await;
            Digest::of(buildable.as_mut() as &mut dyn Buildable)?
        };
        if replayed != previous.fingerprint {
            return Ok(true);
        }

        let buildable = node.buildable.lock().await;
        buildable.probe_dirty(&self.services.ufs, &previous).await
    }

    /// Fold the context's records back into the graph: discovered inputs
    /// become dynamic edges (and are stamped so the next run can diff
    /// them), produced files become output edges.
    async fn ingest(
        self: &Arc<Self>,
        alias: &Alias,
        node: &crate::graph::Node,
        ctx: BuildContext,
    ) -> Result<()> {
        let mut new_dynamic = Vec::new();
        {
            let meta = node.meta.lock().expect("node meta lock");
            for path in ctx.dynamic_inputs.iter() {
                let dep = Alias::new(path.to_string());
                if !meta.static_deps.contains(&dep)
                    && !meta.output_deps.contains(&dep)
                    && !meta.dynamic_deps.contains(&dep)
                {
                    new_dynamic.push((dep, path.clone()));
                }
            }
        }

        for (dep, path) in new_dynamic.iter() {
            // Leaf insertion: file nodes have no outgoing edges, so this
            // cannot introduce a cycle and needs no write port.
            self.state
                .nodes
                .entry(dep.clone())
                .or_insert_with(|| super::Node::new_for_run(Box::new(SourceFile::new(path.clone()))));
            node.meta
                .lock()
                .expect("node meta lock")
                .add_dynamic(dep.clone());
        }

        // Stamp the discovered inputs now so the next run has a baseline.
        let outcomes = join_all(
            new_dynamic
                .iter()
                .map(|(dep, _)| self.node_future(dep.clone()))
                .collect::<Vec<_>>(),
        )
        .await;
        for outcome in outcomes {
            outcome.map_err(|failure| failure.to_report())?;
        }

        // Produced files beyond the declared outputs become output edges.
        {
            let mut meta = node.meta.lock().expect("node meta lock");
            for path in ctx.produced.iter() {
                let out = Alias::new(path.to_string());
                if !meta.output_deps.contains(&out) {
                    self.state.nodes.entry(out.clone()).or_insert_with(|| {
                        super::Node::new_for_run(Box::new(
                            crate::graph::node::GeneratedFile::new(path.clone()),
                        ))
                    });
                    meta.output_deps.push(out);
                }
            }
        }

        trace!(%alias, dynamic = ctx.dynamic_inputs.len(), produced = ctx.produced.len(), "ingested build records");
        Ok(())
    }
}
