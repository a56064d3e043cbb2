//! Graph persistence.
//!
//! The whole graph is saved at process exit to a single schema-tagged
//! binary store. Load failure is non-fatal: a wrong schema version, a
//! truncated file, or a missing file all produce an empty graph that is
//! rebuilt on demand.

use color_eyre::{Result, eyre::Context};
use mesh::archive::{self, Archivable, Archive, ArchiveReader, ArchiveWriter};
use tracing::{debug, instrument, warn};

use crate::{
    fs::Ufs,
    graph::{
        Graph, GraphState, Node, NodeMeta,
        node::{self, Alias, Stamp},
    },
    path::AbsPath,
};

/// Bumped whenever the node encoding changes; a mismatch discards the
/// store instead of repairing it.
pub const GRAPH_STORE_VERSION: u32 = 2;

/// Save the whole graph to a single binary store, atomically.
#[instrument(skip(graph, ufs))]
pub async fn save(graph: &Graph, ufs: &Ufs, path: &AbsPath) -> Result<()> {
    let mut ar = ArchiveWriter::buffer();
    archive::version_tag(&mut ar, GRAPH_STORE_VERSION)?;

    let nodes = graph.nodes();
    let mut count = u32::try_from(nodes.len()).context("graph too large")?;
    ar.u32(&mut count)?;

    for node in nodes {
        let mut tag = node.type_tag();
        ar.u32(&mut tag)?;
        let mut alias = node.alias().clone();
        alias.archive(&mut ar)?;

        // Length-prefixed so a reader can skip nodes it cannot decode.
        let mut buildable = node.buildable.lock().await;
        let mut body = archive::to_bytes(&mut **buildable)?;
        ar.bytes(&mut body)?;
        drop(buildable);

        let meta = node.meta_snapshot();
        let mut stamp = meta.stamp;
        stamp.archive(&mut ar)?;
        let mut statics = meta.static_deps.clone();
        statics.archive(&mut ar)?;
        let mut dynamics = meta.dynamic_deps.clone();
        dynamics.archive(&mut ar)?;
        let mut outputs = meta.output_deps.clone();
        outputs.archive(&mut ar)?;
    }

    let bytes = ar.into_bytes();
    ufs.safe_create(path, &bytes).await?;
    debug!(%path, bytes = bytes.len(), "saved graph store");
    Ok(())
}

/// Load a graph store. Any failure yields `None` and the caller starts
/// from an empty graph.
#[instrument(skip(ufs))]
pub async fn load(ufs: &Ufs, path: &AbsPath) -> Result<Option<Graph>> {
    ufs.invalidate(path);
    if !ufs.exists(path).await {
        return Ok(None);
    }
    let bytes = ufs.read(path).await?;
    match decode(&bytes) {
        Ok(graph) => Ok(Some(graph)),
        Err(err) => {
            warn!(%path, ?err, "discarding unreadable graph store");
            Ok(None)
        }
    }
}

fn decode(bytes: &[u8]) -> Result<Graph> {
    let mut ar = ArchiveReader::buffer(bytes);
    archive::version_tag(&mut ar, GRAPH_STORE_VERSION)?;

    let mut count = 0u32;
    ar.u32(&mut count)?;

    let state = GraphState::default();
    for _ in 0..count {
        let mut tag = 0u32;
        ar.u32(&mut tag)?;
        let mut alias = Alias::default();
        alias.archive(&mut ar)?;

        let mut body = Vec::new();
        ar.bytes(&mut body)?;
        let mut buildable = node::instantiate(tag)?;
        {
            let mut body_ar = ArchiveReader::buffer(&body);
            buildable.archive(&mut body_ar)?;
        }

        let mut stamp: Option<Stamp> = None;
        stamp.archive(&mut ar)?;
        let mut static_deps: Vec<Alias> = Vec::new();
        static_deps.archive(&mut ar)?;
        let mut dynamic_deps: Vec<Alias> = Vec::new();
        dynamic_deps.archive(&mut ar)?;
        let mut output_deps: Vec<Alias> = Vec::new();
        output_deps.archive(&mut ar)?;

        if let Some(export) = buildable.export_basename() {
            state.exports.insert(export, alias.clone());
        }
        let meta = NodeMeta {
            stamp,
            static_deps,
            dynamic_deps,
            output_deps,
        };
        state.nodes.insert(alias, Node::new_with_meta(buildable, meta));
    }

    Ok(Graph::from_state(state))
}
