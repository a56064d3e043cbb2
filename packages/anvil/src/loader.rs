//! The minimal project-description loader.
//!
//! Reads a `targets.json` describing actions: aliases, dependency
//! relationships, input sets, outputs, and option flags. Toolchain
//! specifics (compiler flag generation, platform archetypes) belong to an
//! external collaborator; this loader only consumes the fields the core
//! needs to populate the graph.

use std::collections::BTreeMap;

use color_eyre::{Result, eyre::Context};
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::{
    action::{Action, OptionFlags},
    fs::Ufs,
    graph::{Graph, node::Alias},
    path::AbsPath,
};

/// One action as written in the project description.
#[derive(Clone, Debug, Deserialize)]
pub struct TargetSpec {
    pub executable: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    #[serde(default)]
    pub export_index: u32,
    /// Export basenames of other actions whose output this one consumes.
    #[serde(default)]
    pub dynamic_inputs: Vec<String>,
    /// Export basenames of actions that must run first.
    #[serde(default)]
    pub prerequisites: Vec<String>,
    #[serde(default = "default_true")]
    pub cache: bool,
    #[serde(default = "default_true")]
    pub distribute: bool,
    #[serde(default)]
    pub deterministic: bool,
    #[serde(default)]
    pub response_file: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, Deserialize)]
struct TargetFile {
    targets: Vec<TargetSpec>,
}

/// Load a target file and register its actions into the graph.
///
/// Relative paths resolve against the project root; input entries may be
/// glob patterns (`src/**/*.c`), expanded at load time. Returns the
/// aliases in declaration order.
#[instrument(skip(ufs, graph))]
pub async fn load(
    ufs: &Ufs,
    graph: &Graph,
    root: &AbsPath,
    file: &AbsPath,
) -> Result<Vec<Alias>> {
    let bytes = ufs.read(file).await?;
    let parsed: TargetFile =
        serde_json::from_slice(&bytes).with_context(|| format!("parse target file {file}"))?;

    let mut expanded = Vec::with_capacity(parsed.targets.len());
    for mut target in parsed.targets {
        target.inputs = expand_inputs(ufs, root, &target.inputs).await?;
        expanded.push(target);
    }

    let port = graph.write_port("loader").await;
    let mut aliases = Vec::with_capacity(expanded.len());
    for target in expanded {
        let action = into_action(root, target)?;
        let alias = port
            .register_action(action)
            .context("register target action")?;
        debug!(%alias, "registered target");
        aliases.push(alias);
    }
    Ok(aliases)
}

/// Expand glob input entries into concrete relative paths.
async fn expand_inputs(ufs: &Ufs, root: &AbsPath, inputs: &[String]) -> Result<Vec<String>> {
    let mut expanded = Vec::with_capacity(inputs.len());
    for input in inputs {
        if input.contains('*') || input.contains('?') {
            for matched in ufs.glob(root, input).await? {
                expanded.push(matched.relative_to(root)?.to_string());
            }
        } else {
            expanded.push(input.clone());
        }
    }
    Ok(expanded)
}

fn into_action(root: &AbsPath, target: TargetSpec) -> Result<Action> {
    let resolve = |path: &str| -> Result<AbsPath> {
        match AbsPath::try_from(path) {
            Ok(abs) => Ok(abs),
            Err(_) => Ok(root.join(path)),
        }
    };

    let mut flags = OptionFlags::default();
    if target.cache {
        flags = flags | OptionFlags::ALLOW_CACHE;
    }
    if target.distribute {
        flags = flags | OptionFlags::ALLOW_DISTRIBUTION;
    }
    if target.deterministic {
        flags = flags | OptionFlags::DETERMINISTIC;
    }
    if target.response_file {
        flags = flags | OptionFlags::RESPONSE_FILE;
    }

    let action = Action {
        executable: resolve(&target.executable)?,
        arguments: target.arguments,
        working_dir: match target.working_dir.as_deref() {
            Some(dir) => resolve(dir)?,
            None => root.clone(),
        },
        environment: target.environment,
        static_inputs: target
            .inputs
            .iter()
            .map(|input| resolve(input))
            .collect::<Result<Vec<_>>>()?,
        dynamic_input_actions: target
            .dynamic_inputs
            .iter()
            .map(|name| Alias::new(name.clone()))
            .collect(),
        prerequisites: target
            .prerequisites
            .iter()
            .map(|name| Alias::new(name.clone()))
            .collect(),
        outputs: target
            .outputs
            .iter()
            .map(|output| resolve(output))
            .collect::<Result<Vec<_>>>()?,
        export_index: target.export_index,
        flags,
    };
    action.validate()?;
    Ok(action)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn temp_root() -> (tempfile::TempDir, AbsPath) {
        let dir = tempfile::TempDir::new().expect("create temp dir");
        let path = AbsPath::try_from(dir.path()).expect("temp dir is absolute");
        (dir, path)
    }

    #[test_log::test(tokio::test)]
    async fn loads_targets_and_stitches_the_graph() -> Result<()> {
        let (_guard, root) = temp_root();
        let ufs = Ufs::new();
        let graph = Graph::new();

        let manifest = serde_json::json!({
            "targets": [
                {
                    "executable": "/usr/bin/cc",
                    "arguments": ["-c", "foo.c", "-o", "out/foo.o"],
                    "inputs": ["foo.c"],
                    "outputs": ["out/foo.o"]
                },
                {
                    "executable": "/usr/bin/cc",
                    "arguments": ["out/foo.o", "-o", "out/foo"],
                    "outputs": ["out/foo"],
                    "dynamic_inputs": ["foo.o"]
                }
            ]
        });
        let file = root.join("targets.json");
        ufs.create_buffered(&file, serde_json::to_vec(&manifest)?)
            .await?;

        let aliases = load(&ufs, &graph, &root, &file).await?;
        assert_eq!(aliases, vec![Alias::new("foo.o"), Alias::new("foo")]);

        // Action + source file + output file per target, shared where
        // paths coincide.
        let link = graph.expect(&Alias::new("foo"))?;
        let meta = link.meta_snapshot();
        assert!(meta.static_deps.contains(&Alias::new("foo.o")));
        graph.close()?;
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn glob_inputs_expand_at_load_time() -> Result<()> {
        let (_guard, root) = temp_root();
        let ufs = Ufs::new();
        let graph = Graph::new();
        ufs.create_buffered(&root.join("src/a.c"), b"").await?;
        ufs.create_buffered(&root.join("src/b.c"), b"").await?;
        ufs.create_buffered(&root.join("src/skip.h"), b"").await?;

        let manifest = serde_json::json!({
            "targets": [{
                "executable": "/usr/bin/cc",
                "inputs": ["src/**/*.c"],
                "outputs": ["out/unity.o"]
            }]
        });
        let file = root.join("targets.json");
        ufs.create_buffered(&file, serde_json::to_vec(&manifest)?)
            .await?;

        load(&ufs, &graph, &root, &file).await?;
        let node = graph.expect(&Alias::new("unity.o"))?;
        let meta = node.meta_snapshot();
        assert_eq!(meta.static_deps.len(), 2, "both .c files, not the header");
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn duplicate_exports_are_rejected() -> Result<()> {
        let (_guard, root) = temp_root();
        let ufs = Ufs::new();
        let graph = Graph::new();

        let manifest = serde_json::json!({
            "targets": [
                {
                    "executable": "/usr/bin/cc",
                    "outputs": ["a/foo.o"],
                    "inputs": []
                },
                {
                    "executable": "/usr/bin/cc",
                    "outputs": ["b/foo.o"],
                    "inputs": []
                }
            ]
        });
        let file = root.join("targets.json");
        ufs.create_buffered(&file, serde_json::to_vec(&manifest)?)
            .await?;

        assert!(load(&ufs, &graph, &root, &file).await.is_err());
        Ok(())
    }
}
