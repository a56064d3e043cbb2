//! The action model: a buildable that runs an external process.

pub mod runner;

use std::collections::BTreeMap;

use async_trait::async_trait;
use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use mesh::{Archivable, Archive, Digest};
use tracing::{instrument, warn};

use crate::{
    action::runner::CommandRules,
    executor::ExecRequest,
    graph::{
        build::BuildContext,
        node::{Alias, Buildable, TAG_ACTION},
    },
    path::AbsPath,
};

/// Arguments longer than this in total are moved into a response file.
pub const RESPONSE_FILE_THRESHOLD: usize = 32 * 1024;

/// Lines of captured output included in a failure report.
const FAILURE_OUTPUT_LINES: usize = 20;

/// Option flags an action commits to.
#[derive(Copy, Clone, Default, Eq, PartialEq, Hash, Debug)]
pub struct OptionFlags(u32);

impl OptionFlags {
    pub const ALLOW_DISTRIBUTION: OptionFlags = OptionFlags(1);
    pub const ALLOW_CACHE: OptionFlags = OptionFlags(1 << 1);
    pub const DETERMINISTIC: OptionFlags = OptionFlags(1 << 2);
    pub const RESPONSE_FILE: OptionFlags = OptionFlags(1 << 3);

    pub fn contains(&self, other: OptionFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn allow_distribution(&self) -> bool {
        self.contains(Self::ALLOW_DISTRIBUTION)
    }

    pub fn allow_cache(&self) -> bool {
        self.contains(Self::ALLOW_CACHE)
    }

    pub fn deterministic(&self) -> bool {
        self.contains(Self::DETERMINISTIC)
    }

    pub fn use_response_file(&self) -> bool {
        self.contains(Self::RESPONSE_FILE)
    }
}

impl std::ops::BitOr for OptionFlags {
    type Output = OptionFlags;

    fn bitor(self, rhs: OptionFlags) -> OptionFlags {
        OptionFlags(self.0 | rhs.0)
    }
}

impl Archivable for OptionFlags {
    fn archive(&mut self, ar: &mut dyn Archive) -> Result<()> {
        ar.u32(&mut self.0)
    }
}

/// A buildable that describes an external-process invocation with explicit
/// inputs, outputs, and option flags.
///
/// The action's alias is the basename of its primary (export) output,
/// which must be unique within the graph.
#[derive(Clone, Default, Eq, PartialEq, Debug)]
pub struct Action {
    pub executable: AbsPath,
    pub arguments: Vec<String>,
    pub working_dir: AbsPath,
    pub environment: BTreeMap<String, String>,
    /// Input files known before running.
    pub static_inputs: Vec<AbsPath>,
    /// Other actions whose export file is consumed.
    pub dynamic_input_actions: Vec<Alias>,
    /// Actions that must be built first but whose outputs are not consumed.
    pub prerequisites: Vec<Alias>,
    pub outputs: Vec<AbsPath>,
    /// Index of the primary output within `outputs`.
    pub export_index: u32,
    pub flags: OptionFlags,
}

impl Action {
    /// Check the action invariants.
    ///
    /// The primary output may not also appear among the extras: tolerating
    /// the duplicate would alias two file nodes onto one path.
    pub fn validate(&self) -> Result<()> {
        if self.outputs.is_empty() {
            bail!("action has no outputs");
        }
        let index = self.export_index as usize;
        if index >= self.outputs.len() {
            bail!(
                "export index {index} out of range for {} outputs",
                self.outputs.len()
            );
        }
        let export = &self.outputs[index];
        let duplicated = self
            .outputs
            .iter()
            .enumerate()
            .any(|(position, output)| position != index && output == export);
        if duplicated {
            bail!("primary output {export} is duplicated in the extra outputs");
        }
        Ok(())
    }

    /// The primary output file.
    pub fn export_file(&self) -> Result<&AbsPath> {
        self.outputs
            .get(self.export_index as usize)
            .ok_or_else(|| color_eyre::eyre::eyre!("export index out of range"))
    }

    /// The export basename: the action's alias.
    pub fn export_basename(&self) -> Result<String> {
        let export = self.export_file()?;
        export
            .file_name()
            .map(str::to_string)
            .ok_or_else(|| color_eyre::eyre::eyre!("export file {export} has no basename"))
    }

    /// The relocatable fingerprint used for cache keys.
    ///
    /// Input and output paths are expressed relative to the working
    /// directory and the working directory itself is left out, so two
    /// checkouts of the same project in different locations share cache
    /// entries. Paths outside the workspace (system executables) hash
    /// as-is.
    pub fn cache_fingerprint(&self) -> Result<Digest> {
        let relative = |path: &AbsPath| -> String {
            path.relative_to(&self.working_dir)
                .map(|rel| rel.to_string())
                .unwrap_or_else(|_| path.to_string())
        };
        let mut ar = mesh::ArchiveWriter::hasher();
        let ar_dyn: &mut dyn Archive = &mut ar;
        self.executable.to_string().archive(ar_dyn)?;
        self.arguments.clone().archive(ar_dyn)?;
        self.environment.clone().archive(ar_dyn)?;
        self.static_inputs
            .iter()
            .map(relative)
            .collect::<Vec<_>>()
            .archive(ar_dyn)?;
        self.outputs
            .iter()
            .map(relative)
            .collect::<Vec<_>>()
            .archive(ar_dyn)?;
        let mut export_index = self.export_index;
        ar_dyn.u32(&mut export_index)?;
        let mut flags = self.flags;
        flags.archive(ar_dyn)?;
        Ok(ar.finalize_digest())
    }

    /// Resolve the command rules, moving arguments into a response file
    /// when the flag is set or the command line outgrows the platform
    /// threshold. The returned guard keeps the response file alive for the
    /// duration of the run.
    #[instrument(skip_all)]
    pub async fn command_rules(&self) -> Result<(CommandRules, Option<tempfile::NamedTempFile>)> {
        let total: usize = self
            .arguments
            .iter()
            .map(|argument| argument.len() + 1)
            .sum();
        let want_response_file =
            self.flags.use_response_file() || total > RESPONSE_FILE_THRESHOLD;
        if !want_response_file {
            return Ok((
                CommandRules {
                    executable: self.executable.clone(),
                    arguments: self.arguments.clone(),
                    working_dir: self.working_dir.clone(),
                    environment: self.environment.clone(),
                },
                None,
            ));
        }

        let content = self.arguments.join("\n");
        let working_dir = self.working_dir.clone();
        let response = tokio::task::spawn_blocking(move || -> Result<tempfile::NamedTempFile> {
            let mut file = tempfile::Builder::new()
                .prefix(".anvil-args-")
                .suffix(".rsp")
                .tempfile_in(working_dir.as_std_path())
                .context("create response file")?;
            std::io::Write::write_all(&mut file, content.as_bytes())
                .context("write response file")?;
            Ok(file)
        })
        .await
        .context("join task")??;

        let rules = CommandRules {
            executable: self.executable.clone(),
            arguments: vec![format!("@{}", response.path().display())],
            working_dir: self.working_dir.clone(),
            environment: self.environment.clone(),
        };
        Ok((rules, Some(response)))
    }
}

impl Archivable for Action {
    fn archive(&mut self, ar: &mut dyn Archive) -> Result<()> {
        self.executable.archive(ar)?;
        self.arguments.archive(ar)?;
        self.working_dir.archive(ar)?;
        self.environment.archive(ar)?;
        self.static_inputs.archive(ar)?;
        self.dynamic_input_actions.archive(ar)?;
        self.prerequisites.archive(ar)?;
        self.outputs.archive(ar)?;
        ar.u32(&mut self.export_index)?;
        self.flags.archive(ar)
    }
}

#[async_trait]
impl Buildable for Action {
    fn alias(&self) -> Alias {
        Alias::new(
            self.export_basename()
                .unwrap_or_else(|_| String::from("<invalid action>")),
        )
    }

    fn type_tag(&self) -> u32 {
        TAG_ACTION
    }

    fn export_basename(&self) -> Option<String> {
        Action::export_basename(self).ok()
    }

    /// A declared output that disappeared re-dirties the action: crash
    /// recovery and cache restoration both hinge on this.
    async fn probe_dirty(
        &self,
        ufs: &crate::fs::Ufs,
        _stamp: &crate::graph::node::Stamp,
    ) -> Result<bool> {
        for output in self.outputs.iter() {
            ufs.invalidate(output);
            if !ufs.exists(output).await {
                return Ok(true);
            }
        }
        Ok(false)
    }

    #[instrument(skip_all, fields(alias = %Buildable::alias(self)))]
    async fn build(&mut self, ctx: &mut BuildContext) -> Result<()> {
        let services = ctx.services.clone();
        let ufs = &services.ufs;

        for output in self.outputs.iter() {
            if let Some(parent) = output.parent() {
                ufs.create_dir_all(&parent).await?;
            }
        }

        let (rules, response_guard) = self.command_rules().await?;
        let fingerprint = self.cache_fingerprint()?;

        let mut inputs = self.static_inputs.clone();
        for known in ctx.known_dynamic_inputs.iter() {
            if !inputs.contains(known) {
                inputs.push(known.clone());
            }
        }

        let request = ExecRequest {
            rules: rules.clone(),
            inputs,
            outputs: self.outputs.clone(),
            workspace: self.working_dir.clone(),
            fingerprint,
            flags: self.flags,
        };
        let execution = services.executor.execute(&request).await?;
        drop(response_guard);

        if execution.outcome.exit_code != 0 {
            bail!(
                "command failed with exit code {}: {}\n{}",
                execution.outcome.exit_code,
                rules.command_line(),
                execution.outcome.head_of_output(FAILURE_OUTPUT_LINES),
            );
        }

        // Every file the process read that we didn't already know about
        // becomes a dynamic dependency.
        for access in execution.outcome.accesses.iter() {
            if access.write {
                continue;
            }
            let Ok(path) = AbsPath::new(access.path.clone()) else {
                continue;
            };
            if self.static_inputs.contains(&path) || self.outputs.contains(&path) {
                continue;
            }
            ctx.depend_on(path);
        }

        // Declared outputs must exist afterwards; the option downgrades
        // the postcondition to a warning.
        for output in self.outputs.iter() {
            ufs.invalidate(output);
            if !ufs.exists(output).await {
                if ctx.options.warn_missing_output {
                    warn!(%output, "declared output missing after build");
                } else {
                    bail!("declared output missing after build: {output}");
                }
            } else {
                ctx.produced(output.clone());
            }
        }

        Ok(())
    }
}
