//! Process execution behind a swappable seam.
//!
//! The executor and the worker both run commands through [`ProcessRunner`]
//! so tests can count invocations and script effects without spawning
//! anything.

use std::{
    collections::BTreeMap,
    process::Stdio,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use color_eyre::{
    Result,
    eyre::{Context, ContextCompat, bail},
};
use mesh::message::{FileAccess, OutputLine};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::path::AbsPath;

/// The fully resolved command an action runs.
#[derive(Clone, Default, Eq, PartialEq, Debug)]
pub struct CommandRules {
    pub executable: AbsPath,
    pub arguments: Vec<String>,
    pub working_dir: AbsPath,
    pub environment: BTreeMap<String, String>,
}

impl CommandRules {
    /// Render the command for diagnostics.
    pub fn command_line(&self) -> String {
        std::iter::once(self.executable.to_string())
            .chain(self.arguments.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// What happened when a command ran.
#[derive(Clone, Default, Debug)]
pub struct ProcessOutcome {
    pub exit_code: i32,
    pub output: Vec<OutputLine>,
    /// File-access records, when an IO-detouring layer produced them.
    /// Hosts without detouring report none.
    pub accesses: Vec<FileAccess>,
}

impl ProcessOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// The first few captured lines, for failure reports.
    pub fn head_of_output(&self, lines: usize) -> String {
        self.output
            .iter()
            .take(lines)
            .map(|line| line.line.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Runs external processes.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(&self, rules: &CommandRules, cancel: &CancellationToken)
    -> Result<ProcessOutcome>;
}

/// Spawns the process on this machine.
#[derive(Debug, Default)]
pub struct LocalRunner;

#[async_trait]
impl ProcessRunner for LocalRunner {
    #[instrument(skip_all, fields(command = rules.command_line()))]
    async fn run(
        &self,
        rules: &CommandRules,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutcome> {
        let mut command = tokio::process::Command::new(rules.executable.as_std_path());
        command
            .args(&rules.arguments)
            .current_dir(rules.working_dir.as_std_path())
            .envs(&rules.environment)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .with_context(|| format!("spawn {}", rules.command_line()))?;

        let stdout = child.stdout.take().context("take stdout")?;
        let stderr = child.stderr.take().context("take stderr")?;
        let stdout_task = tokio::spawn(collect_lines(stdout, false));
        let stderr_task = tokio::spawn(collect_lines(stderr, true));

        let status = tokio::select! {
            status = child.wait() => status.context("wait for process")?,
            () = cancel.cancelled() => {
                child.kill().await.ok();
                bail!("process cancelled: {}", rules.command_line());
            }
        };

        let mut output = stdout_task.await.context("join stdout reader")??;
        output.extend(stderr_task.await.context("join stderr reader")??);

        let exit_code = status.code().unwrap_or(-1);
        debug!(exit_code, "process finished");
        Ok(ProcessOutcome {
            exit_code,
            output,
            accesses: Vec::new(),
        })
    }
}

async fn collect_lines(
    reader: impl tokio::io::AsyncRead + Unpin,
    stderr: bool,
) -> Result<Vec<OutputLine>> {
    let mut lines = BufReader::new(reader).lines();
    let mut collected = Vec::new();
    while let Some(line) = lines.next_line().await.context("read output line")? {
        collected.push(OutputLine { stderr, line });
    }
    Ok(collected)
}

/// A runner for tests: counts invocations and applies a scripted effect
/// instead of spawning a process.
pub struct ScriptedRunner {
    invocations: AtomicUsize,
    #[allow(clippy::type_complexity)]
    script: Arc<dyn Fn(&CommandRules) -> Result<ProcessOutcome> + Send + Sync>,
}

impl ScriptedRunner {
    pub fn new(
        script: impl Fn(&CommandRules) -> Result<ProcessOutcome> + Send + Sync + 'static,
    ) -> Self {
        Self {
            invocations: AtomicUsize::new(0),
            script: Arc::new(script),
        }
    }

    /// A runner that succeeds and materializes outputs the way a compiler
    /// would: every path following a `-o` argument is written, resolved
    /// against the working directory when relative. The file content is
    /// derived from the command line, so different commands produce
    /// different bytes.
    pub fn touching_outputs() -> Self {
        Self::new(|rules| {
            let mut arguments = rules.arguments.iter().peekable();
            while let Some(argument) = arguments.next() {
                if argument != "-o" {
                    continue;
                }
                let Some(target) = arguments.peek() else {
                    continue;
                };
                let target = std::path::Path::new(target.as_str());
                let path = if target.is_absolute() {
                    target.to_path_buf()
                } else {
                    rules.working_dir.as_std_path().join(target)
                };
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).context("create output dir")?;
                }
                std::fs::write(&path, rules.command_line()).context("write output")?;
            }
            Ok(ProcessOutcome::default())
        })
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProcessRunner for ScriptedRunner {
    async fn run(
        &self,
        rules: &CommandRules,
        _cancel: &CancellationToken,
    ) -> Result<ProcessOutcome> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        (self.script)(rules)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test_log::test(tokio::test)]
    async fn local_runner_captures_output_and_exit() -> Result<()> {
        let rules = CommandRules {
            executable: AbsPath::try_from("/bin/sh")?,
            arguments: vec!["-c".into(), "echo out; echo err >&2; exit 3".into()],
            working_dir: AbsPath::try_from("/tmp")?,
            environment: BTreeMap::new(),
        };
        let outcome = LocalRunner.run(&rules, &CancellationToken::new()).await?;
        assert_eq!(outcome.exit_code, 3);
        assert!(outcome.output.iter().any(|l| !l.stderr && l.line == "out"));
        assert!(outcome.output.iter().any(|l| l.stderr && l.line == "err"));
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn scripted_runner_counts() -> Result<()> {
        let runner = ScriptedRunner::new(|_| Ok(ProcessOutcome::default()));
        let rules = CommandRules::default();
        runner.run(&rules, &CancellationToken::new()).await?;
        runner.run(&rules, &CancellationToken::new()).await?;
        assert_eq!(runner.invocations(), 2);
        Ok(())
    }
}
