//! Read-only inspection commands and labeled-field extraction.

use std::path::Path;
use tracing::debug;

use crate::command::{CommandRunner, Executable};
use crate::environment::{Environment, NodeEnv};
use crate::error::{HarnessError, HarnessResult};

/// What an inspection command is pointed at.
#[derive(Debug, Clone, Copy)]
pub enum QueryTarget<'a> {
    /// A running node, reached through its API info.
    Instance(&'a NodeEnv),
    /// A standalone data artifact such as a snapshot file.
    Artifact(&'a Path),
}

/// Runs inspection subcommands of the node CLI.
#[derive(Debug, Clone)]
pub struct Query {
    runner: CommandRunner,
    cli: Executable,
}

impl Query {
    pub fn new(cli: Executable) -> Self {
        Self::with_runner(cli, CommandRunner::new())
    }

    pub fn with_runner(cli: Executable, runner: CommandRunner) -> Self {
        Self { runner, cli }
    }

    /// Runs `command` against `target` and returns its stdout.
    pub async fn run(&self, target: QueryTarget<'_>, command: &[&str]) -> HarnessResult<String> {
        let mut args: Vec<String> = command.iter().map(|s| s.to_string()).collect();
        let env = match target {
            QueryTarget::Instance(node) => node.cli_environment(),
            QueryTarget::Artifact(path) => {
                args.push(path.display().to_string());
                Environment::new()
            }
        };

        let output = self.runner.run(&self.cli, &args, &env).await?;
        if !output.success() {
            return Err(HarnessError::QueryExecutionFailed {
                command: command.join(" "),
                status: output.status_text(),
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output.stdout)
    }

    /// Runs `command` against `target` and extracts the value after `label`.
    ///
    /// # Arguments
    /// * `target` - Running instance or data artifact to inspect
    /// * `command` - CLI subcommand, e.g. `["archive", "info"]`
    /// * `label` - Field label such as `Epoch` or `CAR format`
    ///
    /// # Returns
    /// * `HarnessResult<String>` - The token following the label
    pub async fn query(
        &self,
        target: QueryTarget<'_>,
        command: &[&str],
        label: &str,
    ) -> HarnessResult<String> {
        let output = self.run(target, command).await?;
        let value = extract_field(&output, label).ok_or_else(|| HarnessError::QueryFieldNotFound {
            label: label.to_string(),
        })?;
        debug!("{} {} -> {}", command.join(" "), label, value);
        Ok(value)
    }

    pub async fn epoch(&self, archive: &Path) -> HarnessResult<String> {
        self.query(QueryTarget::Artifact(archive), &["archive", "info"], "Epoch")
            .await
    }

    pub async fn state_roots(&self, archive: &Path) -> HarnessResult<String> {
        self.query(QueryTarget::Artifact(archive), &["archive", "info"], "State-roots")
            .await
    }

    pub async fn car_format(&self, archive: &Path) -> HarnessResult<String> {
        self.query(QueryTarget::Artifact(archive), &["archive", "info"], "CAR format")
            .await
    }

    /// Database statistics for `chain`, as raw text.
    pub async fn db_stats(&self, chain: &str) -> HarnessResult<String> {
        let args = ["db", "stats", "--chain", chain];
        let output = self.runner.run(&self.cli, args, &Environment::new()).await?;
        if !output.success() {
            return Err(HarnessError::QueryExecutionFailed {
                command: args.join(" "),
                status: output.status_text(),
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output.stdout)
    }
}

/// Extracts the token following `label` on the first line that starts with it.
///
/// Matching is token-wise and ignores a trailing `:` on line tokens, so the
/// label `CAR format` matches `CAR format: v2` and yields `v2`.
pub fn extract_field(output: &str, label: &str) -> Option<String> {
    let label_tokens: Vec<&str> = label.split_whitespace().collect();
    if label_tokens.is_empty() {
        return None;
    }

    let line = output.lines().find(|line| {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        tokens.len() >= label_tokens.len()
            && tokens
                .iter()
                .zip(&label_tokens)
                .all(|(token, expected)| token.trim_end_matches(':') == *expected)
    })?;

    line.split_whitespace()
        .nth(label_tokens.len())
        .map(str::to_string)
}
