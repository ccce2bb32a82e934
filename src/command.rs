//! Single external command execution, blocking or detached.

use std::ffi::OsStr;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::debug;

use crate::environment::Environment;
use crate::error::{HarnessError, HarnessResult};

/// A program together with the arguments that precede every invocation.
///
/// `Executable::new("sh").with_base_args(["fake-node.sh"])` runs a script
/// through the shell; `Executable::new("forest")` runs the daemon directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Executable {
    program: PathBuf,
    base_args: Vec<String>,
}

impl Executable {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            base_args: Vec::new(),
        }
    }

    pub fn with_base_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.base_args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn base_args(&self) -> &[String] {
        &self.base_args
    }

    /// Human-readable name used in logs and errors.
    pub fn display_name(&self) -> String {
        let mut name = self.program.display().to_string();
        for arg in &self.base_args {
            name.push(' ');
            name.push_str(arg);
        }
        name
    }

    fn command<I, S>(&self, args: I, env: &Environment) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut command = Command::new(&self.program);
        command.args(&self.base_args);
        command.args(args);
        for (key, value) in env.iter() {
            command.env(key, value);
        }
        command.stdin(Stdio::null());
        command
    }
}

/// Captured result of a completed command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Status rendered for error messages, e.g. `exit status: 1`.
    pub fn status_text(&self) -> String {
        self.status.to_string()
    }
}

/// Runs external commands. A non-zero exit is data, not an error.
#[derive(Debug, Clone, Default)]
pub struct CommandRunner {
    timeout: Option<Duration>,
}

impl CommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bounds every [`CommandRunner::run`] call; the child is killed on expiry.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Runs the command to completion, capturing stdout and stderr.
    ///
    /// # Arguments
    /// * `exe` - Program and base arguments
    /// * `args` - Arguments appended after the base arguments
    /// * `env` - Extra environment for the child
    ///
    /// # Returns
    /// * `HarnessResult<CommandOutput>` - Exit status and captured output; a
    ///   non-zero exit is data, not an error
    pub async fn run<I, S>(
        &self,
        exe: &Executable,
        args: I,
        env: &Environment,
    ) -> HarnessResult<CommandOutput>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut command = exe.command(args, env);
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.kill_on_drop(true);

        debug!("Running command: {}", exe.display_name());

        let output = match self.timeout {
            Some(limit) => match timeout(limit, command.output()).await {
                Ok(output) => output,
                Err(_) => {
                    return Err(HarnessError::CommandTimeout {
                        program: exe.display_name(),
                        timeout: limit,
                    })
                }
            },
            None => command.output().await,
        }
        .map_err(|source| HarnessError::Command {
            program: exe.display_name(),
            source,
        })?;

        debug!("{} finished with {}", exe.display_name(), output.status);

        Ok(CommandOutput {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Spawns the command in the background and returns immediately.
    ///
    /// The child leads a new process group so the whole tree can be signalled
    /// at teardown. Its stdout and stderr are redirected to the given files.
    pub fn spawn_detached<I, S>(
        &self,
        exe: &Executable,
        args: I,
        env: &Environment,
        stdout_path: &Path,
        stderr_path: &Path,
    ) -> HarnessResult<Child>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let stdout = File::create(stdout_path)?;
        let stderr = File::create(stderr_path)?;

        let mut command = exe.command(args, env);
        command.stdout(Stdio::from(stdout));
        command.stderr(Stdio::from(stderr));
        command.process_group(0);
        command.kill_on_drop(true);

        command.spawn().map_err(|source| HarnessError::Command {
            program: exe.display_name(),
            source,
        })
    }
}
