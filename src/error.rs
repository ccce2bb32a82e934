//! Error types for the node harness

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("failed to launch {program}: {reason}")]
    LaunchFailed { program: String, reason: String },

    #[error("node did not become ready within {0:?}")]
    ReadinessTimeout(Duration),

    #[error("query `{command}` exited with {status}: {stderr}")]
    QueryExecutionFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("field `{label}` not found in query output")]
    QueryFieldNotFound { label: String },

    #[error("process {pid} did not stop within the {grace:?} grace period")]
    ShutdownTimeout { pid: i32, grace: Duration },

    #[error("process {pid} is still alive after forced termination")]
    TeardownLeak { pid: i32 },

    #[error("a node is already running under this controller (pid {0})")]
    AlreadyLaunched(i32),

    #[error("auth token not available at {0}")]
    TokenUnavailable(PathBuf),

    #[error("interrupted by {0}")]
    Interrupted(&'static str),

    #[error("{message}: expected `{expected}`, got `{actual}`")]
    AssertionFailed {
        message: String,
        expected: String,
        actual: String,
    },

    #[error("{program} did not finish within {timeout:?}")]
    CommandTimeout { program: String, timeout: Duration },

    #[error("failed to run {program}: {source}")]
    Command {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::ser::Error),
}

impl HarnessError {
    /// True for the teardown anomalies that are reported but never fatal.
    pub fn is_teardown_warning(&self) -> bool {
        matches!(
            self,
            HarnessError::ShutdownTimeout { .. } | HarnessError::TeardownLeak { .. }
        )
    }
}

pub type HarnessResult<T> = Result<T, HarnessError>;
