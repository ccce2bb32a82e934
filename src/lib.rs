//! Process-lifecycle harness for exercising a node daemon end-to-end.
//!
//! The harness launches the daemon in a chosen run mode, waits for it to
//! report ready, exposes its token and API info to a test body, and tears
//! it down again on every exit path.
//!
//! ```text
//! LifecycleController
//!   ├── ProcessLauncher   -> ProcessHandle (PID, token file, log dir)
//!   ├── ReadinessPoller   -> Ready | TimedOut
//!   ├── test body         <- NodeEnv { token, api_info }
//!   └── teardown
//!         ├── DiagnosticsCollector (metrics, stdout/stderr, logs)
//!         ├── graceful request + grace period
//!         └── SIGKILL to the process group + bounded confirmation
//! ```

pub mod assertion;
pub mod command;
pub mod controller;
pub mod diagnostics;
pub mod environment;
pub mod error;
pub mod launcher;
pub mod query;
pub mod readiness;
pub mod signals;

pub use assertion::{check_eq, ensure_eq, AssertionOutcome};
pub use command::{CommandOutput, CommandRunner, Executable};
pub use controller::{
    ControllerConfig, LifecycleController, LifecycleState, ShutdownCommand, TeardownOutcome,
    TeardownReport,
};
pub use diagnostics::{DiagnosticsBundle, DiagnosticsCollector, MetricsCapture};
pub use environment::{ApiEndpoint, Environment, NodeEnv};
pub use error::{HarnessError, HarnessResult};
pub use launcher::{
    LaunchOptions, NormalMode, ProcessHandle, ProcessLauncher, RunArtifacts, RunMode,
    SnapshotImport, SnapshotSource, StatelessMode,
};
pub use query::{Query, QueryTarget};
pub use readiness::{
    AllOf, CommandProbe, FnProbe, ListeningProbe, ReadinessPoller, ReadinessProbe,
    ReadinessResult,
};
