use nix::errno::Errno;
use nix::sys::signal::Signal;
use std::future::Future;
use std::net::TcpListener;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::command::{CommandRunner, Executable};
use crate::diagnostics::{DiagnosticsBundle, DiagnosticsCollector, DEFAULT_METRICS_URL};
use crate::environment::NodeEnv;
use crate::error::{HarnessError, HarnessResult};
use crate::launcher::{ProcessHandle, ProcessLauncher, RunMode};
use crate::readiness::{ReadinessPoller, ReadinessProbe, ReadinessResult};
use crate::signals::{signal_name, Signals};

/// Graceful-stop request issued through the node CLI.
#[derive(Debug, Clone)]
pub struct ShutdownCommand {
    pub cli: Executable,
    pub args: Vec<String>,
}

impl ShutdownCommand {
    /// `<cli> shutdown --force`
    pub fn new(cli: Executable) -> Self {
        Self {
            cli,
            args: vec!["shutdown".to_string(), "--force".to_string()],
        }
    }

    pub fn with_args<I, S>(cli: Executable, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            cli,
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

/// Timeouts and teardown behavior of a [`LifecycleController`]
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Ceiling on the readiness wait
    pub ready_timeout: Duration,
    /// Delay between readiness probes
    pub poll_interval: Duration,
    /// Time a node gets to exit after the graceful request
    pub grace_period: Duration,
    /// Time allowed for the exit to be observed after SIGKILL
    pub kill_timeout: Duration,
    /// Liveness polling interval during teardown
    pub liveness_interval: Duration,
    /// Graceful-stop command; SIGTERM is used when unset or when it fails
    pub shutdown: Option<ShutdownCommand>,
    /// Metrics endpoint fetched into diagnostics
    pub metrics_url: Option<String>,
    /// Collect diagnostics on successful teardowns as well
    pub diagnostics_on_success: bool,
    /// Where bundles are written; defaults to `<work_dir>/diagnostics`
    pub diagnostics_dir: Option<PathBuf>,
    /// Refuse to launch when the API address is already taken
    pub single_instance_check: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(30 * 60),
            poll_interval: Duration::from_secs(1),
            grace_period: Duration::from_secs(10),
            kill_timeout: Duration::from_secs(10),
            liveness_interval: Duration::from_millis(250),
            shutdown: None,
            metrics_url: Some(DEFAULT_METRICS_URL.to_string()),
            diagnostics_on_success: true,
            diagnostics_dir: None,
            single_instance_check: true,
        }
    }
}

/// Lifecycle of the node managed by a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Launching,
    AwaitingReady,
    Ready,
    /// The caller's test body is running
    Active,
    /// Launch failed or the node never became ready
    Failed,
    TearingDown,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownOutcome {
    /// Nothing to tear down (idle or already terminated)
    Skipped,
    /// No process was ever started
    NotLaunched,
    ExitedOnItsOwn,
    Graceful,
    Forced,
    /// The process survived SIGKILL within the kill timeout
    Leaked,
}

/// What a teardown did. Teardown anomalies are warnings, never errors.
#[derive(Debug)]
pub struct TeardownReport {
    pub outcome: TeardownOutcome,
    pub diagnostics: Option<DiagnosticsBundle>,
    pub warnings: Vec<HarnessError>,
}

impl TeardownReport {
    fn new(outcome: TeardownOutcome) -> Self {
        Self {
            outcome,
            diagnostics: None,
            warnings: Vec::new(),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// Owns one node from launch to confirmed termination.
///
/// The controller launches the node, waits for readiness, hands control to
/// the caller and tears the node down again. At most one node is live per
/// controller: [`LifecycleController::start`] is refused while a node is
/// held, until [`LifecycleController::teardown`] has released it.
///
/// Teardown is guaranteed on every exit path:
/// * [`LifecycleController::run`] tears down after the body returns, fails,
///   or is interrupted by SIGINT/SIGTERM.
/// * Dropping the controller with a live node (a panic, a cancelled future)
///   performs a blocking emergency teardown.
pub struct LifecycleController {
    launcher: ProcessLauncher,
    poller: ReadinessPoller,
    collector: DiagnosticsCollector,
    config: ControllerConfig,
    state: LifecycleState,
    handle: Option<ProcessHandle>,
    node_env: Option<NodeEnv>,
    failed: bool,
    last_diagnostics: Option<DiagnosticsBundle>,
}

impl LifecycleController {
    /// Creates an idle controller.
    ///
    /// # Arguments
    /// * `launcher` - Launcher carrying the daemon executable and work directory
    /// * `config` - Timeouts and teardown behavior
    pub fn new(launcher: ProcessLauncher, config: ControllerConfig) -> Self {
        Self {
            poller: ReadinessPoller::new(config.poll_interval),
            collector: DiagnosticsCollector::new(config.metrics_url.clone()),
            launcher,
            config,
            state: LifecycleState::Idle,
            handle: None,
            node_env: None,
            failed: false,
            last_diagnostics: None,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn launcher(&self) -> &ProcessLauncher {
        &self.launcher
    }

    pub fn handle(&self) -> Option<&ProcessHandle> {
        self.handle.as_ref()
    }

    /// Token and API info of the ready node.
    pub fn node_env(&self) -> Option<&NodeEnv> {
        self.node_env.as_ref()
    }

    /// Most recent diagnostics bundle, if any was collected.
    pub fn last_diagnostics(&self) -> Option<&DiagnosticsBundle> {
        self.last_diagnostics.as_ref()
    }

    /// Live liveness check of the managed node; false when none is held.
    pub fn is_node_alive(&mut self) -> bool {
        self.handle.as_mut().is_some_and(ProcessHandle::is_alive)
    }

    /// Launches the node and waits until `probe` reports it ready.
    ///
    /// Refused with [`HarnessError::AlreadyLaunched`] while a node is held.
    /// A launch failure leaves the controller in [`LifecycleState::Failed`]
    /// after collecting diagnostics from whatever output exists; the shutdown
    /// interface is not touched and `start` may be called again. A readiness timeout tears the node down
    /// before [`HarnessError::ReadinessTimeout`] is returned.
    ///
    /// # Returns
    /// * `HarnessResult<NodeEnv>` - Token and API info of the ready node
    pub async fn start<P>(&mut self, mode: &RunMode, probe: &mut P) -> HarnessResult<NodeEnv>
    where
        P: ReadinessProbe + ?Sized,
    {
        if let Some(handle) = &self.handle {
            return Err(HarnessError::AlreadyLaunched(handle.pid().as_raw()));
        }

        self.failed = false;
        self.last_diagnostics = None;
        self.transition(LifecycleState::Launching);

        let launched = match self.check_single_instance() {
            Ok(()) => self.launcher.launch(mode).await,
            Err(e) => Err(e),
        };
        let handle = match launched {
            Ok(handle) => handle,
            Err(e) => {
                error!("Launch failed: {}", e);
                self.failed = true;
                self.transition(LifecycleState::Failed);
                let bundle = self.collector.collect(&self.launcher.artifacts(mode)).await;
                self.surface(&bundle, true);
                self.last_diagnostics = Some(bundle);
                return Err(e);
            }
        };

        self.transition(LifecycleState::AwaitingReady);
        let handle = self.handle.insert(handle);
        let readiness = self
            .poller
            .wait_ready(handle, probe, self.config.ready_timeout)
            .await;

        if readiness == ReadinessResult::TimedOut {
            let limit = self.config.ready_timeout;
            error!("Node did not become ready within {:?}", limit);
            return Err(self.fail_and_teardown(HarnessError::ReadinessTimeout(limit)).await);
        }

        let token = match self.handle.as_ref() {
            Some(handle) => handle.read_token().await,
            None => None,
        };
        let Some(token) = token else {
            let path = self.launcher.artifacts(mode).token_path;
            return Err(self.fail_and_teardown(HarnessError::TokenUnavailable(path)).await);
        };

        let env = NodeEnv::new(token, &self.launcher.options().api);
        self.node_env = Some(env.clone());
        self.transition(LifecycleState::Ready);
        Ok(env)
    }

    /// Runs `body` against a freshly started node, tearing down afterwards.
    ///
    /// Start and body are raced against SIGINT/SIGTERM; an interruption
    /// becomes [`HarnessError::Interrupted`]. Whatever the outcome, teardown
    /// runs before returning and its anomalies are only logged, so the
    /// body's own error reaches the caller unchanged.
    pub async fn run<P, F, Fut, T, E>(&mut self, mode: &RunMode, probe: &mut P, body: F) -> Result<T, E>
    where
        P: ReadinessProbe + ?Sized,
        F: FnOnce(NodeEnv) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<HarnessError>,
    {
        let mut signals = match Signals::new() {
            Ok(signals) => Some(signals),
            Err(e) => {
                warn!("Signal handling unavailable, relying on scope exit only: {}", e);
                None
            }
        };

        let result = {
            let work = self.start_and_run(mode, probe, body);
            tokio::pin!(work);
            match signals.as_mut() {
                Some(signals) => tokio::select! {
                    result = &mut work => result,
                    Some(kind) = signals.next() => {
                        let name = signal_name(kind);
                        warn!("Received {}, tearing down", name);
                        Err(E::from(HarnessError::Interrupted(name)))
                    }
                },
                None => work.await,
            }
        };

        if result.is_err() {
            self.failed = true;
        }
        let report = self.teardown().await;
        for warning in &report.warnings {
            warn!("Teardown: {}", warning);
        }
        result
    }

    async fn start_and_run<P, F, Fut, T, E>(&mut self, mode: &RunMode, probe: &mut P, body: F) -> Result<T, E>
    where
        P: ReadinessProbe + ?Sized,
        F: FnOnce(NodeEnv) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<HarnessError>,
    {
        let env = self.start(mode, probe).await.map_err(E::from)?;
        self.transition(LifecycleState::Active);
        body(env).await
    }

    /// Stops the node and confirms it is gone. Never fails.
    ///
    /// A no-op in [`LifecycleState::Idle`] and [`LifecycleState::Terminated`].
    /// Otherwise: a node that already exited is left alone; a live node has
    /// its diagnostics collected first, then gets the graceful request and
    /// the full grace period, then SIGKILL to its process group.
    pub async fn teardown(&mut self) -> TeardownReport {
        if matches!(self.state, LifecycleState::Idle | LifecycleState::Terminated) {
            debug!("Teardown requested while {:?}, nothing to do", self.state);
            return TeardownReport::new(TeardownOutcome::Skipped);
        }

        let failure = self.failed || self.state == LifecycleState::Failed;
        self.transition(LifecycleState::TearingDown);

        let report = match self.handle.take() {
            Some(mut handle) => self.stop_node(&mut handle, failure).await,
            None => TeardownReport::new(TeardownOutcome::NotLaunched),
        };

        if let Some(bundle) = &report.diagnostics {
            self.surface(bundle, failure);
            self.last_diagnostics = Some(bundle.clone());
        }
        self.node_env = None;
        self.transition(LifecycleState::Terminated);
        info!("Teardown finished: {:?}", report.outcome);
        report
    }

    /// Marks the run failed, tears down, and hands back `cause`.
    async fn fail_and_teardown(&mut self, cause: HarnessError) -> HarnessError {
        self.failed = true;
        self.transition(LifecycleState::Failed);
        let report = self.teardown().await;
        for warning in &report.warnings {
            warn!("Teardown: {}", warning);
        }
        cause
    }

    async fn stop_node(&self, handle: &mut ProcessHandle, failure: bool) -> TeardownReport {
        let pid = handle.pid();

        if !handle.is_alive() {
            info!("Node {} already exited ({:?}), no shutdown needed", pid, handle.exit_status());
            let mut report = TeardownReport::new(TeardownOutcome::ExitedOnItsOwn);
            if failure {
                report.diagnostics = Some(self.collector.collect(handle.artifacts()).await);
            }
            return report;
        }

        let mut report = TeardownReport::new(TeardownOutcome::Graceful);
        if failure || self.config.diagnostics_on_success {
            report.diagnostics = Some(self.collector.collect(handle.artifacts()).await);
        }

        let requested_at = Instant::now();
        let grace_deadline = if self.request_shutdown(handle).await {
            requested_at + self.config.grace_period
        } else {
            // SIGTERM fallback gets a full grace period of its own
            self.terminate(handle);
            Instant::now() + self.config.grace_period
        };
        let remaining = grace_deadline.saturating_duration_since(Instant::now());
        if self.wait_for_exit(handle, remaining).await {
            info!("Node {} stopped gracefully", pid);
            return report;
        }

        let timed_out = HarnessError::ShutdownTimeout {
            pid: pid.as_raw(),
            grace: self.config.grace_period,
        };
        warn!("{}, sending SIGKILL", timed_out);
        report.warnings.push(timed_out);

        match handle.signal_group(Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => warn!("Failed to send SIGKILL to process group {}: {}", pid, e),
        }

        if self.wait_for_exit(handle, self.config.kill_timeout).await {
            info!("Node {} killed", pid);
            report.outcome = TeardownOutcome::Forced;
        } else {
            let leak = HarnessError::TeardownLeak { pid: pid.as_raw() };
            error!("{}", leak);
            report.warnings.push(leak);
            report.outcome = TeardownOutcome::Leaked;
        }
        report
    }

    /// Runs the configured shutdown command. False when none is configured
    /// or it did not succeed within the grace period.
    async fn request_shutdown(&self, handle: &ProcessHandle) -> bool {
        let Some(shutdown) = &self.config.shutdown else {
            return false;
        };
        let env = self
            .node_env
            .as_ref()
            .map(NodeEnv::cli_environment)
            .unwrap_or_default();
        let runner = CommandRunner::with_timeout(self.config.grace_period);
        match runner.run(&shutdown.cli, &shutdown.args, &env).await {
            Ok(output) if output.success() => {
                info!(
                    "Requested shutdown of node {} via {}",
                    handle.pid(),
                    shutdown.cli.display_name()
                );
                true
            }
            Ok(output) => {
                warn!(
                    "Shutdown command exited with {}: {}",
                    output.status_text(),
                    output.stderr.trim()
                );
                false
            }
            Err(e) => {
                warn!("Shutdown command failed: {}", e);
                false
            }
        }
    }

    fn terminate(&self, handle: &ProcessHandle) {
        info!("Sending SIGTERM to node process group {}", handle.pid());
        match handle.signal_group(Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => warn!("Failed to send SIGTERM to process group {}: {}", handle.pid(), e),
        }
    }

    async fn wait_for_exit(&self, handle: &mut ProcessHandle, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        loop {
            if !handle.is_alive() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            sleep(self.config.liveness_interval.min(deadline - now)).await;
        }
    }

    /// Single node per host: its API address must still be free.
    fn check_single_instance(&self) -> HarnessResult<()> {
        if !self.config.single_instance_check {
            return Ok(());
        }
        let addr = self.launcher.options().api.socket_addr();
        TcpListener::bind(addr)
            .map(drop)
            .map_err(|e| HarnessError::LaunchFailed {
                program: self.launcher.options().daemon.display_name(),
                reason: format!(
                    "API address {} is unavailable ({}); another node instance is likely running",
                    addr, e
                ),
            })
    }

    fn surface(&self, bundle: &DiagnosticsBundle, failure: bool) {
        let dir = self
            .config
            .diagnostics_dir
            .clone()
            .unwrap_or_else(|| self.launcher.options().work_dir.join("diagnostics"));
        match bundle.write_to(&dir) {
            Ok(path) => info!("Diagnostics written to {}", path.display()),
            Err(e) => warn!("Failed to write diagnostics to {}: {}", dir.display(), e),
        }
        if failure {
            eprintln!("{}", bundle.render());
        }
    }

    fn transition(&mut self, next: LifecycleState) {
        debug!("Lifecycle {:?} -> {:?}", self.state, next);
        self.state = next;
    }
}

impl Drop for LifecycleController {
    fn drop(&mut self) {
        let Some(handle) = self.handle.as_mut() else {
            return;
        };
        if !handle.is_alive() {
            return;
        }

        let pid = handle.pid();
        eprintln!("LifecycleController dropped with live node (PID: {}), emergency teardown", pid);
        let bundle = DiagnosticsCollector::collect_local(
            handle.artifacts(),
            "not fetched during emergency teardown",
        );
        eprintln!("{}", bundle.render());

        // No async runtime is guaranteed here, so the waits block.
        if let Err(e) = handle.signal_group(Signal::SIGTERM) {
            if e != Errno::ESRCH {
                eprintln!("Failed to send SIGTERM to process group {}: {}", pid, e);
            }
        }
        if block_until_exit(handle, self.config.grace_period, self.config.liveness_interval) {
            return;
        }

        eprintln!("Node {} ignored SIGTERM, sending SIGKILL", pid);
        if let Err(e) = handle.signal_group(Signal::SIGKILL) {
            if e != Errno::ESRCH {
                eprintln!("Failed to send SIGKILL to process group {}: {}", pid, e);
            }
        }
        if !block_until_exit(handle, self.config.kill_timeout, self.config.liveness_interval) {
            eprintln!("Node {} still alive after SIGKILL", pid);
        }
    }
}

fn block_until_exit(handle: &mut ProcessHandle, limit: Duration, interval: Duration) -> bool {
    let deadline = std::time::Instant::now() + limit;
    while handle.is_alive() {
        if std::time::Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(interval);
    }
    true
}
