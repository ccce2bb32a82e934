//! Bounded readiness polling against a launched node.

use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::command::{CommandRunner, Executable};
use crate::environment::{ApiEndpoint, Environment, NodeEnv};
use crate::launcher::ProcessHandle;

/// Outcome of one poll session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessResult {
    Ready,
    TimedOut,
}

impl ReadinessResult {
    pub fn is_ready(self) -> bool {
        self == ReadinessResult::Ready
    }
}

/// A single readiness check. Returning `false` means "not yet".
#[async_trait]
pub trait ReadinessProbe: Send {
    async fn probe(&mut self, handle: &ProcessHandle) -> bool;
}

/// Probe backed by a synchronous closure.
pub struct FnProbe<F>(pub F);

#[async_trait]
impl<F> ReadinessProbe for FnProbe<F>
where
    F: FnMut(&ProcessHandle) -> bool + Send,
{
    async fn probe(&mut self, handle: &ProcessHandle) -> bool {
        (self.0)(handle)
    }
}

/// Ready when a command exits successfully.
///
/// With [`CommandProbe::with_api`] the command receives the node's API info,
/// built from the token the node wrote, so CLI status commands such as
/// `sync wait` can reach it.
#[derive(Debug, Clone)]
pub struct CommandProbe {
    runner: CommandRunner,
    exe: Executable,
    args: Vec<String>,
    api: Option<ApiEndpoint>,
}

impl CommandProbe {
    pub fn new<I, S>(exe: Executable, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            runner: CommandRunner::new(),
            exe,
            args: args.into_iter().map(Into::into).collect(),
            api: None,
        }
    }

    pub fn with_api(mut self, api: ApiEndpoint) -> Self {
        self.api = Some(api);
        self
    }

    pub fn with_runner(mut self, runner: CommandRunner) -> Self {
        self.runner = runner;
        self
    }
}

#[async_trait]
impl ReadinessProbe for CommandProbe {
    async fn probe(&mut self, handle: &ProcessHandle) -> bool {
        let env = match self.api {
            Some(api) => match handle.token() {
                Some(token) => NodeEnv::new(token, &api).cli_environment(),
                None => return false,
            },
            None => Environment::new(),
        };

        match self.runner.run(&self.exe, &self.args, &env).await {
            Ok(output) if output.success() => true,
            Ok(output) => {
                debug!(
                    "Probe {} not ready ({}): {}",
                    self.exe.display_name(),
                    output.status_text(),
                    output.stderr.trim()
                );
                false
            }
            Err(e) => {
                warn!("Probe {} failed to run: {}", self.exe.display_name(), e);
                false
            }
        }
    }
}

/// Ready when the API endpoint accepts TCP connections.
#[derive(Debug, Clone, Copy)]
pub struct ListeningProbe(pub ApiEndpoint);

#[async_trait]
impl ReadinessProbe for ListeningProbe {
    async fn probe(&mut self, _handle: &ProcessHandle) -> bool {
        TcpStream::connect(self.0.socket_addr()).await.is_ok()
    }
}

/// Ready when every inner probe is, checked in order.
pub struct AllOf(pub Vec<Box<dyn ReadinessProbe>>);

#[async_trait]
impl ReadinessProbe for AllOf {
    async fn probe(&mut self, handle: &ProcessHandle) -> bool {
        for probe in self.0.iter_mut() {
            if !probe.probe(handle).await {
                return false;
            }
        }
        true
    }
}

/// Polls a probe at a fixed interval until it passes or a deadline elapses.
#[derive(Debug, Clone, Copy)]
pub struct ReadinessPoller {
    interval: Duration,
}

impl Default for ReadinessPoller {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl ReadinessPoller {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Waits for `probe` to pass, giving up after `limit`.
    ///
    /// The probe only runs once the node's token file exists; a token alone
    /// never counts as ready. Each probe call is bounded by the time left
    /// before the deadline. A node that exits while being polled ends the
    /// session early as [`ReadinessResult::TimedOut`].
    ///
    /// # Arguments
    /// * `handle` - Launched node, checked for liveness between probes
    /// * `probe` - Readiness check run once the token file exists
    /// * `limit` - Ceiling on the whole wait
    ///
    /// # Returns
    /// * `ReadinessResult` - `Ready` or `TimedOut`
    pub async fn wait_ready<P>(
        &self,
        handle: &mut ProcessHandle,
        probe: &mut P,
        limit: Duration,
    ) -> ReadinessResult
    where
        P: ReadinessProbe + ?Sized,
    {
        let deadline = Instant::now() + limit;
        let mut attempts = 0u32;

        info!("Waiting up to {:?} for node {} to become ready", limit, handle.pid());

        loop {
            if !handle.is_alive() {
                warn!(
                    "Node {} exited while waiting for readiness ({:?})",
                    handle.pid(),
                    handle.exit_status()
                );
                return ReadinessResult::TimedOut;
            }

            if handle.token_path().exists() {
                attempts += 1;
                let remaining = deadline.saturating_duration_since(Instant::now());
                match timeout(remaining, probe.probe(handle)).await {
                    Ok(true) => {
                        info!(
                            "Node {} ready after {:?} ({} probe attempts)",
                            handle.pid(),
                            handle.uptime(),
                            attempts
                        );
                        return ReadinessResult::Ready;
                    }
                    Ok(false) => debug!("Readiness probe attempt {} not ready", attempts),
                    Err(_) => break,
                }
            } else {
                debug!("Token file {} not written yet", handle.token_path().display());
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            sleep(self.interval.min(deadline - now)).await;
        }

        warn!(
            "Node {} not ready after {:?} ({} probe attempts)",
            handle.pid(),
            limit,
            attempts
        );
        ReadinessResult::TimedOut
    }
}
