use chrono::{DateTime, Local};
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::{Duration, Instant};
use tokio::process::Child;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::command::{CommandOutput, CommandRunner, Executable};
use crate::environment::{ApiEndpoint, Environment};
use crate::error::{HarnessError, HarnessResult};

/// Delay before the single retry of a token read.
const TOKEN_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Where a snapshot to import comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotSource {
    /// Let the daemon download the latest snapshot for its chain.
    AutoDownload,
    Path(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotImport {
    pub source: SnapshotSource,
    /// Height passed as `--height`; negative values are relative to the head.
    pub height: Option<i64>,
    /// Import in a separate blocking run that halts once the import is done.
    pub halt_after_import: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalMode {
    pub snapshot: Option<SnapshotImport>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatelessMode {
    pub data_dir: PathBuf,
    pub listen_multiaddr: String,
    pub skip_load_actors: bool,
    pub no_gc: bool,
}

impl Default for StatelessMode {
    fn default() -> Self {
        Self {
            data_dir: std::env::temp_dir().join("stateless_node_data"),
            listen_multiaddr: "/ip4/127.0.0.1/tcp/0".to_string(),
            skip_load_actors: true,
            no_gc: true,
        }
    }
}

/// How the daemon is run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunMode {
    Normal(NormalMode),
    Stateless(StatelessMode),
}

impl RunMode {
    pub fn name(&self) -> &'static str {
        match self {
            RunMode::Normal(_) => "normal",
            RunMode::Stateless(_) => "stateless",
        }
    }
}

/// Config file read by a stateless daemon.
#[derive(Debug, Serialize)]
struct StatelessConfigFile<'a> {
    client: ClientSection<'a>,
    network: NetworkSection<'a>,
}

#[derive(Debug, Serialize)]
struct ClientSection<'a> {
    data_dir: &'a Path,
}

#[derive(Debug, Serialize)]
struct NetworkSection<'a> {
    listening_multiaddrs: Vec<&'a str>,
}

/// Renders the TOML config payload for a stateless run.
pub fn stateless_config(mode: &StatelessMode) -> HarnessResult<String> {
    let file = StatelessConfigFile {
        client: ClientSection {
            data_dir: &mode.data_dir,
        },
        network: NetworkSection {
            listening_multiaddrs: vec![mode.listen_multiaddr.as_str()],
        },
    };
    Ok(toml::to_string(&file)?)
}

/// Launch settings shared by every run mode.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    /// Daemon executable
    pub daemon: Executable,
    /// Chain the daemon joins
    pub chain: String,
    /// Whether the daemon encrypts its keystore
    pub encrypt_keystore: bool,
    /// Directory holding tokens, configs, output captures and logs
    pub work_dir: PathBuf,
    /// Ask the daemon to report its peak resident set size
    pub track_peak_rss: bool,
    /// Where the daemon serves its API
    pub api: ApiEndpoint,
    /// Appended verbatim after the generated flags
    pub extra_args: Vec<String>,
    /// Extra environment for the daemon
    pub environment: Environment,
}

impl LaunchOptions {
    pub fn new(daemon: Executable, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            daemon,
            chain: "calibnet".to_string(),
            encrypt_keystore: false,
            work_dir: work_dir.into(),
            track_peak_rss: false,
            api: ApiEndpoint::default(),
            extra_args: Vec::new(),
            environment: Environment::new(),
        }
    }

    pub fn log_dir(&self) -> PathBuf {
        self.work_dir.join("logs")
    }

    pub fn token_path(&self, mode: &RunMode) -> PathBuf {
        match mode {
            RunMode::Normal(_) => self.work_dir.join("admin_token"),
            RunMode::Stateless(_) => self.work_dir.join("stateless_admin_token"),
        }
    }

    pub fn config_path(&self) -> PathBuf {
        self.work_dir.join("stateless_config.toml")
    }

    pub fn artifacts(&self, mode: &RunMode) -> RunArtifacts {
        RunArtifacts {
            log_dir: self.log_dir(),
            stdout: self.work_dir.join("node.out"),
            stderr: self.work_dir.join("node.err"),
            token_path: self.token_path(mode),
        }
    }

    fn common_args(&self) -> Vec<String> {
        vec![
            "--chain".to_string(),
            self.chain.clone(),
            "--encrypt-keystore".to_string(),
            self.encrypt_keystore.to_string(),
        ]
    }
}

/// Files a launched node writes and the harness reads back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunArtifacts {
    pub log_dir: PathBuf,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
    pub token_path: PathBuf,
}

/// One launched daemon instance, addressed by the PID captured at spawn.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: Pid,
    child: Child,
    artifacts: RunArtifacts,
    mode: &'static str,
    launched_at: DateTime<Local>,
    started: Instant,
}

impl ProcessHandle {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn mode(&self) -> &'static str {
        self.mode
    }

    pub fn token_path(&self) -> &Path {
        &self.artifacts.token_path
    }

    pub fn log_dir(&self) -> &Path {
        &self.artifacts.log_dir
    }

    pub fn artifacts(&self) -> &RunArtifacts {
        &self.artifacts
    }

    pub fn launched_at(&self) -> DateTime<Local> {
        self.launched_at
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Queries the OS; never cached. Reaps the child once it has exited.
    pub fn is_alive(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(Some(_)) => false,
            Ok(None) => true,
            Err(e) => {
                debug!("try_wait on {} failed ({}), probing with signal 0", self.pid, e);
                kill(self.pid, None).is_ok()
            }
        }
    }

    /// Exit status, if the process has been observed to exit.
    pub fn exit_status(&mut self) -> Option<ExitStatus> {
        self.child.try_wait().ok().flatten()
    }

    /// Reads the token file synchronously; `None` while it is missing or empty.
    pub fn token(&self) -> Option<String> {
        fs::read_to_string(&self.artifacts.token_path)
            .ok()
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty())
    }

    /// Reads the token file, retrying once after a short delay if it is missing.
    pub async fn read_token(&self) -> Option<String> {
        if let Some(token) = self.token() {
            return Some(token);
        }
        debug!(
            "Token file {} not present yet, retrying",
            self.artifacts.token_path.display()
        );
        sleep(TOKEN_RETRY_DELAY).await;
        self.token()
    }

    /// Sends `signal` to the process group led by this process.
    pub fn signal_group(&self, signal: Signal) -> nix::Result<()> {
        debug!("Sending signal {:?} to process group {}", signal, self.pid);
        killpg(self.pid, signal)
    }
}

/// Starts the daemon in a given run mode.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    runner: CommandRunner,
    options: LaunchOptions,
}

impl ProcessLauncher {
    pub fn new(options: LaunchOptions) -> Self {
        Self {
            runner: CommandRunner::new(),
            options,
        }
    }

    pub fn options(&self) -> &LaunchOptions {
        &self.options
    }

    pub fn artifacts(&self, mode: &RunMode) -> RunArtifacts {
        self.options.artifacts(mode)
    }

    /// Full daemon command line for a detached launch in `mode`.
    pub fn build_args(&self, mode: &RunMode) -> Vec<String> {
        let options = &self.options;
        let mut args = options.common_args();
        args.push("--log-dir".to_string());
        args.push(options.log_dir().display().to_string());
        args.push("--save-token".to_string());
        args.push(options.token_path(mode).display().to_string());
        args.push("--rpc-address".to_string());
        args.push(options.api.socket_addr().to_string());
        if options.track_peak_rss {
            args.push("--track-peak-rss".to_string());
        }

        match mode {
            RunMode::Normal(normal) => {
                if let Some(import) = normal.snapshot.as_ref().filter(|i| !i.halt_after_import) {
                    args.extend(import_args(import));
                }
            }
            RunMode::Stateless(stateless) => {
                args.push("--config".to_string());
                args.push(options.config_path().display().to_string());
                args.push("--stateless".to_string());
                if stateless.no_gc {
                    args.push("--no-gc".to_string());
                }
                if stateless.skip_load_actors {
                    args.push("--skip-load-actors".to_string());
                }
            }
        }

        args.extend(options.extra_args.iter().cloned());
        args
    }

    /// Command line of the blocking pre-import run.
    pub fn build_import_args(&self, import: &SnapshotImport) -> Vec<String> {
        let mut args = self.options.common_args();
        args.extend(import_args(import));
        args.push("--halt-after-import".to_string());
        args
    }

    /// Imports a snapshot in a blocking daemon run that exits when done.
    pub async fn import_snapshot(&self, import: &SnapshotImport) -> HarnessResult<CommandOutput> {
        let args = self.build_import_args(import);
        info!("Importing snapshot: {} {:?}", self.options.daemon.display_name(), args);
        self.runner
            .run(&self.options.daemon, &args, &self.options.environment)
            .await
    }

    /// Spawns the daemon detached. The returned handle is live, not ready.
    ///
    /// # Arguments
    /// * `mode` - Normal or stateless run, with its import or config settings
    ///
    /// # Returns
    /// * `HarnessResult<ProcessHandle>` - Handle owning the daemon's PID
    pub async fn launch(&self, mode: &RunMode) -> HarnessResult<ProcessHandle> {
        let program = self.options.daemon.display_name();
        let launch_failed = |reason: String| HarnessError::LaunchFailed {
            program: program.clone(),
            reason,
        };

        let artifacts = self.artifacts(mode);
        fs::create_dir_all(&artifacts.log_dir)
            .map_err(|e| launch_failed(format!("creating {}: {}", artifacts.log_dir.display(), e)))?;

        match mode {
            RunMode::Normal(NormalMode {
                snapshot: Some(import),
            }) if import.halt_after_import => {
                let output = self
                    .import_snapshot(import)
                    .await
                    .map_err(|e| launch_failed(format!("snapshot import: {}", e)))?;
                if !output.success() {
                    return Err(launch_failed(format!(
                        "snapshot import exited with {}: {}",
                        output.status_text(),
                        output.stderr.trim()
                    )));
                }
            }
            RunMode::Stateless(stateless) => {
                self.write_stateless_config(stateless)
                    .map_err(|e| launch_failed(format!("writing stateless config: {}", e)))?;
            }
            RunMode::Normal(_) => {}
        }

        if artifacts.token_path.exists() {
            warn!("Removing stale token file {}", artifacts.token_path.display());
            fs::remove_file(&artifacts.token_path)
                .map_err(|e| launch_failed(format!("removing stale token: {}", e)))?;
        }

        let args = self.build_args(mode);
        info!("Launching {} node: {} {:?}", mode.name(), program, args);

        let child = self
            .runner
            .spawn_detached(
                &self.options.daemon,
                &args,
                &self.options.environment,
                &artifacts.stdout,
                &artifacts.stderr,
            )
            .map_err(|e| launch_failed(e.to_string()))?;

        let raw_pid = child
            .id()
            .ok_or_else(|| launch_failed("process exited before its PID was read".to_string()))?;
        let pid = Pid::from_raw(
            i32::try_from(raw_pid).map_err(|e| launch_failed(format!("invalid PID {}: {}", raw_pid, e)))?,
        );

        info!("Node launched with PID: {}", pid);
        Ok(ProcessHandle {
            pid,
            child,
            artifacts,
            mode: mode.name(),
            launched_at: Local::now(),
            started: Instant::now(),
        })
    }

    /// Writes and flushes the config before the daemon can read it.
    fn write_stateless_config(&self, mode: &StatelessMode) -> HarnessResult<()> {
        let path = self.options.config_path();
        let payload = stateless_config(mode)?;
        let mut file = File::create(&path)?;
        file.write_all(payload.as_bytes())?;
        file.sync_all()?;
        debug!("Wrote stateless config to {}", path.display());
        Ok(())
    }
}

fn import_args(import: &SnapshotImport) -> Vec<String> {
    let mut args = Vec::new();
    match &import.source {
        SnapshotSource::AutoDownload => args.push("--auto-download-snapshot".to_string()),
        SnapshotSource::Path(path) => {
            args.push("--import-snapshot".to_string());
            args.push(path.display().to_string());
        }
    }
    if let Some(height) = import.height {
        // Single token so a negative height is not parsed as a flag.
        args.push(format!("--height={}", height));
    }
    args
}
