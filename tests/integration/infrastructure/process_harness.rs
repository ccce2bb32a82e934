use anyhow::{Context, Result};
use nix::unistd::Pid;
use node_harness::{
    ApiEndpoint, ControllerConfig, Executable, LaunchOptions, LifecycleController,
    ProcessLauncher, ShutdownCommand,
};
use std::net::{IpAddr, Ipv4Addr, TcpListener};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

/// How the fake daemon reacts once launched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonBehavior {
    /// Writes its token and exits cleanly on SIGTERM
    Cooperative,
    /// Writes its token and takes a moment to exit on SIGTERM
    SlowToExit,
    /// Writes its token and ignores SIGTERM
    IgnoresSigterm,
    /// Writes its token, then exits by itself shortly after
    ExitsAfterStart,
    /// Runs but never writes a token
    NeverWritesToken,
}

impl DaemonBehavior {
    fn script_tail(self) -> &'static str {
        match self {
            DaemonBehavior::Cooperative => {
                r#"trap 'echo "node stopping" >> "$logdir/node.log"; exit 0' TERM
sleep 0.2
echo "fake-admin-token" > "$token"
while true; do sleep 0.1; done
"#
            }
            DaemonBehavior::SlowToExit => {
                r#"trap 'sleep 0.3; echo "node stopping" >> "$logdir/node.log"; exit 0' TERM
echo "fake-admin-token" > "$token"
while true; do sleep 0.1; done
"#
            }
            DaemonBehavior::IgnoresSigterm => {
                r#"trap '' TERM
echo "fake-admin-token" > "$token"
while true; do sleep 0.1; done
"#
            }
            DaemonBehavior::ExitsAfterStart => {
                r#"echo "fake-admin-token" > "$token"
sleep 0.3
echo "node exiting on its own" >> "$logdir/node.log"
exit 0
"#
            }
            DaemonBehavior::NeverWritesToken => {
                r#"trap 'exit 0' TERM
while true; do sleep 0.1; done
"#
            }
        }
    }
}

const DAEMON_HEAD: &str = r#"#!/bin/sh
token=""
logdir=""
config=""
halt=""
for arg in "$@"; do echo "arg: $arg"; done
while [ $# -gt 0 ]; do
  case "$1" in
    --save-token) token="$2"; shift ;;
    --log-dir) logdir="$2"; shift ;;
    --config) config="$2"; shift ;;
    --halt-after-import) halt=1 ;;
  esac
  shift
done
if [ -n "$halt" ]; then
  echo "import" >> "$FAKE_NODE_WORK/imports"
  exit 0
fi
mkdir -p "$logdir"
echo $$ > "$FAKE_NODE_WORK/node.pid"
echo "node starting" >> "$logdir/node.log"
if [ -n "$config" ]; then cp "$config" "$FAKE_NODE_WORK/config.seen"; fi
"#;

const CLI_SCRIPT: &str = r#"#!/bin/sh
case "$1" in
  sync)
    [ -n "$FULLNODE_API_INFO" ] || { echo "no api info" >&2; exit 1; }
    echo "caught up"
    ;;
  stats)
    echo "Network: calibnet"
    echo "Epoch: 12345"
    echo "API: $FULLNODE_API_INFO"
    ;;
  archive)
    [ -f "$3" ] || { echo "no such archive: $3" >&2; exit 1; }
    echo "CAR format: v2"
    echo "Network: calibnet"
    echo "Epoch: 4242"
    echo "State-roots: 900"
    ;;
  db)
    echo "Database path: /tmp/db"
    echo "Database size: 1 GiB"
    ;;
  shutdown)
    echo "called" > "$(dirname "$2")/shutdown-called"
    kill -TERM "$(cat "$2")"
    ;;
  *)
    echo "unknown command: $1" >&2
    exit 2
    ;;
esac
"#;

/// A fake node daemon and CLI, scripted in sh, living in a temp directory
pub struct NodeTestHarness {
    temp_dir: TempDir,
    daemon_script: PathBuf,
    cli_script: PathBuf,
    api_port: u16,
}

impl NodeTestHarness {
    /// Write the fake daemon and CLI scripts for the given behavior
    pub fn new(behavior: DaemonBehavior) -> Result<Self> {
        let temp_dir = TempDir::new().context("Failed to create temporary directory")?;
        let daemon_script = temp_dir.path().join("fake-daemon.sh");
        let cli_script = temp_dir.path().join("fake-cli.sh");

        std::fs::write(&daemon_script, format!("{}{}", DAEMON_HEAD, behavior.script_tail()))
            .context("Failed to write fake daemon")?;
        std::fs::write(&cli_script, CLI_SCRIPT).context("Failed to write fake CLI")?;
        std::fs::create_dir_all(temp_dir.path().join("work"))?;

        Ok(Self {
            temp_dir,
            daemon_script,
            cli_script,
            api_port: free_port()?,
        })
    }

    pub fn temp_path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn work_dir(&self) -> PathBuf {
        self.temp_dir.path().join("work")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.work_dir().join("node.pid")
    }

    pub fn shutdown_marker(&self) -> PathBuf {
        self.work_dir().join("shutdown-called")
    }

    /// Scripts run through `sh` so they never need the exec bit
    pub fn daemon(&self) -> Executable {
        Executable::new("sh").with_base_args([self.daemon_script.display().to_string()])
    }

    pub fn cli(&self) -> Executable {
        Executable::new("sh").with_base_args([self.cli_script.display().to_string()])
    }

    pub fn api(&self) -> ApiEndpoint {
        ApiEndpoint::new(IpAddr::V4(Ipv4Addr::LOCALHOST), self.api_port)
    }

    pub fn launch_options(&self) -> LaunchOptions {
        let mut options = LaunchOptions::new(self.daemon(), self.work_dir());
        options.api = self.api();
        options
            .environment
            .set("FAKE_NODE_WORK", self.work_dir().display().to_string());
        options
    }

    pub fn launcher(&self) -> ProcessLauncher {
        ProcessLauncher::new(self.launch_options())
    }

    /// Short timeouts so failure paths finish quickly
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            ready_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(50),
            grace_period: Duration::from_secs(2),
            kill_timeout: Duration::from_secs(2),
            liveness_interval: Duration::from_millis(50),
            shutdown: Some(ShutdownCommand::with_args(
                self.cli(),
                ["shutdown".to_string(), self.pid_file().display().to_string()],
            )),
            metrics_url: None,
            ..ControllerConfig::default()
        }
    }

    pub fn controller(&self) -> LifecycleController {
        self.controller_with(self.controller_config())
    }

    pub fn controller_with(&self, config: ControllerConfig) -> LifecycleController {
        LifecycleController::new(self.launcher(), config)
    }

    /// PID the fake daemon recorded for itself
    pub fn recorded_pid(&self) -> Result<Pid> {
        let raw = std::fs::read_to_string(self.pid_file()).context("Failed to read pid file")?;
        Ok(Pid::from_raw(raw.trim().parse().context("Invalid pid file")?))
    }
}

/// Find a free local port to use as the node API port
fn free_port() -> Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0").context("Failed to bind to find free port")?;
    Ok(listener.local_addr()?.port())
}

/// Signal-0 liveness check by PID
pub fn pid_alive(pid: Pid) -> bool {
    nix::sys::signal::kill(pid, None).is_ok()
}
