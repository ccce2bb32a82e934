use clap::{Args, Parser, Subcommand, ValueEnum};
use eyre::eyre;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use node_harness::{
    AllOf, ApiEndpoint, CommandProbe, ControllerConfig, Executable, LaunchOptions, ListeningProbe,
    NormalMode, RunMode, ShutdownCommand, SnapshotImport, SnapshotSource, StatelessMode,
};

type Result<T> = color_eyre::eyre::Result<T>;

/// End-to-end lifecycle harness for a node daemon
#[derive(Parser)]
#[command(name = "node-harness")]
#[command(about = "End-to-end lifecycle harness for a node daemon")]
#[command(version)]
pub struct Cli {
    /// Node daemon binary
    #[arg(long, env = "NODE_HARNESS_DAEMON", default_value = "forest", global = true)]
    pub daemon: PathBuf,

    /// Node CLI binary used for status, query and shutdown commands
    #[arg(long, env = "NODE_HARNESS_CLI", default_value = "forest-cli", global = true)]
    pub cli: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Launch a node, wait until it is ready, run a test command, tear down
    Run(RunArgs),
    /// Print one labeled field of `archive info` for a snapshot file
    Query(QueryArgs),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    Normal,
    Stateless,
}

#[derive(Args)]
pub struct RunArgs {
    /// Run mode
    #[arg(long, value_enum, default_value = "normal")]
    pub mode: ModeArg,

    /// Chain to join
    #[arg(long, default_value = "calibnet")]
    pub chain: String,

    /// Encrypt the node keystore
    #[arg(long)]
    pub encrypt_keystore: bool,

    /// Directory for tokens, logs and diagnostics (default: fresh temp dir)
    #[arg(long)]
    pub work_dir: Option<PathBuf>,

    /// Snapshot file to import
    #[arg(long, conflicts_with = "auto_download_snapshot")]
    pub import_snapshot: Option<PathBuf>,

    /// Let the node download a snapshot itself
    #[arg(long)]
    pub auto_download_snapshot: bool,

    /// Import height; negative values are relative to the snapshot head
    #[arg(long, allow_hyphen_values = true)]
    pub height: Option<i64>,

    /// Import in a separate run that halts before the node is launched
    #[arg(long)]
    pub halt_after_import: bool,

    /// Stateless mode data directory
    #[arg(long)]
    pub stateless_data_dir: Option<PathBuf>,

    /// Stateless mode listening multiaddress
    #[arg(long, default_value = "/ip4/127.0.0.1/tcp/0")]
    pub listen_multiaddr: String,

    /// Ask the node to report its peak RSS
    #[arg(long)]
    pub track_peak_rss: bool,

    /// API host
    #[arg(long, default_value = "127.0.0.1")]
    pub api_host: String,

    /// API port
    #[arg(long, default_value = "2345")]
    pub api_port: u16,

    /// Metrics endpoint captured into diagnostics
    #[arg(long, default_value = node_harness::diagnostics::DEFAULT_METRICS_URL)]
    pub metrics_url: String,

    /// Readiness timeout (seconds)
    #[arg(long, default_value = "1800")]
    pub ready_timeout_secs: u64,

    /// Readiness poll interval (ms)
    #[arg(long, default_value = "1000")]
    pub poll_interval_ms: u64,

    /// Grace period after the shutdown request (seconds)
    #[arg(long, default_value = "10")]
    pub grace_secs: u64,

    /// Time allowed for the node to disappear after SIGKILL (seconds)
    #[arg(long, default_value = "10")]
    pub kill_timeout_secs: u64,

    /// Skip the diagnostics dump when the run succeeds
    #[arg(long)]
    pub quiet_success: bool,

    /// Allow launching while the API address is taken
    #[arg(long)]
    pub allow_shared_host: bool,

    /// Test command run once the node is ready
    #[arg(last = true)]
    pub test_command: Vec<String>,
}

#[derive(Args)]
pub struct QueryArgs {
    /// Snapshot file to inspect
    pub artifact: PathBuf,

    /// Field label, e.g. `Epoch`, `State-roots` or `CAR format`
    #[arg(long, default_value = "Epoch")]
    pub label: String,
}

/// Everything a `run` invocation needs
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub mode: RunMode,
    pub launch: LaunchOptions,
    pub controller: ControllerConfig,
    pub cli: Executable,
    pub test_command: Vec<String>,
}

impl RunConfig {
    /// Convert parsed arguments into launcher and controller configuration
    pub fn from_cli(daemon: PathBuf, cli: PathBuf, args: RunArgs) -> Result<Self> {
        let host: IpAddr = args
            .api_host
            .parse()
            .map_err(|e| eyre!("Invalid API host '{}': {}", args.api_host, e))?;

        let work_dir = args.work_dir.unwrap_or_else(|| {
            std::env::temp_dir().join(format!("node-harness-{}", uuid::Uuid::new_v4()))
        });

        let snapshot = match (args.import_snapshot, args.auto_download_snapshot) {
            (Some(path), _) => Some(SnapshotSource::Path(path)),
            (None, true) => Some(SnapshotSource::AutoDownload),
            (None, false) => None,
        }
        .map(|source| SnapshotImport {
            source,
            height: args.height,
            halt_after_import: args.halt_after_import,
        });

        let mode = match args.mode {
            ModeArg::Normal => RunMode::Normal(NormalMode { snapshot }),
            ModeArg::Stateless => {
                if snapshot.is_some() {
                    return Err(eyre!("Stateless mode does not import snapshots"));
                }
                let defaults = StatelessMode::default();
                RunMode::Stateless(StatelessMode {
                    data_dir: args.stateless_data_dir.unwrap_or(defaults.data_dir),
                    listen_multiaddr: args.listen_multiaddr,
                    ..defaults
                })
            }
        };

        let mut launch = LaunchOptions::new(Executable::new(daemon), work_dir);
        launch.chain = args.chain;
        launch.encrypt_keystore = args.encrypt_keystore;
        launch.track_peak_rss = args.track_peak_rss;
        launch.api = ApiEndpoint::new(host, args.api_port);

        let cli = Executable::new(cli);
        let controller = ControllerConfig {
            ready_timeout: Duration::from_secs(args.ready_timeout_secs),
            poll_interval: Duration::from_millis(args.poll_interval_ms),
            grace_period: Duration::from_secs(args.grace_secs),
            kill_timeout: Duration::from_secs(args.kill_timeout_secs),
            shutdown: Some(ShutdownCommand::new(cli.clone())),
            metrics_url: Some(args.metrics_url),
            diagnostics_on_success: !args.quiet_success,
            single_instance_check: !args.allow_shared_host,
            ..ControllerConfig::default()
        };

        Ok(RunConfig {
            mode,
            launch,
            controller,
            cli,
            test_command: args.test_command,
        })
    }

    /// API port accepting connections, then `sync wait` against the node
    pub fn readiness_probe(&self) -> AllOf {
        AllOf(vec![
            Box::new(ListeningProbe(self.launch.api)),
            Box::new(CommandProbe::new(self.cli.clone(), ["sync", "wait"]).with_api(self.launch.api)),
        ])
    }
}
