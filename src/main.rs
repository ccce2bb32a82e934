type Result<T> = color_eyre::eyre::Result<T>;

mod cli;

use clap::Parser;
use eyre::eyre;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::{Cli, Command, QueryArgs, RunConfig};
use node_harness::{
    CommandRunner, Executable, LifecycleController, NodeEnv, ProcessLauncher, Query,
    QueryTarget,
};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run(args) => {
            let config = RunConfig::from_cli(cli.daemon, cli.cli, args)?;
            run(config).await
        }
        Command::Query(args) => query(Executable::new(cli.cli), args).await,
    }
}

/// Launch, wait for readiness, run the test command, always tear down
async fn run(config: RunConfig) -> Result<()> {
    info!("Work directory: {}", config.launch.work_dir.display());

    let mut probe = config.readiness_probe();
    let launcher = ProcessLauncher::new(config.launch.clone());
    let mut controller = LifecycleController::new(launcher, config.controller.clone());

    let test_command = config.test_command.clone();
    controller
        .run(&config.mode, &mut probe, |env| run_test_command(test_command, env))
        .await?;

    info!("Run finished");
    Ok(())
}

async fn run_test_command(command: Vec<String>, env: NodeEnv) -> Result<()> {
    let Some((program, args)) = command.split_first() else {
        info!("Node ready, no test command given");
        return Ok(());
    };

    info!("Node ready, running test command: {:?}", command);
    let output = CommandRunner::new()
        .run(&Executable::new(program), args, &env.test_environment())
        .await?;

    print!("{}", output.stdout);
    eprint!("{}", output.stderr);

    if !output.success() {
        return Err(eyre!("Test command failed with {}", output.status_text()));
    }
    Ok(())
}

async fn query(cli: Executable, args: QueryArgs) -> Result<()> {
    let value = Query::new(cli)
        .query(QueryTarget::Artifact(&args.artifact), &["archive", "info"], &args.label)
        .await?;
    println!("{}", value);
    Ok(())
}
