use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use switchboard::{Config, Registries, Supervisor};

/// Switchboard - voice assistant orchestrator
#[derive(Parser)]
#[command(name = "switchboard", version, about)]
struct Cli {
    /// Configuration file (YAML or TOML)
    #[arg(short, long, env = "SWITCHBOARD_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start every enabled module (default)
    Run,
    /// Validate the configuration without starting anything
    Check,
    /// List registered module types
    Types,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info,switchboard=info",
        1 => "info,switchboard=debug",
        2 => "debug",
        _ => "trace",
    };

    // RUST_LOG wins over -v
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    match cli.command.unwrap_or(Command::Run) {
        Command::Run => serve(cli.config).await.map(|()| ExitCode::SUCCESS),
        Command::Check => check(cli.config),
        Command::Types => {
            types()?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn serve(path: Option<PathBuf>) -> anyhow::Result<()> {
    let config = Config::load(path.as_deref())?;
    tracing::debug!(?config, "loaded configuration");

    let registries = Registries::builtin()?;
    let mut system = Supervisor::new(config, registries).start().await?;

    let report = system.report();
    if report.started.is_empty() {
        tracing::warn!("no modules started");
    }
    eprint!("{report}");
    tracing::info!("switchboard ready");

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            tracing::info!("interrupted");
        }
        origin = system.wait_for_stop() => {
            tracing::info!(origin = origin.as_deref().unwrap_or("unknown"), "stop requested");
        }
    }

    system.shutdown().await;
    Ok(())
}

fn check(path: Option<PathBuf>) -> anyhow::Result<ExitCode> {
    let config = Config::load(path.as_deref())?;
    let report = Supervisor::new(config, Registries::builtin()?).check();

    print!("{report}");
    if report.is_healthy() {
        println!("configuration ok");
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

fn types() -> anyhow::Result<()> {
    let registries = Registries::builtin()?;
    println!("inputs:  {}", registries.inputs.names().join(", "));
    println!("outputs: {}", registries.outputs.names().join(", "));
    println!("tools:   {}", registries.tools.types().join(", "));
    Ok(())
}
