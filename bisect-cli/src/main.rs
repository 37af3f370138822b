// Bisect CLI
// Command line driver for regression bisection jobs

mod commands;
mod output;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use tracing_subscriber::EnvFilter;

use bisect_service::EngineConfig;

/// Find the change that introduced a performance regression
#[derive(Parser, Debug)]
#[command(name = "bisect", version, about)]
struct Cli {
    /// Engine configuration file (default: ~/.bisect/config.yaml)
    #[arg(long, short = 'c', global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log debug output
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a job against the configured backend services
    Run(commands::run::RunArgs),

    /// Run a job against a simulated commit history
    Simulate(commands::simulate::SimulateArgs),

    /// Find change points in a series of values
    Detect(commands::detect::DetectArgs),

    /// Estimate how long a job will take from past timings
    Estimate(commands::estimate::EstimateArgs),
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Run(args) => {
            let config = EngineConfig::load(cli.config.as_deref())?;
            commands::run::execute(args, config).await
        }
        Command::Simulate(args) => {
            let config = EngineConfig::load(cli.config.as_deref())?;
            commands::simulate::execute(args, config).await
        }
        Command::Detect(args) => commands::detect::execute(args),
        Command::Estimate(args) => commands::estimate::execute(args),
    }
}
