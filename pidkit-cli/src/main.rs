//! Developer CLI for `PidKit`.
//!
//! Runs the PID acquisition end to end against the in-memory card reader and issuer, so the
//! orchestration can be exercised without an eID card or a running issuer.

use clap::{Parser, Subcommand};
use pidkit_core::PID_ACQUISITION_STEPS;
use tracing_subscriber::EnvFilter;

mod simulate;

#[derive(Parser)]
#[command(
    name = "pidkit",
    version,
    about = "Runs the PID acquisition against a simulated eID card and issuer"
)]
struct Cli {
    /// Debug output, including the flow's internal logs
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a full acquisition with scripted card and issuer behavior
    Simulate(simulate::SimulateArgs),

    /// Print the step sequence with its progress weights
    Steps,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Command::Simulate(args) => simulate::run(args).await,
        Command::Steps => {
            for step in PID_ACQUISITION_STEPS {
                let kind = if step.is_alternative {
                    " (alternative)"
                } else {
                    ""
                };
                println!("{:>3}%  {}{kind}", step.progress_weight, step.id);
            }
            Ok(())
        }
    }
}

fn setup_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    // `log` records from pidkit-core are forwarded through tracing-log
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbose)
        .init();
}
