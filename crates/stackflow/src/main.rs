mod commands;
mod utils;

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "stackflow")]
#[command(about = "Converge Azure AKS and App Service stacks described in KDL", long_about = None)]
struct Cli {
    /// Stack file (defaults to stack.kdl discovery)
    #[arg(short, long, global = true, env = "STACKFLOW_CONFIG_PATH")]
    file: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Settings that override the stack file for one run
#[derive(Args, Debug, Clone, Default)]
pub struct RunOptions {
    /// Maximum provider operations in flight
    #[arg(long, env = "STACKFLOW_CONCURRENCY")]
    pub concurrency: Option<usize>,

    /// Skip the workload pass (workloads are deployed elsewhere)
    #[arg(long)]
    pub no_workloads: bool,

    /// Azure subscription (defaults to the az CLI's active subscription)
    #[arg(long, env = "AZURE_SUBSCRIPTION_ID")]
    pub subscription: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Converge the stack to its declared state
    Up {
        #[command(flatten)]
        options: RunOptions,
        /// Print sensitive outputs (kubeconfig) in clear text
        #[arg(long)]
        reveal: bool,
    },
    /// Show what `up` would change without changing anything
    Plan {
        #[command(flatten)]
        options: RunOptions,
        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete every resource of the stack in reverse dependency order
    Destroy {
        #[command(flatten)]
        options: RunOptions,
        /// Skip the confirmation
        #[arg(short, long)]
        yes: bool,
    },
    /// Show the outputs recorded by the last `up`
    Outputs {
        /// Print the outputs as JSON
        #[arg(long)]
        json: bool,
    },
    /// Check the stack file and print its resource graph
    Validate,
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    utils::init_tracing(cli.verbose);

    // Version needs no stack file
    if matches!(cli.command, Commands::Version) {
        println!("stackflow {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let code = match cli.command {
        Commands::Up { options, reveal } => {
            commands::up::handle(cli.file.as_deref(), &options, reveal).await?
        }
        Commands::Plan { options, json } => {
            commands::plan::handle(cli.file.as_deref(), &options, json).await?
        }
        Commands::Destroy { options, yes } => {
            commands::destroy::handle(cli.file.as_deref(), &options, yes).await?
        }
        Commands::Outputs { json } => commands::outputs::handle(cli.file.as_deref(), json).await?,
        Commands::Validate => commands::validate::handle(cli.file.as_deref())?,
        Commands::Version => 0,
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
