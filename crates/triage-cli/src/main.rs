mod cmd;
mod output;

use clap::{Parser, Subcommand};
use cmd::RuntimeArgs;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "triage-party",
    about = "Find the issues and pull requests that need a maintainer's attention",
    version,
    propagate_version = true
)]
struct Cli {
    /// Triage configuration file
    #[arg(long, global = true, env = "TRIAGE_CONFIG", default_value = "config/config.yaml")]
    config: PathBuf,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    /// More logging (-v info, -vv debug)
    #[arg(long, short = 'v', global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve collections over HTTP, refreshing them in the background
    Serve {
        /// Port to listen on
        #[arg(long, default_value = "8080", env = "PORT")]
        port: u16,

        #[command(flatten)]
        runtime: RuntimeArgs,
    },

    /// Refresh one collection and print it
    Run {
        /// Collection id
        #[arg(long)]
        collection: String,

        #[command(flatten)]
        runtime: RuntimeArgs,
    },

    /// Load and compile the configuration without fetching anything
    Validate,
}

fn main() {
    let cli = Cli::parse();

    let default_level = match (cli.verbose, &cli.command) {
        (0, Commands::Serve { .. }) => tracing::Level::INFO,
        (0, _) => tracing::Level::WARN,
        (1, _) => tracing::Level::INFO,
        _ => tracing::Level::DEBUG,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Commands::Serve { port, runtime } => cmd::serve::run(&cli.config, &runtime, port),
        Commands::Run {
            collection,
            runtime,
        } => cmd::run::run(&cli.config, &runtime, &collection, cli.json),
        Commands::Validate => cmd::validate::run(&cli.config, cli.json),
    };

    if let Err(e) = result {
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
