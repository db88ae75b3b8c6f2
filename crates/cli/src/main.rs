//! VM Agent CLI
//!
//! An operator tool for checking an agent configuration by hand: probing the
//! API key, fetching manager endpoints, dry-running trigger matching and
//! running a single action.

mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{actions, manager, KeyValue};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// VM Agent CLI
#[derive(Parser)]
#[command(name = "vmagent")]
#[command(author, version, about = "CLI for the VM Agent event engine", long_about = None)]
pub struct Cli {
    /// Agent configuration file (can also be set via AGENT_CONFIG_PATH env var)
    #[arg(long, short, env = "AGENT_CONFIG_PATH", default_value = "agent.yaml")]
    pub config: PathBuf,

    /// Output format
    #[arg(long, short, default_value = "table")]
    pub format: output::OutputFormat,

    /// Enable verbose output
    #[arg(long, short)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check the configured API key against the manager
    Probe,

    /// Fetch a manager endpoint and print its fields
    Get {
        /// Endpoint path, may contain {placeholders}
        endpoint: String,

        /// Extra context values (key=value), repeatable
        #[arg(long = "set", value_name = "KEY=VALUE")]
        set: Vec<KeyValue>,
    },

    /// Show which trigger a line fires and the parameters it would map
    Match {
        /// Monitor name from the configuration
        monitor: String,

        /// Log line to evaluate
        line: String,
    },

    /// Run one action end-to-end
    Run {
        /// Action name from the configuration
        action: String,

        /// Capture values for the action context (key=value), repeatable
        #[arg(long = "set", value_name = "KEY=VALUE")]
        set: Vec<KeyValue>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Probe => {
            manager::probe(&cli.config, cli.format).await?;
        }
        Commands::Get { endpoint, set } => {
            manager::get_endpoint(&cli.config, &endpoint, set, cli.format).await?;
        }
        Commands::Match { monitor, line } => {
            actions::match_line(&cli.config, &monitor, &line, cli.format)?;
        }
        Commands::Run { action, set } => {
            actions::run_action(&cli.config, &action, set, cli.format).await?;
        }
    }

    Ok(())
}

/// Logs go to stderr so table and JSON output stay clean
fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
