//! depotd: the depot orchestrator daemon.
//!
//! Assembles the orchestrator subsystems in one process:
//! - Key-value tables (redb or DynamoDB)
//! - Gateway backend (local processes, ECS or Kubernetes)
//! - Importer (Fargate or Kubernetes, optional)
//! - Version manager
//! - Region updaters and sweeps
//! - Control API
//!
//! # Usage
//!
//! ```text
//! depotd serve --config depot.toml
//! depotd config --config depot.toml --keyvalue dynamo
//! ```

mod cli;
mod orchestrator;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Command, LogFormat};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Serve(args) => orchestrator::run(args.load()?).await,
        Command::Config(args) => {
            let config = orchestrator::effective_config(args.load()?).await?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,depotd=debug,depot=debug"));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}
