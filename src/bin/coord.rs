//! Coordinator binary

use anyhow::Context;
use clap::{Parser, Subcommand};
use commitkv::common::{normalize_base_url, parse_duration, Config, CoordinatorConfig};
use commitkv::Coordinator;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "commitkv-coord")]
#[command(about = "commitkv transaction coordinator (2PC/3PC)")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start coordinator server
    Serve {
        /// Node ID
        #[arg(long, default_value = "coordinator")]
        id: String,

        /// Listen port (overrides the config file)
        #[arg(long)]
        port: Option<u16>,

        /// Listen host
        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        /// Participant roster (comma-separated)
        #[arg(long, value_delimiter = ',')]
        participants: Vec<String>,

        /// Decision log path
        #[arg(long)]
        wal: Option<PathBuf>,

        /// Per-vote timeout, e.g. 500ms or 2s
        #[arg(long)]
        vote_timeout: Option<String>,

        /// Initial backoff between propagation attempts
        #[arg(long)]
        retry_backoff: Option<String>,

        /// Respond to start-transaction only after every participant acked
        #[arg(long)]
        await_propagation: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let file_config = Config::load()?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| file_config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            id,
            port,
            host,
            participants,
            wal,
            vote_timeout,
            retry_backoff,
            await_propagation,
        } => {
            // File config first, CLI has priority
            let mut config = file_config.coordinator.unwrap_or_default();
            if let Some(port) = port {
                config.bind_addr = SocketAddr::new(host.parse()?, port);
            }
            if !participants.is_empty() {
                config.participants = participants;
            }
            config.participants = config
                .participants
                .iter()
                .map(|p| normalize_base_url(p))
                .collect();
            if let Some(wal) = wal {
                config.wal_path = wal;
            }
            if let Some(timeout) = vote_timeout {
                config.vote_timeout_ms = u64::try_from(parse_duration(&timeout)?.as_millis())
                    .context("vote timeout out of range")?;
            }
            if let Some(backoff) = retry_backoff {
                config.retry_backoff_ms = u64::try_from(parse_duration(&backoff)?.as_millis())
                    .context("retry backoff out of range")?;
            }
            config.await_propagation |= await_propagation;

            let node_id = if file_config.node_id.is_empty() {
                id
            } else {
                file_config.node_id
            };

            run(config, node_id).await?;
        }
    }

    Ok(())
}

async fn run(config: CoordinatorConfig, node_id: String) -> anyhow::Result<()> {
    let coordinator = Coordinator::open(config, node_id)?;

    tokio::select! {
        res = coordinator.serve() => res?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down coordinator");
        }
    }

    Ok(())
}
