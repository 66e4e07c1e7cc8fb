//! Participant binary

use anyhow::Result;
use clap::Parser;
use commitkv::common::{Config, ParticipantConfig};
use commitkv::ParticipantServer;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "commitkv-participant")]
#[command(about = "commitkv participant - votes on and applies transactions")]
struct Args {
    /// Participant ID (unique identifier for this node)
    #[arg(long)]
    id: String,

    /// Port to listen on (default 8001)
    #[arg(long)]
    port: Option<u16>,

    /// Host to listen on
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Write-ahead log path (default ./<id>.wal)
    #[arg(long)]
    wal: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let file_config = Config::load()?;

    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| file_config.log_level.clone());
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| level.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // File config first, CLI has priority
    let mut config = file_config.participant.unwrap_or_else(|| ParticipantConfig {
        wal_path: PathBuf::from(format!("./{}.wal", args.id)),
        ..ParticipantConfig::default()
    });
    if let Some(port) = args.port {
        config.bind_addr = SocketAddr::new(args.host.parse()?, port);
    }
    if let Some(wal) = args.wal {
        config.wal_path = wal;
    }

    let server = ParticipantServer::open(config, args.id)?;

    tokio::select! {
        res = server.serve() => res?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down participant");
        }
    }

    Ok(())
}
