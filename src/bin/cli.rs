//! CLI client for the coordinator

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use commitkv::coordinator::Protocol;
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "commitkv")]
#[command(about = "commitkv client CLI")]
#[command(version)]
struct Cli {
    /// Coordinator URL
    #[arg(long, default_value = "http://localhost:8000")]
    coord: String,

    /// Commit protocol: 2PC or 3PC
    #[arg(long, default_value = "2PC", value_parser = parse_protocol)]
    protocol: Protocol,

    /// Transaction ID (generated if omitted)
    #[arg(long)]
    txid: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Set a key
    Set { key: String, value: String },

    /// Move an amount between two balances
    Transfer {
        from: String,
        to: String,
        amount: String,
    },

    /// Show coordinator status
    Status,
}

fn parse_protocol(s: &str) -> Result<Protocol, String> {
    match s.to_ascii_uppercase().as_str() {
        "2PC" => Ok(Protocol::TwoPhase),
        "3PC" => Ok(Protocol::ThreePhase),
        other => Err(format!("unknown protocol {:?} (expected 2PC or 3PC)", other)),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let base = cli.coord.trim_end_matches('/');
    let client = reqwest::Client::new();

    let operation = match cli.command {
        Commands::Status => {
            let status: Value = client
                .get(format!("{}/status", base))
                .send()
                .await
                .context("coordinator unreachable")?
                .json()
                .await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            return Ok(());
        }
        Commands::Set { key, value } => json!({ "type": "SET", "key": key, "value": value }),
        Commands::Transfer { from, to, amount } => {
            json!({ "type": "TRANSFER", "from": from, "to": to, "amount": amount })
        }
    };

    let txid = cli
        .txid
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let payload = json!({ "txid": txid, "protocol": cli.protocol, "operation": operation });

    let response = client
        .post(format!("{}/tx/start", base))
        .json(&payload)
        .send()
        .await
        .context("coordinator unreachable")?;
    let status = response.status();
    let body: Value = response.json().await?;

    println!("{}", serde_json::to_string_pretty(&body)?);
    if !status.is_success() {
        bail!("coordinator returned {}", status);
    }

    Ok(())
}
