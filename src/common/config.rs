//! Configuration for commitkv components

use crate::common::Result;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable naming the TOML config file
pub const CONFIG_ENV: &str = "COMMITKV_CONFIG";

const DEFAULT_CONFIG_FILE: &str = "commitkv.toml";

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Node ID (unique identifier)
    #[serde(default)]
    pub node_id: String,

    /// Coordinator-specific config
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinator: Option<CoordinatorConfig>,

    /// Participant-specific config
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant: Option<ParticipantConfig>,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            coordinator: None,
            participant: None,
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load from the file named by `COMMITKV_CONFIG` (optional), then
    /// `COMMITKV__*` environment variables.
    pub fn load() -> Result<Self> {
        let path =
            std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());

        let settings = config::Config::builder()
            .add_source(config::File::with_name(&path).required(false))
            .add_source(config::Environment::with_prefix("COMMITKV").separator("__"))
            .build()?;

        Ok(settings.try_deserialize()?)
    }
}

/// Coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Bind address for HTTP API
    pub bind_addr: SocketAddr,

    /// Decision log path
    pub wal_path: PathBuf,

    /// Participant base URLs, fixed for the coordinator's lifetime
    #[serde(default)]
    pub participants: Vec<String>,

    /// Timeout for a single vote request (votes are never retried)
    #[serde(default = "default_vote_timeout")]
    pub vote_timeout_ms: u64,

    /// Timeout for a single propagation attempt
    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout_ms: u64,

    /// Initial backoff between propagation attempts
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,

    /// Backoff ceiling
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    /// Hold the start-transaction response until every participant acked
    #[serde(default)]
    pub await_propagation: bool,
}

fn default_vote_timeout() -> u64 {
    2000
}
fn default_attempt_timeout() -> u64 {
    2000
}
fn default_retry_backoff() -> u64 {
    250
}
fn default_max_backoff() -> u64 {
    5000
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            wal_path: PathBuf::from("./coordinator.wal"),
            participants: Vec::new(),
            vote_timeout_ms: default_vote_timeout(),
            attempt_timeout_ms: default_attempt_timeout(),
            retry_backoff_ms: default_retry_backoff(),
            max_backoff_ms: default_max_backoff(),
            await_propagation: false,
        }
    }
}

impl CoordinatorConfig {
    pub fn vote_timeout(&self) -> Duration {
        Duration::from_millis(self.vote_timeout_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    /// Check that the roster and timings are usable.
    pub fn validate(&self) -> Result<()> {
        if self.participants.is_empty() {
            return Err(crate::Error::InvalidConfig(
                "participant roster is empty".into(),
            ));
        }
        if let Some(bad) = self
            .participants
            .iter()
            .find(|p| !(p.starts_with("http://") || p.starts_with("https://")))
        {
            return Err(crate::Error::InvalidConfig(format!(
                "participant address must be an http(s) URL: {}",
                bad
            )));
        }
        if self.retry_backoff_ms == 0 || self.max_backoff_ms < self.retry_backoff_ms {
            return Err(crate::Error::InvalidConfig(
                "max_backoff_ms must be >= retry_backoff_ms > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Participant configuration; missing keys take the defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParticipantConfig {
    /// Bind address for HTTP API
    pub bind_addr: SocketAddr,

    /// Phase log path
    pub wal_path: PathBuf,
}

impl Default for ParticipantConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8001)),
            wal_path: PathBuf::from("./participant.wal"),
        }
    }
}
