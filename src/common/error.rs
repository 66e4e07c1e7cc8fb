//! Error types for commitkv

use crate::participant::TxnState;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Log Errors ===
    #[error("WAL error: {0}")]
    Wal(String),

    #[error("Corrupted data: {0}")]
    Corrupted(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // === Transaction Errors ===
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Conflict on transaction {txid}: state is {}", describe_state(.state))]
    Conflict {
        txid: String,
        state: Option<TxnState>,
    },

    #[error("Transaction {0} is already in progress")]
    DuplicateTransaction(String),

    // === Network Errors ===
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),
}

fn describe_state(state: &Option<TxnState>) -> String {
    match state {
        Some(state) => state.to_string(),
        None => "absent".to_string(),
    }
}

impl Error {
    /// Transport-level failure where the peer may not have seen the request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_) | Error::ConnectionFailed(_) | Error::Http(_)
        )
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::Conflict { .. } | Error::DuplicateTransaction(_) => StatusCode::CONFLICT,
            Error::InvalidOperation(_) | Error::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            Error::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout(e.to_string())
        } else if e.is_connect() {
            Error::ConnectionFailed(e.to_string())
        } else {
            Error::Http(e.to_string())
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}
