//! Common utilities and types shared across commitkv

pub mod config;
pub mod error;
pub mod tracing_middleware;
pub mod utils;
pub mod wal;

pub use config::{Config, CoordinatorConfig, ParticipantConfig};
pub use error::{Error, Result};
pub use utils::{crc32, normalize_base_url, parse_duration};
pub use wal::{Wal, WalEntry};
