//! # commitkv
//!
//! Atomic commitment across a set of key-value participants:
//! - Two-Phase Commit and Three-Phase Commit, chosen per transaction
//! - Unanimous voting: one NO or unreachable participant aborts everywhere
//! - Write-ahead logs on the coordinator and on every participant
//! - Crash recovery by log replay; decisions are re-delivered until acked
//!
//! ## Architecture
//!
//! ```text
//!              ┌──────────────────────────────┐
//!   client ──▶ │         Coordinator          │
//!              │  votes → decide → log → send │
//!              │  + decision WAL              │
//!              └──────────────┬───────────────┘
//!                             │ HTTP/JSON
//!        ┌────────────────────┼────────────────────┐
//!        │                    │                    │
//!  ┌─────▼──────┐      ┌─────▼──────┐      ┌──────▼─────┐
//!  │Participant1│      │Participant2│      │Participant3│
//!  │ KV + WAL   │      │ KV + WAL   │      │ KV + WAL   │
//!  └────────────┘      └────────────┘      └────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Start participants
//! ```bash
//! commitkv-participant --id p1 --port 8001 --wal ./p1.wal
//! commitkv-participant --id p2 --port 8002 --wal ./p2.wal
//! ```
//!
//! ### Start the coordinator
//! ```bash
//! commitkv-coord serve \
//!   --port 8000 \
//!   --participants http://localhost:8001,http://localhost:8002
//! ```
//!
//! ### Use the CLI
//! ```bash
//! commitkv --coord http://localhost:8000 set x 1
//! commitkv --coord http://localhost:8000 --protocol 3PC transfer alice bob 10
//! commitkv --coord http://localhost:8000 status
//! ```

pub mod common;
pub mod coordinator;
pub mod participant;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use coordinator::Coordinator;
pub use participant::ParticipantServer;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
