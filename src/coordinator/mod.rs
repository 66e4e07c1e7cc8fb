//! Coordinator implementation
//!
//! The coordinator is responsible for:
//! - Vote collection across a fixed participant roster
//! - The commit/abort decision (unanimous YES commits)
//! - Logging that decision before anyone hears it
//! - Delivering it to every participant, retrying without limit
//! - Resuming unfinished delivery after a restart

pub mod decision_log;
pub mod engine;
pub mod http;
pub mod participant_client;
pub mod propagation;
pub mod server;

pub use decision_log::{Decision, DecisionLog, Protocol};
pub use engine::ProtocolEngine;
pub use server::Coordinator;
