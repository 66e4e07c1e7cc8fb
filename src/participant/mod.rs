//! Participant implementation
//!
//! A participant owns:
//! - A key-value store mutated only by committed operations
//! - The per-transaction state machine (READY / PRECOMMIT / COMMITTED / ABORTED)
//! - A write-ahead log of every phase transition
//! - Recovery by replaying that log at startup

pub mod http;
pub mod operation;
pub mod recovery;
pub mod server;
pub mod store;
pub mod txn;

pub use operation::{ExecutorRegistry, Operation, OperationExecutor, OperationKind};
pub use server::ParticipantServer;
pub use store::KvStore;
pub use txn::{Participant, ParticipantRecord, ParticipantStatus, TxnRecord, TxnState, Vote, VotePhase};
