//! Participant transaction state machine
//!
//! ```text
//!   (none) --vote ok--> READY --precommit--> PRECOMMIT
//!     |                   |                      |
//!     |                   +------commit----------+--> COMMITTED
//!     +--vote invalid--> ABORTED <--abort-- (any state but COMMITTED)
//! ```
//!
//! ABORTED and COMMITTED are terminal: an abort for a committed
//! transaction is acknowledged and ignored.
//!
//! Every transition is a [`ParticipantRecord`]. The record is appended to
//! the WAL first; only then is it applied to the in-memory table and store
//! through [`Participant::apply_record`], the same function recovery uses.
//! A failed append leaves state untouched and surfaces as an error.

use crate::common::{Error, Result, Wal};
use crate::participant::operation::{ExecutorRegistry, Operation};
use crate::participant::store::KvStore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxnState {
    Ready,
    Aborted,
    Precommit,
    Committed,
}

impl TxnState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TxnState::Aborted | TxnState::Committed)
    }
}

impl fmt::Display for TxnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TxnState::Ready => "READY",
            TxnState::Aborted => "ABORTED",
            TxnState::Precommit => "PRECOMMIT",
            TxnState::Committed => "COMMITTED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Vote {
    Yes,
    No,
}

/// Name of the voting round: PREPARE in 2PC, CAN_COMMIT in 3PC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VotePhase {
    Prepare,
    CanCommit,
}

impl VotePhase {
    /// Endpoint path on the participant.
    pub fn path(self) -> &'static str {
        match self {
            VotePhase::Prepare => "/prepare",
            VotePhase::CanCommit => "/can_commit",
        }
    }
}

/// One logged phase transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParticipantRecord {
    Vote {
        txid: String,
        round: VotePhase,
        vote: Vote,
        operation: Option<Operation>,
    },
    Precommit {
        txid: String,
    },
    Commit {
        txid: String,
    },
    Abort {
        txid: String,
        operation: Option<Operation>,
    },
}

impl ParticipantRecord {
    pub fn txid(&self) -> &str {
        match self {
            ParticipantRecord::Vote { txid, .. }
            | ParticipantRecord::Precommit { txid }
            | ParticipantRecord::Commit { txid }
            | ParticipantRecord::Abort { txid, .. } => txid,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TxnRecord {
    pub state: TxnState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<Operation>,
}

/// Read-only view for `/status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParticipantStatus {
    pub node: String,
    pub store: BTreeMap<String, String>,
    pub transactions: BTreeMap<String, TxnRecord>,
}

pub struct Participant {
    node_id: String,
    wal: Wal<ParticipantRecord>,
    txns: BTreeMap<String, TxnRecord>,
    store: KvStore,
    executors: ExecutorRegistry,
}

impl fmt::Debug for Participant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Participant")
            .field("node_id", &self.node_id)
            .field("wal", &self.wal)
            .field("transactions", &self.txns.len())
            .field("keys", &self.store.len())
            .finish()
    }
}

impl Participant {
    /// Open the participant's WAL and rebuild state from it.
    pub fn open(node_id: impl Into<String>, wal_path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_executors(node_id, wal_path, ExecutorRegistry::with_defaults())
    }

    pub fn open_with_executors(
        node_id: impl Into<String>,
        wal_path: impl AsRef<Path>,
        executors: ExecutorRegistry,
    ) -> Result<Self> {
        let wal = Wal::open(wal_path)?;
        let mut participant = Self {
            node_id: node_id.into(),
            wal,
            txns: BTreeMap::new(),
            store: KvStore::new(),
            executors,
        };
        crate::participant::recovery::replay(&mut participant)?;
        Ok(participant)
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub(crate) fn wal_path(&self) -> &Path {
        self.wal.path()
    }

    /// Answer a vote solicitation.
    ///
    /// A structurally invalid operation is a NO vote and aborts the
    /// transaction locally. A txid that already has a record is answered
    /// from that record without logging again.
    pub fn vote(&mut self, phase: VotePhase, txid: &str, raw_operation: &Value) -> Result<Vote> {
        if let Some(existing) = self.txns.get(txid) {
            let vote = if existing.state == TxnState::Aborted {
                Vote::No
            } else {
                Vote::Yes
            };
            tracing::debug!(txid, state = %existing.state, ?vote, "Repeated vote request");
            return Ok(vote);
        }

        let (vote, operation) = match self.executors.decode(raw_operation) {
            Ok(op) => (Vote::Yes, Some(op)),
            Err(e) => {
                tracing::info!(txid, error = %e, "Voting NO on invalid operation");
                (Vote::No, None)
            }
        };

        self.log_and_apply(ParticipantRecord::Vote {
            txid: txid.to_string(),
            round: phase,
            vote,
            operation,
        })?;
        Ok(vote)
    }

    /// READY -> PRECOMMIT. Any other state is a conflict.
    pub fn precommit(&mut self, txid: &str) -> Result<()> {
        match self.state_of(txid) {
            Some(TxnState::Ready) => self.log_and_apply(ParticipantRecord::Precommit {
                txid: txid.to_string(),
            }),
            state => Err(Error::Conflict {
                txid: txid.to_string(),
                state,
            }),
        }
    }

    /// READY/PRECOMMIT -> COMMITTED, applying the operation once.
    /// Already COMMITTED is acknowledged without touching the store.
    pub fn commit(&mut self, txid: &str) -> Result<()> {
        match self.state_of(txid) {
            Some(TxnState::Ready) | Some(TxnState::Precommit) => {
                self.log_and_apply(ParticipantRecord::Commit {
                    txid: txid.to_string(),
                })
            }
            Some(TxnState::Committed) => {
                tracing::debug!(txid, "Commit already applied");
                Ok(())
            }
            state => Err(Error::Conflict {
                txid: txid.to_string(),
                state,
            }),
        }
    }

    /// Any state but COMMITTED -> ABORTED. Always acknowledged; a committed
    /// transaction stays committed.
    pub fn abort(&mut self, txid: &str, raw_operation: Option<&Value>) -> Result<()> {
        let existing = self.txns.get(txid);
        match existing.map(|r| r.state) {
            Some(TxnState::Committed) => {
                tracing::warn!(txid, "Ignoring abort for a committed transaction");
                return Ok(());
            }
            Some(state) if state.is_terminal() => {
                tracing::debug!(txid, "Abort already recorded");
                return Ok(());
            }
            _ => {}
        }

        // Keep whatever operation is known for audit.
        let operation = match existing.and_then(|r| r.operation.clone()) {
            Some(op) => Some(op),
            None => raw_operation.and_then(|raw| self.executors.decode(raw).ok()),
        };

        self.log_and_apply(ParticipantRecord::Abort {
            txid: txid.to_string(),
            operation,
        })
    }

    pub fn status(&self) -> ParticipantStatus {
        ParticipantStatus {
            node: self.node_id.clone(),
            store: self.store.snapshot(),
            transactions: self.txns.clone(),
        }
    }

    pub fn state_of(&self, txid: &str) -> Option<TxnState> {
        self.txns.get(txid).map(|r| r.state)
    }

    pub fn transaction(&self, txid: &str) -> Option<&TxnRecord> {
        self.txns.get(txid)
    }

    pub fn store(&self) -> &KvStore {
        &self.store
    }

    fn log_and_apply(&mut self, record: ParticipantRecord) -> Result<()> {
        self.wal.append(&record)?;
        self.apply_record(&record);
        Ok(())
    }

    /// Apply a durable record to memory. Deterministic, no I/O.
    pub(crate) fn apply_record(&mut self, record: &ParticipantRecord) {
        match record {
            ParticipantRecord::Vote {
                txid,
                vote,
                operation,
                ..
            } => {
                let state = match vote {
                    Vote::Yes => TxnState::Ready,
                    Vote::No => TxnState::Aborted,
                };
                self.txns.insert(
                    txid.clone(),
                    TxnRecord {
                        state,
                        operation: operation.clone(),
                    },
                );
            }
            ParticipantRecord::Precommit { txid } => match self.txns.get_mut(txid) {
                Some(rec) if rec.state == TxnState::Ready => rec.state = TxnState::Precommit,
                _ => tracing::warn!(txid = %txid, "PRECOMMIT record without a READY transaction"),
            },
            ParticipantRecord::Commit { txid } => {
                let Some(rec) = self.txns.get_mut(txid) else {
                    tracing::warn!(txid = %txid, "COMMIT record for unknown transaction");
                    return;
                };
                if rec.state == TxnState::Committed {
                    return;
                }
                match &rec.operation {
                    Some(op) => {
                        if !self.executors.apply(op, &mut self.store) {
                            tracing::error!(txid = %txid, kind = %op.kind(), "No executor for committed operation");
                        }
                    }
                    None => tracing::warn!(txid = %txid, "COMMIT record without an operation"),
                }
                rec.state = TxnState::Committed;
            }
            ParticipantRecord::Abort { txid, operation } => {
                let rec = self.txns.entry(txid.clone()).or_insert(TxnRecord {
                    state: TxnState::Aborted,
                    operation: None,
                });
                if rec.state == TxnState::Committed {
                    tracing::warn!(txid = %txid, "ABORT record for a committed transaction");
                    return;
                }
                rec.state = TxnState::Aborted;
                if rec.operation.is_none() {
                    rec.operation = operation.clone();
                }
            }
        }
    }
}
