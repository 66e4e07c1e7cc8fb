//! Coordinator decision log
//!
//! Records, in order:
//! - `DECISION` once per transaction, before any participant hears it
//! - `ACK` per participant that acknowledged (or definitively rejected) it
//! - `COMPLETE` once every participant on the roster has acked
//!
//! After a restart, every decision without `COMPLETE` is still owed to the
//! participants that have not acked it.

use crate::common::{Result, Wal};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    #[serde(rename = "2PC")]
    TwoPhase,
    #[serde(rename = "3PC")]
    ThreePhase,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::TwoPhase => f.write_str("2PC"),
            Protocol::ThreePhase => f.write_str("3PC"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Decision {
    Commit,
    Abort,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Commit => f.write_str("COMMIT"),
            Decision::Abort => f.write_str("ABORT"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "UPPERCASE")]
pub enum CoordinatorRecord {
    Decision {
        txid: String,
        protocol: Protocol,
        decision: Decision,
        #[serde(default)]
        operation: Value,
    },
    Ack {
        txid: String,
        participant: String,
    },
    Complete {
        txid: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecisionEntry {
    pub protocol: Protocol,
    pub decision: Decision,
    pub operation: Value,
    pub acked: BTreeSet<String>,
    pub complete: bool,
}

/// A decision still owed to part of the roster.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingDecision {
    pub txid: String,
    pub decision: Decision,
    pub operation: Value,
    pub acked: BTreeSet<String>,
}

pub struct DecisionLog {
    wal: Wal<CoordinatorRecord>,
    decisions: HashMap<String, DecisionEntry>,
}

impl fmt::Debug for DecisionLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecisionLog")
            .field("wal", &self.wal)
            .field("decisions", &self.decisions.len())
            .finish()
    }
}

impl DecisionLog {
    /// Open the log and rebuild the decision table from it.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let wal = Wal::open(path.as_ref())?;
        let mut log = Self {
            wal,
            decisions: HashMap::new(),
        };

        let mut records = 0usize;
        Wal::<CoordinatorRecord>::replay(path.as_ref(), |entry| {
            log.apply(entry.record);
            records += 1;
            Ok(())
        })?;

        if records > 0 {
            tracing::info!(
                records,
                decisions = log.decisions.len(),
                pending = log.pending().len(),
                "Recovered decision log"
            );
        }
        Ok(log)
    }

    /// Durably record the decision for `txid`.
    pub fn record_decision(
        &mut self,
        txid: &str,
        protocol: Protocol,
        decision: Decision,
        operation: &Value,
    ) -> Result<()> {
        self.append(CoordinatorRecord::Decision {
            txid: txid.to_string(),
            protocol,
            decision,
            operation: operation.clone(),
        })
    }

    pub fn record_ack(&mut self, txid: &str, participant: &str) -> Result<()> {
        if self
            .decisions
            .get(txid)
            .is_some_and(|e| e.acked.contains(participant))
        {
            return Ok(());
        }
        self.append(CoordinatorRecord::Ack {
            txid: txid.to_string(),
            participant: participant.to_string(),
        })
    }

    pub fn record_complete(&mut self, txid: &str) -> Result<()> {
        if self.decisions.get(txid).is_some_and(|e| e.complete) {
            return Ok(());
        }
        self.append(CoordinatorRecord::Complete {
            txid: txid.to_string(),
        })
    }

    fn append(&mut self, record: CoordinatorRecord) -> Result<()> {
        self.wal.append(&record)?;
        self.apply(record);
        Ok(())
    }

    fn apply(&mut self, record: CoordinatorRecord) {
        match record {
            CoordinatorRecord::Decision {
                txid,
                protocol,
                decision,
                operation,
            } => {
                if let Some(existing) = self.decisions.get(&txid) {
                    tracing::warn!(txid = %txid, logged = %existing.decision, "Duplicate decision record ignored");
                    return;
                }
                self.decisions.insert(
                    txid,
                    DecisionEntry {
                        protocol,
                        decision,
                        operation,
                        acked: BTreeSet::new(),
                        complete: false,
                    },
                );
            }
            CoordinatorRecord::Ack { txid, participant } => {
                if let Some(entry) = self.decisions.get_mut(&txid) {
                    entry.acked.insert(participant);
                }
            }
            CoordinatorRecord::Complete { txid } => {
                if let Some(entry) = self.decisions.get_mut(&txid) {
                    entry.complete = true;
                }
            }
        }
    }

    pub fn decision(&self, txid: &str) -> Option<Decision> {
        self.decisions.get(txid).map(|e| e.decision)
    }

    pub fn entry(&self, txid: &str) -> Option<&DecisionEntry> {
        self.decisions.get(txid)
    }

    /// Decisions not yet acknowledged by everyone, ordered by txid.
    pub fn pending(&self) -> Vec<PendingDecision> {
        let mut pending: Vec<PendingDecision> = self
            .decisions
            .iter()
            .filter(|(_, e)| !e.complete)
            .map(|(txid, e)| PendingDecision {
                txid: txid.clone(),
                decision: e.decision,
                operation: e.operation.clone(),
                acked: e.acked.clone(),
            })
            .collect();
        pending.sort_by(|a, b| a.txid.cmp(&b.txid));
        pending
    }

    /// (committed, aborted) counts.
    pub fn counts(&self) -> (usize, usize) {
        self.decisions
            .values()
            .fold((0, 0), |(c, a), e| match e.decision {
                Decision::Commit => (c + 1, a),
                Decision::Abort => (c, a + 1),
            })
    }
}
