//! Commit protocol engine
//!
//! Runs 2PC or 3PC for one transaction at a time per call; distinct
//! transactions may run concurrently. Participants are contacted
//! sequentially. Commit requires a unanimous YES: an unreachable participant
//! counts as NO.
//!
//! Ordering per transaction:
//! 1. collect votes (bounded timeout, no retry)
//! 2. 3PC only, all YES: deliver PRECOMMIT to everyone
//! 3. log the decision (durable)
//! 4. propagate the decision until every participant answers
//!
//! The decision log lock is held only around log access, never across
//! network calls.

use crate::common::{CoordinatorConfig, Error, Result};
use crate::coordinator::decision_log::{Decision, DecisionLog, PendingDecision, Protocol};
use crate::coordinator::participant_client::{Delivery, Notice, ParticipantClient};
use crate::coordinator::propagation::{deliver_until_answered, RetryPolicy};
use crate::participant::{Vote, VotePhase};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct ProtocolStats {
    pub delivery_retries: AtomicU64,
    /// Decision notices a participant answered with 409.
    pub rejected_deliveries: AtomicU64,
    pub propagations_in_flight: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RosterEntry {
    pub url: String,
    pub healthy: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub roster: Vec<RosterEntry>,
    pub committed: usize,
    pub aborted: usize,
    pub pending_propagations: usize,
    pub propagations_in_flight: u64,
    pub delivery_retries: u64,
    pub rejected_deliveries: u64,
}

pub struct ProtocolEngine {
    roster: Vec<ParticipantClient>,
    log: Mutex<DecisionLog>,
    in_flight: Mutex<HashSet<String>>,
    vote_timeout: Duration,
    retry: RetryPolicy,
    await_propagation: bool,
    stats: ProtocolStats,
}

/// Releases a txid from the in-flight set when the run ends, however it ends.
struct InFlightGuard<'a> {
    engine: &'a ProtocolEngine,
    txid: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut in_flight) = self.engine.in_flight.lock() {
            in_flight.remove(&self.txid);
        }
    }
}

impl ProtocolEngine {
    pub fn new(config: &CoordinatorConfig, log: DecisionLog) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.vote_timeout().min(config.attempt_timeout()))
            .build()
            .map_err(|e| Error::InvalidConfig(format!("HTTP client: {}", e)))?;

        let roster = config
            .participants
            .iter()
            .map(|addr| ParticipantClient::new(http.clone(), addr))
            .collect();

        Ok(Self {
            roster,
            log: Mutex::new(log),
            in_flight: Mutex::new(HashSet::new()),
            vote_timeout: config.vote_timeout(),
            retry: RetryPolicy {
                attempt_timeout: config.attempt_timeout(),
                initial_backoff: config.retry_backoff(),
                max_backoff: config.max_backoff(),
            },
            await_propagation: config.await_propagation,
            stats: ProtocolStats::default(),
        })
    }

    pub fn roster(&self) -> impl Iterator<Item = &str> {
        self.roster.iter().map(|c| c.base_url())
    }

    pub fn stats(&self) -> &ProtocolStats {
        &self.stats
    }

    fn log(&self) -> Result<MutexGuard<'_, DecisionLog>> {
        self.log
            .lock()
            .map_err(|_| Error::Internal("decision log lock poisoned".into()))
    }

    /// Logged decision for `txid`, if any.
    pub fn decision(&self, txid: &str) -> Result<Option<Decision>> {
        Ok(self.log()?.decision(txid))
    }

    /// Run the requested protocol for a new transaction.
    ///
    /// A txid that already has a logged decision gets that decision back
    /// without contacting anyone.
    pub async fn start_transaction(
        self: &Arc<Self>,
        txid: &str,
        protocol: Protocol,
        operation: Value,
    ) -> Result<Decision> {
        if txid.trim().is_empty() {
            return Err(Error::InvalidOperation("txid must not be empty".into()));
        }

        let _guard = self.claim(txid)?;
        if let Some(decision) = self.decision(txid)? {
            tracing::info!(txid, %decision, "Transaction already decided");
            return Ok(decision);
        }

        tracing::info!(txid, %protocol, participants = self.roster.len(), "Starting transaction");
        let decision = match protocol {
            Protocol::TwoPhase => self.run_two_phase(txid, operation).await?,
            Protocol::ThreePhase => self.run_three_phase(txid, operation).await?,
        };
        tracing::info!(txid, %protocol, %decision, "Transaction decided");
        Ok(decision)
    }

    fn claim(&self, txid: &str) -> Result<InFlightGuard<'_>> {
        let mut in_flight = self
            .in_flight
            .lock()
            .map_err(|_| Error::Internal("in-flight lock poisoned".into()))?;
        if !in_flight.insert(txid.to_string()) {
            return Err(Error::DuplicateTransaction(txid.to_string()));
        }
        Ok(InFlightGuard {
            engine: self,
            txid: txid.to_string(),
        })
    }

    async fn run_two_phase(self: &Arc<Self>, txid: &str, operation: Value) -> Result<Decision> {
        let decision = if self.collect_votes(VotePhase::Prepare, txid, &operation).await {
            Decision::Commit
        } else {
            Decision::Abort
        };

        self.log_decision(txid, Protocol::TwoPhase, decision, &operation)?;
        self.dispatch(txid).await;
        Ok(decision)
    }

    async fn run_three_phase(self: &Arc<Self>, txid: &str, operation: Value) -> Result<Decision> {
        if !self
            .collect_votes(VotePhase::CanCommit, txid, &operation)
            .await
        {
            self.log_decision(txid, Protocol::ThreePhase, Decision::Abort, &operation)?;
            self.dispatch(txid).await;
            return Ok(Decision::Abort);
        }

        // Every participant must have heard PRECOMMIT before COMMIT is logged.
        for client in &self.roster {
            deliver_until_answered(
                client,
                Notice::Precommit,
                txid,
                None,
                &self.retry,
                &self.stats.delivery_retries,
            )
            .await;
        }

        self.log_decision(txid, Protocol::ThreePhase, Decision::Commit, &operation)?;
        self.dispatch(txid).await;
        Ok(Decision::Commit)
    }

    /// Ask every participant in roster order; true iff all voted YES.
    async fn collect_votes(&self, phase: VotePhase, txid: &str, operation: &Value) -> bool {
        let mut unanimous = true;
        for client in &self.roster {
            match client.vote(phase, txid, operation, self.vote_timeout).await {
                Ok(Vote::Yes) => {
                    tracing::debug!(txid, participant = %client.base_url(), "Voted YES");
                }
                Ok(Vote::No) => {
                    tracing::info!(txid, participant = %client.base_url(), "Voted NO");
                    unanimous = false;
                }
                Err(e) => {
                    tracing::warn!(
                        txid,
                        participant = %client.base_url(),
                        error = %e,
                        "No vote received, counting as NO"
                    );
                    unanimous = false;
                }
            }
        }
        unanimous
    }

    fn log_decision(
        &self,
        txid: &str,
        protocol: Protocol,
        decision: Decision,
        operation: &Value,
    ) -> Result<()> {
        self.log()?
            .record_decision(txid, protocol, decision, operation)
            .map_err(|e| {
                tracing::error!(txid, %decision, error = %e, "Failed to log decision");
                e
            })
    }

    /// Start propagating a logged decision, inline or as a detached task.
    async fn dispatch(self: &Arc<Self>, txid: &str) {
        if self.await_propagation {
            Arc::clone(self).propagate(txid.to_string()).await;
        } else {
            let engine = Arc::clone(self);
            let txid = txid.to_string();
            tokio::spawn(async move { engine.propagate(txid).await });
        }
    }

    /// Deliver the logged decision for `txid` to every participant that has
    /// not acked it yet, then mark it complete. A participant that rejects
    /// the decision is not acked, so the decision stays pending.
    pub async fn propagate(self: Arc<Self>, txid: String) {
        let pending = match self.log().map(|log| {
            log.entry(&txid)
                .map(|e| (e.decision, e.operation.clone(), e.acked.clone()))
        }) {
            Ok(Some(pending)) => pending,
            Ok(None) => {
                tracing::error!(txid = %txid, "No logged decision to propagate");
                return;
            }
            Err(e) => {
                tracing::error!(txid = %txid, error = %e, "Cannot read decision log");
                return;
            }
        };
        let (decision, operation, acked) = pending;
        self.deliver_to_roster(&txid, decision, &operation, &acked)
            .await;
    }

    async fn deliver_to_roster(
        &self,
        txid: &str,
        decision: Decision,
        operation: &Value,
        acked: &BTreeSet<String>,
    ) {
        self.stats
            .propagations_in_flight
            .fetch_add(1, Ordering::Relaxed);

        let notice = Notice::from(decision);
        let carried = match decision {
            Decision::Abort if !operation.is_null() => Some(operation),
            _ => None,
        };

        let mut all_acked = true;
        for client in &self.roster {
            if acked.contains(client.base_url()) {
                continue;
            }
            let delivery = deliver_until_answered(
                client,
                notice,
                txid,
                carried,
                &self.retry,
                &self.stats.delivery_retries,
            )
            .await;
            if delivery == Delivery::Rejected {
                tracing::error!(
                    txid,
                    participant = %client.base_url(),
                    %decision,
                    "Decision rejected by participant, leaving it pending"
                );
                self.stats.rejected_deliveries.fetch_add(1, Ordering::Relaxed);
                all_acked = false;
                continue;
            }
            // A lost ACK record only costs a redundant resend after restart.
            if let Err(e) = self.log().and_then(|mut log| log.record_ack(txid, client.base_url())) {
                tracing::error!(txid, participant = %client.base_url(), error = %e, "Failed to log ack");
            }
        }

        if all_acked {
            match self.log().and_then(|mut log| log.record_complete(txid)) {
                Ok(()) => tracing::info!(txid, %decision, "Decision acknowledged by all participants"),
                Err(e) => tracing::error!(txid, error = %e, "Failed to log completion"),
            }
        }

        self.stats
            .propagations_in_flight
            .fetch_sub(1, Ordering::Relaxed);
    }

    /// Spawn propagation for every logged decision still owed to someone.
    /// Returns the number of transactions resumed.
    pub fn resume_pending(self: &Arc<Self>) -> Result<usize> {
        let pending: Vec<PendingDecision> = self.log()?.pending();
        for p in &pending {
            tracing::info!(
                txid = %p.txid,
                decision = %p.decision,
                acked = p.acked.len(),
                "Resuming propagation"
            );
            let engine = Arc::clone(self);
            let txid = p.txid.clone();
            tokio::spawn(async move { engine.propagate(txid).await });
        }
        Ok(pending.len())
    }

    /// Roster health and decision counters.
    pub async fn status(&self) -> Result<EngineStatus> {
        let (committed, aborted, pending_propagations) = {
            let log = self.log()?;
            let (committed, aborted) = log.counts();
            (committed, aborted, log.pending().len())
        };

        let mut roster = Vec::with_capacity(self.roster.len());
        for client in &self.roster {
            roster.push(RosterEntry {
                url: client.base_url().to_string(),
                healthy: client.is_healthy(self.vote_timeout).await,
            });
        }

        Ok(EngineStatus {
            roster,
            committed,
            aborted,
            pending_propagations,
            propagations_in_flight: self.stats.propagations_in_flight.load(Ordering::Relaxed),
            delivery_retries: self.stats.delivery_retries.load(Ordering::Relaxed),
            rejected_deliveries: self.stats.rejected_deliveries.load(Ordering::Relaxed),
        })
    }
}
