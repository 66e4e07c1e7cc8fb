//! Retry-until-acknowledged delivery
//!
//! Once a decision is logged it must reach every participant, so delivery
//! has no retry budget: each attempt is bounded by a timeout, failures back
//! off exponentially up to a ceiling, and the loop ends only when the
//! participant answers.

use crate::coordinator::participant_client::{Delivery, Notice, ParticipantClient};
use rand::Rng;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempt_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(2),
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Backoff plus up to 10% random jitter.
    fn jittered_backoff(&self, attempt: u32) -> Duration {
        let base = self.backoff(attempt);
        let jitter_ms = (base.as_millis() as u64) / 10;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

/// Deliver `notice` to one participant, retrying until it answers.
/// Every failed attempt bumps `retries`.
pub async fn deliver_until_answered(
    client: &ParticipantClient,
    notice: Notice,
    txid: &str,
    operation: Option<&Value>,
    policy: &RetryPolicy,
    retries: &AtomicU64,
) -> Delivery {
    let mut attempt = 0u32;
    loop {
        match client
            .notify(notice, txid, operation, policy.attempt_timeout)
            .await
        {
            Ok(Delivery::Acked) => {
                if attempt > 0 {
                    tracing::info!(
                        participant = %client.base_url(),
                        txid,
                        attempts = attempt + 1,
                        "Delivered {:?} after retries",
                        notice
                    );
                }
                return Delivery::Acked;
            }
            Ok(Delivery::Rejected) => {
                tracing::warn!(
                    participant = %client.base_url(),
                    txid,
                    "{:?} rejected with conflict",
                    notice
                );
                return Delivery::Rejected;
            }
            Err(e) => {
                attempt = attempt.saturating_add(1);
                retries.fetch_add(1, Ordering::Relaxed);
                let delay = policy.jittered_backoff(attempt);
                if e.is_retryable() {
                    tracing::warn!(
                        participant = %client.base_url(),
                        txid,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "Participant unreachable, retrying {:?}",
                        notice
                    );
                } else {
                    // The participant answered but could not process the notice
                    tracing::error!(
                        participant = %client.base_url(),
                        txid,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "Participant failed {:?}, retrying",
                        notice
                    );
                }
                tokio::time::sleep(delay).await;
            }
        }
    }
}
