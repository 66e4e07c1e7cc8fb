use crate::common::{normalize_base_url, Error, Result};
use crate::coordinator::decision_log::Decision;
use crate::participant::{Vote, VotePhase};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

/// Message sent after voting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
    Precommit,
    Commit,
    Abort,
}

impl Notice {
    pub fn path(self) -> &'static str {
        match self {
            Notice::Precommit => "/precommit",
            Notice::Commit => "/commit",
            Notice::Abort => "/abort",
        }
    }
}

impl From<Decision> for Notice {
    fn from(decision: Decision) -> Self {
        match decision {
            Decision::Commit => Notice::Commit,
            Decision::Abort => Notice::Abort,
        }
    }
}

/// Definitive answer from a participant to a notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Acked,
    /// 409: the participant's state does not allow the transition
    Rejected,
}

#[derive(Deserialize)]
struct VoteResponse {
    vote: Option<Vote>,
}

#[derive(Debug, Clone)]
pub struct ParticipantClient {
    http: reqwest::Client,
    base_url: String,
}

impl ParticipantClient {
    pub fn new(http: reqwest::Client, addr: &str) -> Self {
        Self {
            http,
            base_url: normalize_base_url(addr),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Ask for a vote. Anything but an explicit YES is reported as NO; only
    /// transport failures are errors.
    pub async fn vote(
        &self,
        phase: VotePhase,
        txid: &str,
        operation: &Value,
        timeout: Duration,
    ) -> Result<Vote> {
        let response = self
            .http
            .post(format!("{}{}", self.base_url, phase.path()))
            .timeout(timeout)
            .json(&json!({ "txid": txid, "operation": operation }))
            .send()
            .await?;

        if !response.status().is_success() {
            tracing::info!(
                participant = %self.base_url,
                txid,
                status = response.status().as_u16(),
                "Vote request failed"
            );
            return Ok(Vote::No);
        }

        let body: VoteResponse = response.json().await?;
        Ok(body.vote.unwrap_or(Vote::No))
    }

    /// One delivery attempt of a notice.
    pub async fn notify(
        &self,
        notice: Notice,
        txid: &str,
        operation: Option<&Value>,
        timeout: Duration,
    ) -> Result<Delivery> {
        let body = match (notice, operation) {
            (Notice::Abort, Some(op)) => json!({ "txid": txid, "operation": op }),
            _ => json!({ "txid": txid }),
        };

        let response = self
            .http
            .post(format!("{}{}", self.base_url, notice.path()))
            .timeout(timeout)
            .json(&body)
            .send()
            .await?;

        match response.status() {
            s if s.is_success() => Ok(Delivery::Acked),
            StatusCode::CONFLICT => Ok(Delivery::Rejected),
            s => Err(Error::Http(format!(
                "{} {} returned {}",
                self.base_url,
                notice.path(),
                s
            ))),
        }
    }

    pub async fn is_healthy(&self, timeout: Duration) -> bool {
        match self
            .http
            .get(format!("{}/health", self.base_url))
            .timeout(timeout)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}
