//! HTTP API for a participant
//!
//! Every handler takes the single participant lock for the whole
//! state-table + WAL interaction, so the response is only produced after the
//! transition is durable.

use crate::common::{Error, Result};
use crate::participant::txn::{Participant, VotePhase};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tower_http::limit::RequestBodyLimitLayer;

/// Largest accepted request body
pub const MAX_BODY_BYTES: usize = 64 * 1024;

/// Shared participant state for HTTP handlers.
#[derive(Clone)]
pub struct ParticipantState {
    pub participant: Arc<Mutex<Participant>>,
}

impl ParticipantState {
    pub fn new(participant: Participant) -> Self {
        Self {
            participant: Arc::new(Mutex::new(participant)),
        }
    }

    fn with_participant<T>(&self, f: impl FnOnce(&mut Participant) -> Result<T>) -> Result<T> {
        let mut guard = self
            .participant
            .lock()
            .map_err(|_| Error::Internal("participant lock poisoned".into()))?;
        f(&mut guard)
    }
}

#[derive(Debug, Deserialize)]
struct VoteRequest {
    txid: String,
    #[serde(default, alias = "op")]
    operation: Value,
}

#[derive(Debug, Deserialize)]
struct TxidRequest {
    txid: String,
}

#[derive(Debug, Deserialize)]
struct AbortRequest {
    txid: String,
    #[serde(default, alias = "op")]
    operation: Option<Value>,
}

/// Creates the HTTP router with all participant endpoints.
pub fn create_router(state: ParticipantState) -> Router {
    Router::new()
        .route("/prepare", post(prepare))
        .route("/can_commit", post(can_commit))
        .route("/precommit", post(precommit))
        .route("/commit", post(commit))
        .route("/abort", post(abort))
        .route("/status", get(status))
        .route("/health", get(health))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .with_state(state)
}

fn error_response(txid: &str, err: Error) -> Response {
    let status = err.to_http_status();
    if status.is_server_error() {
        tracing::error!(txid, error = %err, "Request failed");
    } else {
        tracing::info!(txid, error = %err, "Request rejected");
    }
    (status, Json(json!({ "ok": false, "error": err.to_string() }))).into_response()
}

fn ack(result: Result<()>, txid: &str) -> Response {
    match result {
        Ok(()) => (StatusCode::OK, Json(json!({ "ok": true }))).into_response(),
        Err(e) => error_response(txid, e),
    }
}

fn handle_vote(state: &ParticipantState, phase: VotePhase, req: VoteRequest) -> Response {
    match state.with_participant(|p| p.vote(phase, &req.txid, &req.operation)) {
        Ok(vote) => (StatusCode::OK, Json(json!({ "ok": true, "vote": vote }))).into_response(),
        Err(e) => error_response(&req.txid, e),
    }
}

/// 2PC vote solicitation
async fn prepare(State(state): State<ParticipantState>, Json(req): Json<VoteRequest>) -> Response {
    handle_vote(&state, VotePhase::Prepare, req)
}

/// 3PC vote solicitation
async fn can_commit(
    State(state): State<ParticipantState>,
    Json(req): Json<VoteRequest>,
) -> Response {
    handle_vote(&state, VotePhase::CanCommit, req)
}

async fn precommit(State(state): State<ParticipantState>, Json(req): Json<TxidRequest>) -> Response {
    ack(state.with_participant(|p| p.precommit(&req.txid)), &req.txid)
}

async fn commit(State(state): State<ParticipantState>, Json(req): Json<TxidRequest>) -> Response {
    ack(state.with_participant(|p| p.commit(&req.txid)), &req.txid)
}

async fn abort(State(state): State<ParticipantState>, Json(req): Json<AbortRequest>) -> Response {
    ack(
        state.with_participant(|p| p.abort(&req.txid, req.operation.as_ref())),
        &req.txid,
    )
}

async fn status(State(state): State<ParticipantState>) -> Response {
    match state.with_participant(|p| Ok(p.status())) {
        Ok(status) => (
            StatusCode::OK,
            Json(json!({
                "ok": true,
                "node": status.node,
                "store": status.store,
                "transactions": status.transactions,
            })),
        )
            .into_response(),
        Err(e) => error_response("-", e),
    }
}

async fn health(State(state): State<ParticipantState>) -> Response {
    match state.with_participant(|p| Ok(p.node_id().to_string())) {
        Ok(node) => (
            StatusCode::OK,
            Json(json!({ "ok": true, "node": node, "version": crate::VERSION })),
        )
            .into_response(),
        Err(e) => error_response("-", e),
    }
}
