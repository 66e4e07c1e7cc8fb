//! HTTP API for the coordinator

use crate::coordinator::decision_log::Protocol;
use crate::coordinator::engine::ProtocolEngine;
use crate::participant::http::MAX_BODY_BYTES;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;

/// Shared coordinator state for HTTP handlers.
#[derive(Clone)]
pub struct CoordState {
    pub node_id: String,
    pub engine: Arc<ProtocolEngine>,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Deserialize)]
struct StartRequest {
    txid: String,
    protocol: Protocol,
    #[serde(alias = "op")]
    operation: Value,
}

/// Creates the HTTP router with all coordinator endpoints.
pub fn create_router(state: CoordState) -> Router {
    Router::new()
        .route("/tx/start", post(start_transaction))
        .route("/status", get(status))
        .route("/health", get(health))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .with_state(state)
}

async fn start_transaction(
    State(state): State<CoordState>,
    Json(req): Json<StartRequest>,
) -> Response {
    match state
        .engine
        .start_transaction(&req.txid, req.protocol, req.operation)
        .await
    {
        Ok(decision) => (
            StatusCode::OK,
            Json(json!({ "ok": true, "txid": req.txid, "decision": decision })),
        )
            .into_response(),
        Err(e) => {
            let status = e.to_http_status();
            if status.is_server_error() {
                tracing::error!(txid = %req.txid, error = %e, "Transaction failed");
            }
            (
                status,
                Json(json!({ "ok": false, "txid": req.txid, "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

/// Roster health and decision counters
async fn status(State(state): State<CoordState>) -> Response {
    match state.engine.status().await {
        Ok(status) => (
            StatusCode::OK,
            Json(json!({
                "ok": true,
                "node": state.node_id,
                "started_at": state.started_at.to_rfc3339(),
                "roster": status.roster,
                "decisions": {
                    "committed": status.committed,
                    "aborted": status.aborted,
                },
                "pending_propagations": status.pending_propagations,
                "propagations_in_flight": status.propagations_in_flight,
                "delivery_retries": status.delivery_retries,
                "rejected_deliveries": status.rejected_deliveries,
            })),
        )
            .into_response(),
        Err(e) => (
            e.to_http_status(),
            Json(json!({ "ok": false, "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn health(State(state): State<CoordState>) -> impl IntoResponse {
    Json(json!({
        "ok": true,
        "node": state.node_id,
        "version": crate::VERSION,
        "participants": state.engine.roster().count(),
    }))
}
