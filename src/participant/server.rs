//! Participant server

use crate::common::tracing_middleware::request_tracing_middleware;
use crate::common::{ParticipantConfig, Result};
use crate::participant::http::{create_router, ParticipantState};
use crate::participant::txn::Participant;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;

pub struct ParticipantServer {
    config: ParticipantConfig,
    state: ParticipantState,
}

impl ParticipantServer {
    /// Open the WAL and recover state. Nothing is served yet.
    pub fn open(config: ParticipantConfig, node_id: String) -> Result<Self> {
        tracing::info!("Starting participant: {}", node_id);
        tracing::info!("  HTTP API: {}", config.bind_addr);
        tracing::info!("  WAL path: {}", config.wal_path.display());

        let participant = Participant::open(node_id, &config.wal_path)?;
        Ok(Self {
            config,
            state: ParticipantState::new(participant),
        })
    }

    /// Handle to the shared state machine.
    pub fn participant(&self) -> Arc<Mutex<Participant>> {
        self.state.participant.clone()
    }

    pub async fn serve(self) -> Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.run(listener).await
    }

    /// Serve on an already-bound listener until the process is stopped.
    pub async fn run(self, listener: TcpListener) -> Result<()> {
        let router = create_router(self.state)
            .layer(axum::middleware::from_fn(request_tracing_middleware));

        tracing::info!("✓ Participant ready on {}", listener.local_addr()?);

        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await?;

        Ok(())
    }
}
