//! Coordinator server

use crate::common::tracing_middleware::request_tracing_middleware;
use crate::common::{CoordinatorConfig, Result};
use crate::coordinator::decision_log::DecisionLog;
use crate::coordinator::engine::ProtocolEngine;
use crate::coordinator::http::{create_router, CoordState};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

pub struct Coordinator {
    config: CoordinatorConfig,
    node_id: String,
    engine: Arc<ProtocolEngine>,
}

impl Coordinator {
    /// Open the decision log and build the protocol engine.
    pub fn open(config: CoordinatorConfig, node_id: String) -> Result<Self> {
        config.validate()?;

        tracing::info!("Starting coordinator: {}", node_id);
        tracing::info!("  HTTP API: {}", config.bind_addr);
        tracing::info!("  WAL path: {}", config.wal_path.display());
        tracing::info!("  Participants: {}", config.participants.join(", "));

        let log = DecisionLog::open(&config.wal_path)?;
        let engine = Arc::new(ProtocolEngine::new(&config, log)?);

        Ok(Self {
            config,
            node_id,
            engine,
        })
    }

    pub fn engine(&self) -> Arc<ProtocolEngine> {
        self.engine.clone()
    }

    pub async fn serve(self) -> Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.run(listener).await
    }

    /// Resume owed propagation, then serve on `listener`.
    pub async fn run(self, listener: TcpListener) -> Result<()> {
        let resumed = self.engine.resume_pending()?;
        if resumed > 0 {
            tracing::info!("Resumed propagation for {} transaction(s)", resumed);
        }

        let router = create_router(CoordState {
            node_id: self.node_id.clone(),
            engine: self.engine.clone(),
            started_at: chrono::Utc::now(),
        })
        .layer(axum::middleware::from_fn(request_tracing_middleware));

        tracing::info!("✓ Coordinator ready on {}", listener.local_addr()?);

        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await?;

        Ok(())
    }
}
