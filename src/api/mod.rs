//! HTTP server for queue tasks and provider webhooks.
//!
//! Provides HTTP endpoints for:
//! - Task workers (start and clean up spy calls)
//! - Provider webhooks (voice, call status, recording)
//! - Health and feed status

pub mod error;
pub mod routes;

use anyhow::{Context, Result};
use axum::{extract::State, response::Json, routing::get, Router};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tracing::info;

use crate::cleanup::{CleanupWorker, RecordingHarvester};
use crate::db::SessionStore;
use crate::pbx::FeedStatusHandle;
use crate::spy::SpyCallInitiator;

/// Shared state for every handler.
#[derive(Clone)]
pub struct WorkerState {
    pub initiator: SpyCallInitiator,
    pub cleanup: CleanupWorker,
    pub harvester: RecordingHarvester,
    pub sessions: SessionStore,
    /// Queue whose headers task requests must carry. `None` disables the check.
    pub expected_queue: Option<String>,
    /// Present when the feed monitor runs in the same process.
    pub feed_status: Option<FeedStatusHandle>,
}

pub fn router(state: WorkerState) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/health", get(health))
        .with_state(state.clone())
        .nest("/api/tasks", routes::tasks::router(state.clone()))
        .nest("/api/twilio", routes::twilio::router(state))
        .layer(ServiceBuilder::new())
}

pub struct ApiServer {
    host: String,
    port: u16,
    state: WorkerState,
}

impl ApiServer {
    pub fn new(host: &str, port: u16, state: WorkerState) -> Self {
        Self {
            host: host.to_string(),
            port,
            state,
        }
    }

    /// Serve until `cancel` fires.
    pub async fn start(self, cancel: CancellationToken) -> Result<()> {
        let app = router(self.state);
        let addr = format!("{}:{}", self.host, self.port);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;

        info!("API server listening on http://{}", addr);
        info!("Endpoints:");
        info!("  GET  /health                     - Service info");
        info!("  POST /api/tasks/start-spy-call   - Start a spy call");
        info!("  POST /api/tasks/cleanup-spy-call - Hang up and harvest");
        info!("  POST /api/twilio/voice           - Spy leg TwiML");
        info!("  POST /api/twilio/call-status     - Call progress webhook");
        info!("  POST /api/twilio/recording       - Recording webhook");

        axum::serve(listener, app)
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await
            .context("API server failed")?;

        info!("API server stopped");
        Ok(())
    }
}

async fn health(State(state): State<WorkerState>) -> Json<Value> {
    let feed = match &state.feed_status {
        Some(status) => Some(status.get().await),
        None => None,
    };

    Json(json!({
        "service": "pbx-monitor",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
        "feed": feed,
    }))
}
