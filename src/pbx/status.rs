//! Feed connection state and shared status handle.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Failed => "failed",
        }
    }
}

/// Snapshot of the feed connection, readable by the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct FeedState {
    pub state: ConnectionState,
    pub reconnect_attempt: u32,
    pub connected_at: Option<chrono::DateTime<chrono::Utc>>,
    pub events_processed: u64,
    pub last_error: Option<String>,
}

impl Default for FeedState {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            reconnect_attempt: 0,
            connected_at: None,
            events_processed: 0,
            last_error: None,
        }
    }
}

#[derive(Clone, Default)]
pub struct FeedStatusHandle {
    inner: Arc<Mutex<FeedState>>,
}

impl FeedStatusHandle {
    pub async fn get(&self) -> FeedState {
        self.inner.lock().await.clone()
    }

    pub async fn connecting(&self, attempt: u32) {
        let mut state = self.inner.lock().await;
        state.state = ConnectionState::Connecting;
        state.reconnect_attempt = attempt;
    }

    pub async fn connected(&self) {
        let mut state = self.inner.lock().await;
        state.state = ConnectionState::Connected;
        state.reconnect_attempt = 0;
        state.connected_at = Some(chrono::Utc::now());
        state.last_error = None;
    }

    pub async fn disconnected(&self) {
        let mut state = self.inner.lock().await;
        state.state = ConnectionState::Disconnected;
        state.connected_at = None;
    }

    pub async fn failed(&self, error: String) {
        let mut state = self.inner.lock().await;
        state.state = ConnectionState::Failed;
        state.connected_at = None;
        state.last_error = Some(error);
    }

    pub async fn event_processed(&self) {
        self.inner.lock().await.events_processed += 1;
    }
}
