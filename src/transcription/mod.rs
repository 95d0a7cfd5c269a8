//! Downstream transcription hand-off.
//!
//! The transcription service itself lives elsewhere; this side only
//! dispatches a `transcribe_audio` task once a recording is persisted, and
//! forwards that task over HTTP when running without a durable queue.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::dispatch::{TaskDispatcher, TaskKind, TaskRoutes};

const FORWARD_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptionRequest {
    pub session_id: String,
    pub storage_path: String,
}

#[derive(Clone)]
pub struct TranscriptionTrigger {
    dispatcher: Arc<dyn TaskDispatcher>,
    routes: TaskRoutes,
}

impl TranscriptionTrigger {
    pub fn new(dispatcher: Arc<dyn TaskDispatcher>, routes: TaskRoutes) -> Self {
        Self { dispatcher, routes }
    }

    /// Queue transcription for a persisted recording. Failure is logged only;
    /// the recording is already safe in storage.
    pub async fn trigger(&self, session_id: &str, storage_path: &str) -> bool {
        let request = TranscriptionRequest {
            session_id: session_id.to_string(),
            storage_path: storage_path.to_string(),
        };
        let task = match self.routes.task_for(TaskKind::TranscribeAudio, &request) {
            Ok(task) => task,
            Err(e) => {
                warn!("Could not build transcription task for {}: {}", session_id, e);
                return false;
            }
        };

        let queued = self.dispatcher.enqueue(task).await;
        if queued {
            info!("Transcription queued for session {}", session_id);
        } else {
            warn!("Failed to queue transcription for session {}", session_id);
        }
        queued
    }
}

/// Posts `transcribe_audio` payloads to a locally running transcription
/// endpoint.
pub struct LocalTranscriptionForwarder {
    client: reqwest::Client,
    url: String,
}

impl LocalTranscriptionForwarder {
    pub fn new(url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(FORWARD_TIMEOUT)
            .build()
            .context("Failed to build transcription HTTP client")?;

        Ok(Self {
            client,
            url: url.to_string(),
        })
    }

    pub async fn forward(&self, payload: &serde_json::Value) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(payload)
            .send()
            .await
            .with_context(|| format!("Failed to reach transcription endpoint {}", self.url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Transcription endpoint returned {}: {}", status, body);
        }

        info!("Transcription request forwarded to {}", self.url);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::CapturingDispatcher;
    use serde_json::json;

    #[tokio::test]
    async fn test_trigger_dispatches_transcribe_task() {
        let dispatcher = Arc::new(CapturingDispatcher::accepting());
        let trigger = TranscriptionTrigger::new(
            dispatcher.clone(),
            TaskRoutes::new("http://localhost:8080", ""),
        );

        assert!(trigger.trigger("s1", "spy-recordings/s1/RE1.wav").await);

        let tasks = dispatcher.tasks.lock().unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].kind, TaskKind::TranscribeAudio);
        assert_eq!(tasks[0].dispatch_deadline.as_secs(), 1800);
        assert_eq!(
            tasks[0].payload,
            json!({"sessionId": "s1", "storagePath": "spy-recordings/s1/RE1.wav"})
        );
    }

    #[tokio::test]
    async fn test_trigger_reports_rejection() {
        let trigger = TranscriptionTrigger::new(
            Arc::new(CapturingDispatcher::rejecting()),
            TaskRoutes::new("http://localhost:8080", ""),
        );

        assert!(!trigger.trigger("s1", "p").await);
    }

    #[tokio::test]
    async fn test_forward_to_unreachable_endpoint_fails() {
        let forwarder = LocalTranscriptionForwarder::new("http://127.0.0.1:1/transcribe").unwrap();
        assert!(forwarder.forward(&json!({})).await.is_err());
    }
}
