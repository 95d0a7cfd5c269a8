//! Cleanup orchestration.
//!
//! When a PBX call ends, the spy call is hung up, the provider is polled for
//! its recording, and the recording is persisted and handed to
//! transcription. Re-running the sequence for an already harvested session
//! never downloads or uploads again.

pub mod harvest;
pub mod poll;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

pub use harvest::{Harvest, HarvestedRecording, RecordingHarvester};
pub use poll::RecordingPoller;

use crate::db::{SessionStatus, SessionStore};
use crate::dispatch::{TaskDispatcher, TaskKind, TaskRoutes};
use crate::provider::{ProviderError, TelephonyProvider};
use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum CleanupError {
    #[error("session lookup failed: {0:#}")]
    SessionLookup(anyhow::Error),
    #[error("recording download failed: {0}")]
    Download(ProviderError),
    #[error("recording upload failed: {0}")]
    Upload(StorageError),
    #[error("session update failed: {0:#}")]
    StatusUpdate(anyhow::Error),
}

/// Body of a `cleanup_spy_call` task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupSpyCall {
    #[serde(default)]
    pub buffalo_call_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupOutcome {
    NoSession,
    /// Recording already persisted and the session is recorded or completed.
    AlreadyProcessed { session_id: String },
    /// Recording already persisted; transcription was dispatched again.
    TranscriptionRetriggered { session_id: String },
    NoCallSid { session_id: String },
    /// Poll window elapsed without a recording; session marked completed.
    NoRecording { session_id: String },
    Recorded {
        session_id: String,
        recording: HarvestedRecording,
    },
}

impl CleanupOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoSession => "no_session",
            Self::AlreadyProcessed { .. } => "already_processed",
            Self::TranscriptionRetriggered { .. } => "transcription_retriggered",
            Self::NoCallSid { .. } => "no_call_sid",
            Self::NoRecording { .. } => "no_recording",
            Self::Recorded { .. } => "recorded",
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::NoSession => None,
            Self::AlreadyProcessed { session_id }
            | Self::TranscriptionRetriggered { session_id }
            | Self::NoCallSid { session_id }
            | Self::NoRecording { session_id }
            | Self::Recorded { session_id, .. } => Some(session_id),
        }
    }
}

/// Runs the cleanup sequence for one PBX call.
#[derive(Clone)]
pub struct CleanupWorker {
    provider: Arc<dyn TelephonyProvider>,
    sessions: SessionStore,
    poller: RecordingPoller,
    harvester: RecordingHarvester,
}

impl CleanupWorker {
    pub fn new(
        provider: Arc<dyn TelephonyProvider>,
        sessions: SessionStore,
        poller: RecordingPoller,
        harvester: RecordingHarvester,
    ) -> Self {
        Self {
            provider,
            sessions,
            poller,
            harvester,
        }
    }

    pub async fn cleanup(&self, buffalo_call_id: &str) -> Result<CleanupOutcome, CleanupError> {
        let Some(session) = self
            .sessions
            .find_by_buffalo_call_id(buffalo_call_id)
            .map_err(CleanupError::SessionLookup)?
        else {
            info!("No spy session for CallId={}, nothing to clean up", buffalo_call_id);
            return Ok(CleanupOutcome::NoSession);
        };
        let session_id = session.id.clone();

        if session.has_recording() {
            if session.status.is_processed() {
                info!(
                    "Session {} already processed (status={})",
                    session_id,
                    session.status.as_str()
                );
                return Ok(CleanupOutcome::AlreadyProcessed { session_id });
            }

            let path = session.audio_storage_path.as_deref().unwrap_or_default();
            self.harvester.transcription().trigger(&session_id, path).await;
            return Ok(CleanupOutcome::TranscriptionRetriggered { session_id });
        }

        let Some(call_sid) = session.provider_call_sid.clone() else {
            warn!("Session {} has no provider call sid", session_id);
            return Ok(CleanupOutcome::NoCallSid { session_id });
        };

        if session.status.is_active() {
            match self.provider.hangup(&call_sid).await {
                Ok(()) => info!("Spy call {} hung up", call_sid),
                Err(e) => warn!("Hangup of {} failed, continuing: {}", call_sid, e),
            }
        }

        let Some(recording) = self.poller.poll(&call_sid).await else {
            self.sessions
                .update_status(&session_id, SessionStatus::Completed)
                .map_err(CleanupError::StatusUpdate)?;
            return Ok(CleanupOutcome::NoRecording { session_id });
        };

        match self.harvester.harvest(&session, &recording).await? {
            Harvest::Stored(recording) => Ok(CleanupOutcome::Recorded {
                session_id,
                recording,
            }),
            Harvest::AlreadyHarvested => Ok(CleanupOutcome::AlreadyProcessed { session_id }),
        }
    }
}

#[derive(Debug)]
pub enum CleanupDispatch {
    Queued,
    RanInline(Result<CleanupOutcome, CleanupError>),
}

pub struct CleanupOrchestrator {
    dispatcher: Arc<dyn TaskDispatcher>,
    routes: TaskRoutes,
    worker: CleanupWorker,
}

impl CleanupOrchestrator {
    pub fn new(dispatcher: Arc<dyn TaskDispatcher>, routes: TaskRoutes, worker: CleanupWorker) -> Self {
        Self {
            dispatcher,
            routes,
            worker,
        }
    }

    pub async fn on_cleanup_signal(&self, call_id: &str) -> CleanupDispatch {
        let request = CleanupSpyCall {
            buffalo_call_id: call_id.to_string(),
        };

        match self.routes.task_for(TaskKind::CleanupSpyCall, &request) {
            Ok(task) => {
                if self.dispatcher.enqueue(task).await {
                    info!("Cleanup queued for CallId={}", call_id);
                    return CleanupDispatch::Queued;
                }
                warn!(
                    "Dispatch via {} failed for CallId={}, cleaning up inline",
                    self.dispatcher.name(),
                    call_id
                );
            }
            Err(e) => warn!("Could not encode cleanup task for {}: {}", call_id, e),
        }

        let result = self.worker.cleanup(call_id).await;
        if let Err(e) = &result {
            error!("Inline cleanup for CallId={} failed: {}", call_id, e);
        }
        CleanupDispatch::RanInline(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::NewSpySession;
    use crate::provider::RecordingInfo;
    use crate::testing::{CapturingDispatcher, FakeProvider, MemoryStore};
    use crate::transcription::TranscriptionTrigger;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    struct Harness {
        provider: Arc<FakeProvider>,
        storage: Arc<MemoryStore>,
        dispatcher: Arc<CapturingDispatcher>,
        sessions: SessionStore,
        harvester: RecordingHarvester,
        worker: CleanupWorker,
    }

    fn harness(provider: FakeProvider) -> Harness {
        harness_polling(provider, Duration::from_millis(1), Duration::from_millis(3))
    }

    fn harness_polling(provider: FakeProvider, interval: Duration, max_wait: Duration) -> Harness {
        let provider = Arc::new(provider);
        let storage = Arc::new(MemoryStore::default());
        let dispatcher = Arc::new(CapturingDispatcher::accepting());
        let sessions = SessionStore::in_memory().unwrap();
        let routes = TaskRoutes::new("http://localhost:8080", "");

        let poller = RecordingPoller::new(provider.clone(), interval, max_wait);
        let harvester = RecordingHarvester::new(
            provider.clone(),
            storage.clone(),
            sessions.clone(),
            TranscriptionTrigger::new(dispatcher.clone(), routes),
        );
        let worker =
            CleanupWorker::new(provider.clone(), sessions.clone(), poller, harvester.clone());

        Harness {
            provider,
            storage,
            dispatcher,
            sessions,
            harvester,
            worker,
        }
    }

    fn insert_session(sessions: &SessionStore, call_id: &str, call_sid: &str) -> String {
        sessions
            .insert(&NewSpySession {
                buffalo_call_id: call_id.to_string(),
                provider_call_sid: call_sid.to_string(),
                agent_extension: "6190".to_string(),
                direction: "OUTBOUND".to_string(),
                caller_info: "Agent A".to_string(),
                destination_number: "7001234567".to_string(),
            })
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_unknown_call_is_noop() {
        let h = harness(FakeProvider::default());
        assert_eq!(h.worker.cleanup("nope").await.unwrap(), CleanupOutcome::NoSession);
        assert_eq!(h.provider.hangup_count(), 0);
    }

    #[tokio::test]
    async fn test_full_cleanup_persists_recording() {
        let h = harness(FakeProvider::with_recording("RE1", "CA1", 42));
        let session_id = insert_session(&h.sessions, "c1", "CA1");

        let outcome = h.worker.cleanup("c1").await.unwrap();

        let expected_path = format!("spy-recordings/{}/RE1.wav", session_id);
        match &outcome {
            CleanupOutcome::Recorded { recording, .. } => {
                assert_eq!(recording.recording_id, "RE1");
                assert_eq!(recording.storage_path, expected_path);
                assert!(recording.transcription_queued);
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        assert_eq!(*h.provider.hangups.lock().unwrap(), vec!["CA1".to_string()]);
        assert_eq!(h.storage.put_count(), 1);
        assert_eq!(h.dispatcher.kinds(), vec![TaskKind::TranscribeAudio]);

        let session = h.sessions.get(&session_id).unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Recorded);
        assert_eq!(session.duration_seconds, 42);
        assert_eq!(session.audio_storage_path.as_deref(), Some(expected_path.as_str()));
    }

    #[tokio::test]
    async fn test_second_cleanup_does_not_redownload() {
        let h = harness(FakeProvider::with_recording("RE1", "CA1", 42));
        let session_id = insert_session(&h.sessions, "c1", "CA1");

        h.worker.cleanup("c1").await.unwrap();
        let second = h.worker.cleanup("c1").await.unwrap();

        assert_eq!(second, CleanupOutcome::AlreadyProcessed { session_id });
        assert_eq!(h.provider.fetch_count(), 1);
        assert_eq!(h.storage.put_count(), 1);
        assert_eq!(h.provider.hangup_count(), 1);
    }

    #[tokio::test]
    async fn test_recorded_but_active_session_retriggers_transcription() {
        let h = harness(FakeProvider::with_recording("RE1", "CA1", 42));
        let session_id = insert_session(&h.sessions, "c1", "CA1");
        h.sessions
            .mark_recorded(&session_id, "RE1", "spy-recordings/x/RE1.wav", 42)
            .unwrap();
        h.sessions
            .update_status(&session_id, SessionStatus::InProgress)
            .unwrap();

        let outcome = h.worker.cleanup("c1").await.unwrap();

        assert_eq!(
            outcome,
            CleanupOutcome::TranscriptionRetriggered { session_id }
        );
        assert_eq!(h.provider.fetch_count(), 0);
        assert_eq!(h.provider.hangup_count(), 0);
        assert_eq!(h.dispatcher.kinds(), vec![TaskKind::TranscribeAudio]);
    }

    #[tokio::test]
    async fn test_webhook_harvest_during_poll_is_not_repeated() {
        let provider = FakeProvider::with_recording("RE1", "CA1", 42);
        provider.empty_listings.store(2, Ordering::SeqCst);
        provider.fetch_delay_ms.store(50, Ordering::SeqCst);
        let h = harness_polling(provider, Duration::from_millis(30), Duration::from_secs(2));
        let session_id = insert_session(&h.sessions, "c1", "CA1");

        let worker = h.worker.clone();
        let cleanup = tokio::spawn(async move { worker.cleanup("c1").await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        let session = h.sessions.get(&session_id).unwrap().unwrap();
        let recording = RecordingInfo {
            sid: "RE1".to_string(),
            call_sid: "CA1".to_string(),
            duration_seconds: 42,
        };
        let webhook = h.harvester.harvest(&session, &recording).await.unwrap();
        assert!(matches!(webhook, Harvest::Stored(_)));

        let outcome = cleanup.await.unwrap().unwrap();
        assert_eq!(outcome, CleanupOutcome::AlreadyProcessed { session_id });
        assert_eq!(h.provider.fetch_count(), 1);
        assert_eq!(h.storage.put_count(), 1);
        assert_eq!(h.dispatcher.kinds(), vec![TaskKind::TranscribeAudio]);
    }

    #[tokio::test]
    async fn test_concurrent_harvests_store_once() {
        let provider = FakeProvider::default();
        provider.fetch_delay_ms.store(30, Ordering::SeqCst);
        let h = harness(provider);
        let session_id = insert_session(&h.sessions, "c1", "CA1");
        let session = h.sessions.get(&session_id).unwrap().unwrap();
        let recording = RecordingInfo {
            sid: "RE1".to_string(),
            call_sid: "CA1".to_string(),
            duration_seconds: 42,
        };

        let (first, second) = tokio::join!(
            h.harvester.harvest(&session, &recording),
            h.harvester.harvest(&session, &recording)
        );

        let stored = [first.unwrap(), second.unwrap()]
            .iter()
            .filter(|result| matches!(result, Harvest::Stored(_)))
            .count();
        assert_eq!(stored, 1);
        assert_eq!(h.provider.fetch_count(), 1);
        assert_eq!(h.dispatcher.kinds(), vec![TaskKind::TranscribeAudio]);
    }

    #[tokio::test]
    async fn test_failed_session_with_recording_retriggers_transcription() {
        let h = harness(FakeProvider::default());
        let session_id = insert_session(&h.sessions, "c1", "CA1");
        h.sessions
            .mark_recorded(&session_id, "RE1", "spy-recordings/x/RE1.wav", 42)
            .unwrap();
        h.sessions
            .update_status(&session_id, SessionStatus::Failed)
            .unwrap();

        let outcome = h.worker.cleanup("c1").await.unwrap();

        assert_eq!(
            outcome,
            CleanupOutcome::TranscriptionRetriggered { session_id }
        );
        assert_eq!(h.provider.fetch_count(), 0);
        assert_eq!(h.dispatcher.kinds(), vec![TaskKind::TranscribeAudio]);
    }

    #[tokio::test]
    async fn test_no_recording_marks_completed() {
        let h = harness(FakeProvider::default());
        let session_id = insert_session(&h.sessions, "c1", "CA1");

        let outcome = h.worker.cleanup("c1").await.unwrap();

        assert_eq!(
            outcome,
            CleanupOutcome::NoRecording {
                session_id: session_id.clone()
            }
        );
        let session = h.sessions.get(&session_id).unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert!(!session.has_recording());
    }

    #[tokio::test]
    async fn test_hangup_failure_is_swallowed() {
        let provider = FakeProvider::with_recording("RE1", "CA1", 5);
        provider.fail_hangup.store(true, Ordering::SeqCst);
        let h = harness(provider);
        insert_session(&h.sessions, "c1", "CA1");

        let outcome = h.worker.cleanup("c1").await.unwrap();

        assert_eq!(outcome.as_str(), "recorded");
        assert_eq!(h.provider.hangup_count(), 1);
    }

    #[tokio::test]
    async fn test_terminal_session_is_not_hung_up() {
        let h = harness(FakeProvider::default());
        let session_id = insert_session(&h.sessions, "c1", "CA1");
        h.sessions
            .update_status(&session_id, SessionStatus::Failed)
            .unwrap();

        h.worker.cleanup("c1").await.unwrap();
        assert_eq!(h.provider.hangup_count(), 0);
    }

    #[tokio::test]
    async fn test_download_failure_is_hard_error() {
        let provider = FakeProvider::with_recording("RE1", "CA1", 5);
        provider.fail_fetch.store(true, Ordering::SeqCst);
        let h = harness(provider);
        let session_id = insert_session(&h.sessions, "c1", "CA1");

        let err = h.worker.cleanup("c1").await.unwrap_err();

        assert!(matches!(err, CleanupError::Download(_)));
        assert_eq!(h.storage.put_count(), 0);
        let session = h.sessions.get(&session_id).unwrap().unwrap();
        assert!(!session.has_recording());
    }

    #[tokio::test]
    async fn test_upload_failure_is_hard_error() {
        let h = harness(FakeProvider::with_recording("RE1", "CA1", 5));
        h.storage.fail.store(true, Ordering::SeqCst);
        insert_session(&h.sessions, "c1", "CA1");

        let err = h.worker.cleanup("c1").await.unwrap_err();
        assert!(matches!(err, CleanupError::Upload(_)));
        assert!(h.dispatcher.kinds().is_empty());
    }

    #[tokio::test]
    async fn test_orchestrator_queues_cleanup() {
        let h = harness(FakeProvider::default());
        let dispatcher = Arc::new(CapturingDispatcher::accepting());
        let orchestrator = CleanupOrchestrator::new(
            dispatcher.clone(),
            TaskRoutes::new("http://localhost:8080", ""),
            h.worker.clone(),
        );

        let result = orchestrator.on_cleanup_signal("c1").await;

        assert!(matches!(result, CleanupDispatch::Queued));
        let tasks = dispatcher.tasks.lock().unwrap();
        assert_eq!(tasks[0].kind, TaskKind::CleanupSpyCall);
        assert_eq!(tasks[0].payload["buffaloCallId"], "c1");
        assert_eq!(tasks[0].dispatch_deadline, Duration::from_secs(600));
    }

    #[tokio::test]
    async fn test_orchestrator_falls_back_inline() {
        let h = harness(FakeProvider::with_recording("RE1", "CA1", 5));
        insert_session(&h.sessions, "c1", "CA1");
        let orchestrator = CleanupOrchestrator::new(
            Arc::new(CapturingDispatcher::rejecting()),
            TaskRoutes::new("http://localhost:8080", ""),
            h.worker.clone(),
        );

        match orchestrator.on_cleanup_signal("c1").await {
            CleanupDispatch::RanInline(Ok(outcome)) => assert_eq!(outcome.as_str(), "recorded"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(h.storage.put_count(), 1);
    }
}
