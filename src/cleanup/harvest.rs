use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use super::CleanupError;
use crate::db::{SessionStore, SpySession};
use crate::provider::{RecordingInfo, TelephonyProvider};
use crate::storage::{recording_storage_path, ObjectStore};
use crate::transcription::TranscriptionTrigger;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarvestedRecording {
    pub recording_id: String,
    pub storage_path: String,
    pub duration_seconds: i64,
    pub transcription_queued: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Harvest {
    Stored(HarvestedRecording),
    /// Another path already persisted a recording for the session.
    AlreadyHarvested,
}

type SessionLocks = Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>;

/// Moves a finished recording from the provider into durable storage.
/// Used by both the cleanup sequence and the recording webhook.
#[derive(Clone)]
pub struct RecordingHarvester {
    provider: Arc<dyn TelephonyProvider>,
    storage: Arc<dyn ObjectStore>,
    sessions: SessionStore,
    transcription: TranscriptionTrigger,
    in_flight: SessionLocks,
}

impl RecordingHarvester {
    pub fn new(
        provider: Arc<dyn TelephonyProvider>,
        storage: Arc<dyn ObjectStore>,
        sessions: SessionStore,
        transcription: TranscriptionTrigger,
    ) -> Self {
        Self {
            provider,
            storage,
            sessions,
            transcription,
            in_flight: SessionLocks::default(),
        }
    }

    pub fn transcription(&self) -> &TranscriptionTrigger {
        &self.transcription
    }

    /// Download, upload and record. Harvests of the same session are
    /// serialized, and a session that already has a recording is left alone.
    /// Any failure before the session row is updated is returned; a failed
    /// transcription dispatch is not.
    pub async fn harvest(
        &self,
        session: &SpySession,
        recording: &RecordingInfo,
    ) -> Result<Harvest, CleanupError> {
        let lock = self.session_lock(&session.id);
        let result = {
            let _guard = lock.lock().await;
            self.harvest_locked(session, recording).await
        };
        drop(lock);
        self.release_lock(&session.id);
        result
    }

    async fn harvest_locked(
        &self,
        session: &SpySession,
        recording: &RecordingInfo,
    ) -> Result<Harvest, CleanupError> {
        let current = self
            .sessions
            .get(&session.id)
            .map_err(CleanupError::SessionLookup)?;
        if current.as_ref().is_some_and(SpySession::has_recording) {
            info!(
                "Session {} already has its recording, skipping {}",
                session.id, recording.sid
            );
            return Ok(Harvest::AlreadyHarvested);
        }

        let audio = self
            .provider
            .fetch_recording(recording)
            .await
            .map_err(CleanupError::Download)?;

        let path = recording_storage_path(&session.id, &recording.sid, &audio.content_type);
        let size = audio.bytes.len();
        let stored = self
            .storage
            .put(&path, audio.bytes, &audio.content_type)
            .await
            .map_err(CleanupError::Upload)?;

        info!(
            "Recording {} stored at {} ({} bytes, {})",
            recording.sid,
            stored,
            size,
            self.storage.name()
        );

        let updated = self
            .sessions
            .mark_recorded(
                &session.id,
                &recording.sid,
                &stored,
                recording.duration_seconds,
            )
            .map_err(CleanupError::StatusUpdate)?;
        if !updated {
            warn!(
                "Session {} was recorded by another worker, {} not linked",
                session.id, recording.sid
            );
            return Ok(Harvest::AlreadyHarvested);
        }

        let transcription_queued = self.transcription.trigger(&session.id, &stored).await;

        Ok(Harvest::Stored(HarvestedRecording {
            recording_id: recording.sid.clone(),
            storage_path: stored,
            duration_seconds: recording.duration_seconds,
            transcription_queued,
        }))
    }

    fn session_lock(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(locks.entry(session_id.to_string()).or_default())
    }

    fn release_lock(&self, session_id: &str) {
        let mut locks = self
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if locks
            .get(session_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(session_id);
        }
    }
}
