use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Lifecycle of a spy session row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Initiated,
    Calling,
    InProgress,
    Recorded,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn parse(s: &str) -> Result<SessionStatus> {
        match s {
            "initiated" => Ok(Self::Initiated),
            "calling" => Ok(Self::Calling),
            "in_progress" => Ok(Self::InProgress),
            "recorded" => Ok(Self::Recorded),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => anyhow::bail!("Invalid session status: {}", s),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initiated => "initiated",
            Self::Calling => "calling",
            Self::InProgress => "in_progress",
            Self::Recorded => "recorded",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// The provider call may still be up.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Initiated | Self::Calling | Self::InProgress)
    }

    /// A stored recording needs no further transcription dispatch.
    /// `failed` is terminal but not processed.
    pub fn is_processed(&self) -> bool {
        matches!(self, Self::Recorded | Self::Completed)
    }
}

/// Fields known when the spy call has just been created.
#[derive(Debug, Clone)]
pub struct NewSpySession {
    pub buffalo_call_id: String,
    pub provider_call_sid: String,
    pub agent_extension: String,
    pub direction: String,
    pub caller_info: String,
    pub destination_number: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpySession {
    pub id: String,
    pub buffalo_call_id: String,
    pub provider_call_sid: Option<String>,
    pub agent_extension: String,
    pub direction: String,
    pub caller_info: String,
    pub destination_number: String,
    pub status: SessionStatus,
    pub recording_id: Option<String>,
    pub audio_storage_path: Option<String>,
    pub duration_seconds: i64,
    pub created_at: String,
    pub updated_at: String,
    pub recorded_at: Option<String>,
}

impl SpySession {
    /// A recording has already been downloaded and persisted for this session.
    pub fn has_recording(&self) -> bool {
        self.recording_id.is_some() && self.audio_storage_path.is_some()
    }
}
