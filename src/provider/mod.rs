//! Telephony provider seam.
//!
//! Creates the silent spy call, hangs it up, and gives access to the
//! recordings the provider captured for it.

pub mod twilio;

use async_trait::async_trait;
use thiserror::Error;

pub use twilio::TwilioProvider;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("unexpected provider response: {0}")]
    Decode(String),
    #[error("provider is not configured: {0}")]
    NotConfigured(&'static str),
}

/// Parameters for one outbound spy call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpyCallRequest {
    /// SIP URI that joins the agent's call silently.
    pub to: String,
    pub from: String,
    pub voice_url: String,
    pub status_callback_url: String,
    pub recording_callback_url: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingInfo {
    pub sid: String,
    pub call_sid: String,
    pub duration_seconds: i64,
}

#[derive(Debug, Clone)]
pub struct RecordingAudio {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

#[async_trait]
pub trait TelephonyProvider: Send + Sync {
    /// Returns the provider call id.
    async fn create_call(&self, request: &SpyCallRequest) -> Result<String, ProviderError>;

    async fn hangup(&self, call_sid: &str) -> Result<(), ProviderError>;

    /// Recordings attached to a call, newest first.
    async fn list_recordings(&self, call_sid: &str) -> Result<Vec<RecordingInfo>, ProviderError>;

    async fn fetch_recording(&self, recording: &RecordingInfo)
        -> Result<RecordingAudio, ProviderError>;
}
