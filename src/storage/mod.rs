//! Durable object storage for harvested recordings.

pub mod local;
pub mod supabase;

use async_trait::async_trait;
use thiserror::Error;

pub use local::LocalStorage;
pub use supabase::SupabaseStorage;

const RECORDINGS_PREFIX: &str = "spy-recordings";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("storage returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid object path: {0}")]
    InvalidPath(String),
    #[error("storage is not configured: {0}")]
    NotConfigured(&'static str),
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn name(&self) -> &'static str;

    /// Write `bytes` at `path`, overwriting any existing object.
    /// Returns the stored path.
    async fn put(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, StorageError>;
}

pub fn extension_for(content_type: &str) -> &'static str {
    match content_type.split(';').next().map(str::trim) {
        Some("audio/mpeg") | Some("audio/mp3") => "mp3",
        _ => "wav",
    }
}

/// `spy-recordings/<session>/<recording>.<ext>`
pub fn recording_storage_path(session_id: &str, recording_id: &str, content_type: &str) -> String {
    format!(
        "{}/{}/{}.{}",
        RECORDINGS_PREFIX,
        session_id,
        recording_id,
        extension_for(content_type)
    )
}
