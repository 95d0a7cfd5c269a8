//! In-memory collaborators shared by unit tests.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::dispatch::{DispatchTask, TaskDispatcher};
use crate::provider::{
    ProviderError, RecordingAudio, RecordingInfo, SpyCallRequest, TelephonyProvider,
};
use crate::storage::{ObjectStore, StorageError};

#[derive(Default)]
pub struct FakeProvider {
    pub created: Mutex<Vec<SpyCallRequest>>,
    pub hangups: Mutex<Vec<String>>,
    pub recordings: Mutex<Vec<RecordingInfo>>,
    /// Listing calls that return nothing before recordings become visible.
    pub empty_listings: AtomicUsize,
    pub list_calls: AtomicUsize,
    pub fetches: AtomicUsize,
    pub fail_create: AtomicBool,
    pub fail_hangup: AtomicBool,
    pub fail_fetch: AtomicBool,
    /// Milliseconds `create_call` and `fetch_recording` take.
    pub create_delay_ms: AtomicU64,
    pub fetch_delay_ms: AtomicU64,
}

impl FakeProvider {
    pub fn with_recording(sid: &str, call_sid: &str, duration: i64) -> Self {
        let provider = Self::default();
        provider.add_recording(sid, call_sid, duration);
        provider
    }

    pub fn add_recording(&self, sid: &str, call_sid: &str, duration: i64) {
        self.recordings.lock().unwrap().push(RecordingInfo {
            sid: sid.to_string(),
            call_sid: call_sid.to_string(),
            duration_seconds: duration,
        });
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn hangup_count(&self) -> usize {
        self.hangups.lock().unwrap().len()
    }
}

async fn pause(delay_ms: &AtomicU64) {
    let ms = delay_ms.load(Ordering::SeqCst);
    if ms > 0 {
        tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
    }
}

#[async_trait]
impl TelephonyProvider for FakeProvider {
    async fn create_call(&self, request: &SpyCallRequest) -> Result<String, ProviderError> {
        pause(&self.create_delay_ms).await;
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(ProviderError::Status {
                status: 400,
                body: "invalid To".to_string(),
            });
        }
        let mut created = self.created.lock().unwrap();
        created.push(request.clone());
        Ok(format!("CA{}", created.len()))
    }

    async fn hangup(&self, call_sid: &str) -> Result<(), ProviderError> {
        self.hangups.lock().unwrap().push(call_sid.to_string());
        if self.fail_hangup.load(Ordering::SeqCst) {
            return Err(ProviderError::Status {
                status: 404,
                body: "call not found".to_string(),
            });
        }
        Ok(())
    }

    async fn list_recordings(&self, call_sid: &str) -> Result<Vec<RecordingInfo>, ProviderError> {
        let n = self.list_calls.fetch_add(1, Ordering::SeqCst);
        if n < self.empty_listings.load(Ordering::SeqCst) {
            return Ok(Vec::new());
        }
        Ok(self
            .recordings
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.call_sid == call_sid)
            .cloned()
            .collect())
    }

    async fn fetch_recording(
        &self,
        _recording: &RecordingInfo,
    ) -> Result<RecordingAudio, ProviderError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        pause(&self.fetch_delay_ms).await;
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(ProviderError::Status {
                status: 500,
                body: "fetch failed".to_string(),
            });
        }
        Ok(RecordingAudio {
            bytes: vec![0u8; 16],
            content_type: "audio/x-wav".to_string(),
        })
    }
}

#[derive(Default)]
pub struct MemoryStore {
    pub puts: Mutex<Vec<(String, usize)>>,
    pub fail: AtomicBool,
}

impl MemoryStore {
    pub fn put_count(&self) -> usize {
        self.puts.lock().unwrap().len()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn put(
        &self,
        path: &str,
        bytes: Vec<u8>,
        _content_type: &str,
    ) -> Result<String, StorageError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(StorageError::Status {
                status: 503,
                body: "unavailable".to_string(),
            });
        }
        self.puts
            .lock()
            .unwrap()
            .push((path.to_string(), bytes.len()));
        Ok(path.to_string())
    }
}

pub struct CapturingDispatcher {
    pub accept: AtomicBool,
    pub tasks: Mutex<Vec<DispatchTask>>,
}

impl CapturingDispatcher {
    pub fn accepting() -> Self {
        Self {
            accept: AtomicBool::new(true),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn rejecting() -> Self {
        Self {
            accept: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn kinds(&self) -> Vec<crate::dispatch::TaskKind> {
        self.tasks.lock().unwrap().iter().map(|t| t.kind).collect()
    }
}

#[async_trait]
impl TaskDispatcher for CapturingDispatcher {
    fn name(&self) -> &'static str {
        "capture"
    }

    async fn enqueue(&self, task: DispatchTask) -> bool {
        self.tasks.lock().unwrap().push(task);
        self.accept.load(Ordering::SeqCst)
    }
}
