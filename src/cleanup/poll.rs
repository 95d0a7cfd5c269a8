use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::provider::{RecordingInfo, TelephonyProvider};

/// Bounded wait for the provider to publish a call's recording.
#[derive(Clone)]
pub struct RecordingPoller {
    provider: Arc<dyn TelephonyProvider>,
    interval: Duration,
    max_wait: Duration,
}

impl RecordingPoller {
    pub fn new(provider: Arc<dyn TelephonyProvider>, interval: Duration, max_wait: Duration) -> Self {
        Self {
            provider,
            interval,
            max_wait,
        }
    }

    pub fn max_attempts(&self) -> u128 {
        (self.max_wait.as_millis() / self.interval.as_millis().max(1)).max(1)
    }

    /// Returns the first recording listed for `call_sid`, or `None` once the
    /// wait is exhausted. Listing errors are logged and polling continues.
    pub async fn poll(&self, call_sid: &str) -> Option<RecordingInfo> {
        let max_attempts = self.max_attempts();

        for attempt in 0..max_attempts {
            match self.provider.list_recordings(call_sid).await {
                Ok(recordings) => {
                    if let Some(recording) = recordings.into_iter().next() {
                        info!(
                            "Recording {} found for CallSid={} after {} attempt(s)",
                            recording.sid,
                            call_sid,
                            attempt + 1
                        );
                        return Some(recording);
                    }
                    debug!(
                        "No recording yet for CallSid={} ({}/{})",
                        call_sid,
                        attempt + 1,
                        max_attempts
                    );
                }
                Err(e) => warn!("Listing recordings for CallSid={} failed: {}", call_sid, e),
            }

            if attempt + 1 < max_attempts {
                sleep(self.interval).await;
            }
        }

        info!(
            "No recording for CallSid={} after {}s",
            call_sid,
            self.max_wait.as_secs()
        );
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeProvider;
    use std::sync::atomic::Ordering;

    fn poller(provider: Arc<FakeProvider>, max_wait_ms: u64) -> RecordingPoller {
        RecordingPoller::new(
            provider,
            Duration::from_millis(1),
            Duration::from_millis(max_wait_ms),
        )
    }

    #[test]
    fn test_max_attempts() {
        let provider = Arc::new(FakeProvider::default());
        let poller = RecordingPoller::new(
            provider.clone(),
            Duration::from_secs(10),
            Duration::from_secs(300),
        );
        assert_eq!(poller.max_attempts(), 30);

        let poller = RecordingPoller::new(provider, Duration::from_secs(10), Duration::from_secs(5));
        assert_eq!(poller.max_attempts(), 1);
    }

    #[tokio::test]
    async fn test_returns_first_hit() {
        let provider = Arc::new(FakeProvider::with_recording("RE1", "CA1", 12));
        provider.empty_listings.store(2, Ordering::SeqCst);

        let recording = poller(provider.clone(), 10).poll("CA1").await.unwrap();

        assert_eq!(recording.sid, "RE1");
        assert_eq!(provider.list_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_wait() {
        let provider = Arc::new(FakeProvider::default());

        assert!(poller(provider.clone(), 5).poll("CA1").await.is_none());
        assert_eq!(provider.list_calls.load(Ordering::SeqCst), 5);
    }
}
