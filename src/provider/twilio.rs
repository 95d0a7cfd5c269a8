use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info};

use super::{ProviderError, RecordingAudio, RecordingInfo, SpyCallRequest, TelephonyProvider};
use crate::config::ProviderConfig;

const STATUS_EVENTS: [&str; 4] = ["initiated", "ringing", "answered", "completed"];
const DEFAULT_AUDIO_TYPE: &str = "audio/wav";

#[derive(Debug, Deserialize)]
struct CallResponse {
    sid: String,
}

#[derive(Debug, Deserialize)]
struct RecordingList {
    #[serde(default)]
    recordings: Vec<Value>,
}

pub struct TwilioProvider {
    client: reqwest::Client,
    account_sid: String,
    auth_token: String,
    base_url: String,
}

impl TwilioProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self, ProviderError> {
        if config.account_sid.is_empty() || config.auth_token.is_empty() {
            return Err(ProviderError::NotConfigured(
                "TWILIO_ACCOUNT_SID and TWILIO_AUTH_TOKEN are required",
            ));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;

        info!(
            "Initialized Twilio provider with base URL: {}",
            config.api_base_url
        );

        Ok(Self {
            client,
            account_sid: config.account_sid.clone(),
            auth_token: config.auth_token.clone(),
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
        })
    }

    fn account_url(&self, path: &str) -> String {
        format!("{}/Accounts/{}/{}", self.base_url, self.account_sid, path)
    }

    async fn checked(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ProviderError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

/// Form body for creating a recorded spy call.
pub fn call_form(request: &SpyCallRequest) -> Vec<(&'static str, String)> {
    let mut form = vec![
        ("To", request.to.clone()),
        ("From", request.from.clone()),
        ("Url", request.voice_url.clone()),
        ("Method", "POST".to_string()),
        ("StatusCallback", request.status_callback_url.clone()),
        ("StatusCallbackMethod", "POST".to_string()),
    ];
    for event in STATUS_EVENTS {
        form.push(("StatusCallbackEvent", event.to_string()));
    }
    form.extend([
        ("Record", "true".to_string()),
        ("RecordingChannels", "dual".to_string()),
        (
            "RecordingStatusCallback",
            request.recording_callback_url.clone(),
        ),
        ("RecordingStatusCallbackMethod", "POST".to_string()),
        ("Timeout", request.timeout_secs.to_string()),
    ]);
    form
}

/// Parse a `Recordings.json` listing. Duration arrives as a string or a
/// number and is missing while the recording is still processing.
pub fn parse_recordings(body: &str) -> Result<Vec<RecordingInfo>, ProviderError> {
    let list: RecordingList =
        serde_json::from_str(body).map_err(|e| ProviderError::Decode(e.to_string()))?;

    Ok(list
        .recordings
        .iter()
        .filter_map(|item| {
            let sid = item.get("sid")?.as_str()?.to_string();
            let call_sid = item
                .get("call_sid")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let duration_seconds = match item.get("duration") {
                Some(Value::String(s)) => s.parse().unwrap_or(0),
                Some(Value::Number(n)) => n.as_i64().unwrap_or(0),
                _ => 0,
            };
            Some(RecordingInfo {
                sid,
                call_sid,
                duration_seconds,
            })
        })
        .collect())
}

#[async_trait]
impl TelephonyProvider for TwilioProvider {
    async fn create_call(&self, request: &SpyCallRequest) -> Result<String, ProviderError> {
        debug!("Creating spy call to {}", request.to);

        let response = self
            .client
            .post(self.account_url("Calls.json"))
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&call_form(request))
            .send()
            .await?;
        let body = Self::checked(response).await?.text().await?;

        let call: CallResponse =
            serde_json::from_str(&body).map_err(|e| ProviderError::Decode(e.to_string()))?;
        Ok(call.sid)
    }

    async fn hangup(&self, call_sid: &str) -> Result<(), ProviderError> {
        debug!("Hanging up call {}", call_sid);

        let response = self
            .client
            .post(self.account_url(&format!("Calls/{}.json", call_sid)))
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&[("Status", "completed")])
            .send()
            .await?;
        Self::checked(response).await?;
        Ok(())
    }

    async fn list_recordings(&self, call_sid: &str) -> Result<Vec<RecordingInfo>, ProviderError> {
        let response = self
            .client
            .get(self.account_url("Recordings.json"))
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .query(&[("CallSid", call_sid), ("PageSize", "1")])
            .send()
            .await?;
        let body = Self::checked(response).await?.text().await?;
        parse_recordings(&body)
    }

    async fn fetch_recording(
        &self,
        recording: &RecordingInfo,
    ) -> Result<RecordingAudio, ProviderError> {
        debug!("Downloading recording {}", recording.sid);

        let response = self
            .client
            .get(self.account_url(&format!("Recordings/{}.wav", recording.sid)))
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .send()
            .await?;
        let response = Self::checked(response).await?;

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(DEFAULT_AUDIO_TYPE)
            .to_string();
        let bytes = response.bytes().await?.to_vec();

        info!(
            "Downloaded recording {} ({} bytes, {})",
            recording.sid,
            bytes.len(),
            content_type
        );

        Ok(RecordingAudio {
            bytes,
            content_type,
        })
    }
}
