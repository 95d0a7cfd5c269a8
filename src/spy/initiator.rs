use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};

use crate::config::Config;
use crate::correlation::PendingCall;
use crate::db::{NewSpySession, SessionStore};
use crate::provider::{SpyCallRequest, TelephonyProvider};

/// Body of a `start_spy_call` task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSpyCall {
    #[serde(default)]
    pub extension: String,
    #[serde(default)]
    pub buffalo_call_id: String,
    #[serde(default)]
    pub direction: Option<String>,
    #[serde(default)]
    pub caller: Option<String>,
    #[serde(default)]
    pub dest_num: Option<String>,
    #[serde(default)]
    pub spy_number: Option<String>,
    #[serde(default)]
    pub snumber: Option<String>,
    #[serde(default)]
    pub dnumber: Option<String>,
    #[serde(default)]
    pub cnumber: Option<String>,
}

impl From<&PendingCall> for StartSpyCall {
    fn from(call: &PendingCall) -> Self {
        Self {
            extension: call.agent_extension.clone(),
            buffalo_call_id: call.call_id.clone(),
            direction: Some(call.direction.as_str().to_string()),
            caller: Some(call.caller_display.clone()),
            dest_num: Some(call.destination_number.clone()),
            spy_number: Some(call.agent_extension.clone()),
            snumber: call.snumber.clone(),
            dnumber: call.dnumber.clone(),
            cnumber: call.cnumber.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpyCallStarted {
    pub call_sid: String,
    pub session_id: String,
    pub buffalo_call_id: String,
}

/// A spy call could not be started. Reported, never raised.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("spy call for extension {extension} (call {buffalo_call_id}) failed: {reason}")]
pub struct SpyFailure {
    pub extension: String,
    pub buffalo_call_id: String,
    pub reason: String,
}

/// Dial plan and webhook settings for spy calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpyCallSettings {
    pub spy_prefix: String,
    pub sip_host: String,
    pub sip_port: u16,
    pub from_number: String,
    pub webhook_base_url: String,
    pub call_timeout_secs: u64,
}

impl SpyCallSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            spy_prefix: config.pbx.spy_prefix.clone(),
            sip_host: config.pbx.sip_host.clone(),
            sip_port: config.pbx.sip_port,
            from_number: config.provider.from_number.clone(),
            webhook_base_url: config
                .provider
                .webhook_base_url
                .trim_end_matches('/')
                .to_string(),
            call_timeout_secs: config.provider.call_timeout_secs,
        }
    }

    /// SIP URI that joins `extension`'s call through the spy feature code.
    pub fn dial_target(&self, extension: &str) -> String {
        format!(
            "sip:{}{}@{}:{}",
            self.spy_prefix, extension, self.sip_host, self.sip_port
        )
    }

    pub fn call_request(&self, extension: &str) -> SpyCallRequest {
        let base = &self.webhook_base_url;
        SpyCallRequest {
            to: self.dial_target(extension),
            from: self.from_number.clone(),
            voice_url: format!("{}/api/twilio/voice", base),
            status_callback_url: format!("{}/api/twilio/call-status", base),
            recording_callback_url: format!("{}/api/twilio/recording", base),
            timeout_secs: self.call_timeout_secs,
        }
    }
}

/// Creates the recorded provider call and its session row.
#[derive(Clone)]
pub struct SpyCallInitiator {
    provider: Arc<dyn TelephonyProvider>,
    sessions: SessionStore,
    settings: SpyCallSettings,
}

impl SpyCallInitiator {
    pub fn new(
        provider: Arc<dyn TelephonyProvider>,
        sessions: SessionStore,
        settings: SpyCallSettings,
    ) -> Self {
        Self {
            provider,
            sessions,
            settings,
        }
    }

    pub fn settings(&self) -> &SpyCallSettings {
        &self.settings
    }

    pub async fn initiate(&self, request: &StartSpyCall) -> Result<SpyCallStarted, SpyFailure> {
        let failure = |reason: String| SpyFailure {
            extension: request.extension.clone(),
            buffalo_call_id: request.buffalo_call_id.clone(),
            reason,
        };

        if request.extension.is_empty() || request.buffalo_call_id.is_empty() {
            return Err(failure("missing extension or buffaloCallId".to_string()));
        }

        let direction = request
            .direction
            .clone()
            .unwrap_or_else(|| "UNKNOWN".to_string());

        info!(
            "Initiating spy call - Extension={}, BuffaloCallId={}, Direction={}",
            request.extension, request.buffalo_call_id, direction
        );

        let call_request = self.settings.call_request(&request.extension);
        let call_sid = match self.provider.create_call(&call_request).await {
            Ok(sid) => sid,
            Err(e) => {
                error!(
                    "Provider rejected spy call - Extension={}, Error={}",
                    request.extension, e
                );
                return Err(failure(e.to_string()));
            }
        };

        info!("Spy call created - CallSid={}, SIP={}", call_sid, call_request.to);

        let session = self
            .sessions
            .insert(&NewSpySession {
                buffalo_call_id: request.buffalo_call_id.clone(),
                provider_call_sid: call_sid.clone(),
                agent_extension: request.extension.clone(),
                direction,
                caller_info: request
                    .caller
                    .clone()
                    .unwrap_or_else(|| "Unknown".to_string()),
                destination_number: request
                    .dest_num
                    .clone()
                    .unwrap_or_else(|| "N/A".to_string()),
            })
            .map_err(|e| {
                error!("Failed to create session for CallSid={}: {:#}", call_sid, e);
                failure(format!("failed to create session record: {}", e))
            })?;

        info!(
            "Session created - SessionId={}, CallSid={}",
            session.id, call_sid
        );

        Ok(SpyCallStarted {
            call_sid,
            session_id: session.id,
            buffalo_call_id: request.buffalo_call_id.clone(),
        })
    }
}
