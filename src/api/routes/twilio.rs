//! Provider webhooks for the spy call.
//!
//! - POST /api/twilio/voice        - TwiML that keeps the spy leg open
//! - POST /api/twilio/call-status  - Call progress updates
//! - POST /api/twilio/recording    - Recording completed

use axum::{
    extract::{Form, State},
    http::header,
    response::{IntoResponse, Json},
    routing::post,
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use super::super::error::{ApiError, ApiResult};
use super::super::WorkerState;
use crate::cleanup::Harvest;
use crate::db::SessionStatus;
use crate::provider::RecordingInfo;

/// Keeps the spy leg connected for up to 30 minutes.
pub const MONITOR_TWIML: &str = concat!(
    r#"<?xml version="1.0" encoding="UTF-8"?>"#,
    r#"<Response><Say voice="alice" language="en-US">Connecting to monitoring session</Say>"#,
    r#"<Pause length="1800"/></Response>"#
);

pub fn router(state: WorkerState) -> Router {
    Router::new()
        .route("/voice", post(voice))
        .route("/call-status", post(call_status))
        .route("/recording", post(recording))
        .with_state(state)
}

async fn voice() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/xml; charset=utf-8")],
        MONITOR_TWIML,
    )
}

/// Session status for a provider call status. `completed` is left to the
/// cleanup sequence, which owns the final transition.
pub fn map_call_status(status: &str) -> Option<SessionStatus> {
    match status {
        "queued" | "initiated" => Some(SessionStatus::Initiated),
        "ringing" => Some(SessionStatus::Calling),
        "in-progress" => Some(SessionStatus::InProgress),
        "busy" | "failed" | "no-answer" | "canceled" => Some(SessionStatus::Failed),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CallStatusForm {
    #[serde(default)]
    call_sid: String,
    #[serde(default)]
    call_status: String,
}

async fn call_status(
    State(state): State<WorkerState>,
    Form(form): Form<CallStatusForm>,
) -> ApiResult<Json<Value>> {
    info!(
        "Call status webhook - CallSid={}, Status={}",
        form.call_sid, form.call_status
    );

    if form.call_sid.is_empty() {
        return Err(ApiError::bad_request("Missing CallSid"));
    }

    let Some(session) = state.sessions.find_by_call_sid(&form.call_sid)? else {
        warn!("No session for CallSid={}", form.call_sid);
        return Ok(Json(json!({ "success": true, "updated": false })));
    };

    let updated = match map_call_status(&form.call_status) {
        Some(status) => state.sessions.advance_status(&session.id, status)?,
        None => false,
    };

    Ok(Json(json!({
        "success": true,
        "updated": updated,
        "sessionId": session.id,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RecordingForm {
    #[serde(default)]
    recording_sid: String,
    #[serde(default)]
    recording_status: String,
    #[serde(default)]
    call_sid: String,
    #[serde(default)]
    recording_duration: Option<String>,
}

async fn recording(
    State(state): State<WorkerState>,
    Form(form): Form<RecordingForm>,
) -> ApiResult<Json<Value>> {
    info!(
        "Recording webhook - RecordingSid={}, Status={}, CallSid={}",
        form.recording_sid, form.recording_status, form.call_sid
    );

    if form.recording_sid.is_empty() || form.call_sid.is_empty() {
        return Err(ApiError::bad_request("Missing RecordingSid or CallSid"));
    }

    if form.recording_status != "completed" {
        return Ok(Json(json!({
            "success": true,
            "skipped": true,
            "recordingStatus": form.recording_status,
        })));
    }

    let Some(session) = state.sessions.find_by_call_sid(&form.call_sid)? else {
        return Err(ApiError::not_found(format!(
            "No session for CallSid {}",
            form.call_sid
        )));
    };

    if session.has_recording() {
        info!("Session {} already has its recording", session.id);
        return Ok(Json(json!({
            "success": true,
            "sessionId": session.id,
            "alreadyProcessed": true,
        })));
    }

    let recording = RecordingInfo {
        sid: form.recording_sid.clone(),
        call_sid: form.call_sid.clone(),
        duration_seconds: form
            .recording_duration
            .as_deref()
            .and_then(|d| d.trim().parse().ok())
            .unwrap_or(0),
    };

    let harvested = state
        .harvester
        .harvest(&session, &recording)
        .await
        .map_err(|e| {
            error!("Recording {} harvest failed: {}", form.recording_sid, e);
            ApiError::internal(e.to_string())
        })?;

    match harvested {
        Harvest::Stored(harvested) => Ok(Json(json!({
            "success": true,
            "sessionId": session.id,
            "storagePath": harvested.storage_path,
            "transcriptionQueued": harvested.transcription_queued,
        }))),
        Harvest::AlreadyHarvested => Ok(Json(json!({
            "success": true,
            "sessionId": session.id,
            "alreadyProcessed": true,
        }))),
    }
}
