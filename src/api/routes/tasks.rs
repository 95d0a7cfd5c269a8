//! Task worker endpoints called by the queue.
//!
//! - POST /api/tasks/start-spy-call
//! - POST /api/tasks/cleanup-spy-call
//!
//! A 500 response makes the queue retry the task.

use axum::{
    extract::State,
    http::HeaderMap,
    response::Json,
    routing::post,
    Router,
};
use serde_json::{json, Value};
use tracing::{error, info};

use super::super::error::{ApiError, ApiResult};
use super::super::WorkerState;
use crate::cleanup::{CleanupOutcome, CleanupSpyCall};
use crate::spy::StartSpyCall;

const TASK_NAME_HEADER: &str = "x-cloudtasks-taskname";
const QUEUE_NAME_HEADER: &str = "x-cloudtasks-queuename";

pub fn router(state: WorkerState) -> Router {
    Router::new()
        .route("/start-spy-call", post(start_spy_call))
        .route("/cleanup-spy-call", post(cleanup_spy_call))
        .with_state(state)
}

/// When a queue name is expected, both queue headers must be present and the
/// queue must match.
pub fn check_task_headers(headers: &HeaderMap, expected_queue: Option<&str>) -> ApiResult<()> {
    let Some(expected) = expected_queue else {
        return Ok(());
    };

    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    if header(TASK_NAME_HEADER).is_none() {
        return Err(ApiError::unauthorized("Missing task name header"));
    }
    match header(QUEUE_NAME_HEADER) {
        Some(queue) if queue == expected => Ok(()),
        Some(queue) => Err(ApiError::unauthorized(format!(
            "Unexpected queue: {}",
            queue
        ))),
        None => Err(ApiError::unauthorized("Missing queue name header")),
    }
}

async fn start_spy_call(
    State(state): State<WorkerState>,
    headers: HeaderMap,
    Json(request): Json<StartSpyCall>,
) -> ApiResult<Json<Value>> {
    check_task_headers(&headers, state.expected_queue.as_deref())?;

    if request.extension.is_empty() || request.buffalo_call_id.is_empty() {
        return Err(ApiError::bad_request("Missing extension or buffaloCallId"));
    }

    info!(
        "start-spy-call task - Extension={}, BuffaloCallId={}",
        request.extension, request.buffalo_call_id
    );

    match state.initiator.initiate(&request).await {
        Ok(started) => Ok(Json(json!({
            "success": true,
            "callSid": started.call_sid,
            "sessionId": started.session_id,
            "buffaloCallId": started.buffalo_call_id,
        }))),
        Err(failure) => {
            error!("{}", failure);
            Err(ApiError::internal(failure.reason))
        }
    }
}

async fn cleanup_spy_call(
    State(state): State<WorkerState>,
    headers: HeaderMap,
    Json(request): Json<CleanupSpyCall>,
) -> ApiResult<Json<Value>> {
    check_task_headers(&headers, state.expected_queue.as_deref())?;

    if request.buffalo_call_id.is_empty() {
        return Err(ApiError::bad_request("Missing buffaloCallId"));
    }

    info!("cleanup-spy-call task - BuffaloCallId={}", request.buffalo_call_id);

    let outcome = state
        .cleanup
        .cleanup(&request.buffalo_call_id)
        .await
        .map_err(|e| {
            error!("Cleanup of {} failed: {}", request.buffalo_call_id, e);
            ApiError::internal(e.to_string())
        })?;

    let mut body = json!({
        "success": true,
        "buffaloCallId": request.buffalo_call_id,
        "outcome": outcome.as_str(),
        "sessionId": outcome.session_id(),
    });
    if let CleanupOutcome::Recorded { recording, .. } = &outcome {
        body["recordingSid"] = json!(recording.recording_id);
        body["storagePath"] = json!(recording.storage_path);
    }

    Ok(Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(task: Option<&str>, queue: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(task) = task {
            headers.insert(TASK_NAME_HEADER, HeaderValue::from_str(task).unwrap());
        }
        if let Some(queue) = queue {
            headers.insert(QUEUE_NAME_HEADER, HeaderValue::from_str(queue).unwrap());
        }
        headers
    }

    #[test]
    fn test_headers_not_required_without_queue() {
        assert!(check_task_headers(&HeaderMap::new(), None).is_ok());
    }

    #[test]
    fn test_headers_must_match_queue() {
        let queue = Some("transcription-queue");
        assert!(check_task_headers(&headers(Some("t1"), Some("transcription-queue")), queue).is_ok());
        assert!(check_task_headers(&headers(Some("t1"), Some("other")), queue).is_err());
        assert!(check_task_headers(&headers(None, Some("transcription-queue")), queue).is_err());
        assert!(check_task_headers(&headers(Some("t1"), None), queue).is_err());
    }
}
