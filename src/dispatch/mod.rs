//! Asynchronous task dispatch.
//!
//! Orchestrators hand work to a [`TaskDispatcher`] without knowing whether a
//! durable queue or the in-process executor runs it.

pub mod cloud_tasks;
pub mod local;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

pub use cloud_tasks::CloudTasksDispatcher;
pub use local::{LocalDispatcher, LocalExecutor, TaskHandler};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    StartSpyCall,
    CleanupSpyCall,
    TranscribeAudio,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StartSpyCall => "start_spy_call",
            Self::CleanupSpyCall => "cleanup_spy_call",
            Self::TranscribeAudio => "transcribe_audio",
        }
    }

    /// Endpoint path on the worker service.
    pub fn path(&self) -> &'static str {
        match self {
            Self::StartSpyCall => "/api/tasks/start-spy-call",
            Self::CleanupSpyCall => "/api/tasks/cleanup-spy-call",
            Self::TranscribeAudio => "/api/tasks/transcribe-audio",
        }
    }

    pub fn dispatch_deadline(&self) -> Duration {
        match self {
            Self::StartSpyCall => Duration::from_secs(60),
            Self::CleanupSpyCall => Duration::from_secs(600),
            Self::TranscribeAudio => Duration::from_secs(1800),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMode {
    /// The queue attaches an OIDC identity token minted for this account.
    Oidc { service_account_email: String },
    None,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchTask {
    pub kind: TaskKind,
    pub payload: Value,
    pub target_endpoint: String,
    pub dispatch_deadline: Duration,
    pub auth_mode: AuthMode,
}

/// Builds tasks addressed at the worker service.
#[derive(Debug, Clone)]
pub struct TaskRoutes {
    service_url: String,
    auth_mode: AuthMode,
}

impl TaskRoutes {
    pub fn new(service_url: &str, service_account_email: &str) -> Self {
        let auth_mode = if service_account_email.is_empty() {
            AuthMode::None
        } else {
            AuthMode::Oidc {
                service_account_email: service_account_email.to_string(),
            }
        };
        Self {
            service_url: service_url.trim_end_matches('/').to_string(),
            auth_mode,
        }
    }

    pub fn task(&self, kind: TaskKind, payload: Value) -> DispatchTask {
        DispatchTask {
            kind,
            payload,
            target_endpoint: format!("{}{}", self.service_url, kind.path()),
            dispatch_deadline: kind.dispatch_deadline(),
            auth_mode: self.auth_mode.clone(),
        }
    }

    pub fn task_for<T: Serialize>(
        &self,
        kind: TaskKind,
        payload: &T,
    ) -> Result<DispatchTask, serde_json::Error> {
        Ok(self.task(kind, serde_json::to_value(payload)?))
    }
}

#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    fn name(&self) -> &'static str;

    /// Submit a task. Returns `false` on any submission failure; never errors.
    async fn enqueue(&self, task: DispatchTask) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deadlines() {
        assert_eq!(TaskKind::StartSpyCall.dispatch_deadline().as_secs(), 60);
        assert_eq!(TaskKind::CleanupSpyCall.dispatch_deadline().as_secs(), 600);
        assert_eq!(TaskKind::TranscribeAudio.dispatch_deadline().as_secs(), 1800);
    }

    #[test]
    fn test_routes_build_endpoint_and_auth() {
        let routes = TaskRoutes::new("https://svc.run.app/", "tasks@proj.iam.gserviceaccount.com");
        let task = routes.task(TaskKind::CleanupSpyCall, json!({"buffaloCallId": "c1"}));

        assert_eq!(
            task.target_endpoint,
            "https://svc.run.app/api/tasks/cleanup-spy-call"
        );
        assert_eq!(task.dispatch_deadline, Duration::from_secs(600));
        assert_eq!(
            task.auth_mode,
            AuthMode::Oidc {
                service_account_email: "tasks@proj.iam.gserviceaccount.com".to_string()
            }
        );
    }

    #[test]
    fn test_routes_without_service_account() {
        let routes = TaskRoutes::new("http://localhost:8080", "");
        let task = routes.task(TaskKind::StartSpyCall, json!({}));
        assert_eq!(task.auth_mode, AuthMode::None);
        assert_eq!(
            task.target_endpoint,
            "http://localhost:8080/api/tasks/start-spy-call"
        );
    }
}
