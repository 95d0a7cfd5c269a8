//! Google Cloud Tasks backend (REST `tasks.create`).

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use super::{AuthMode, DispatchTask, TaskDispatcher};
use crate::config::DispatchConfig;

const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct MetadataToken {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct CreatedTask {
    #[serde(default)]
    name: String,
}

enum TokenSource {
    Static(String),
    Metadata {
        cached: Mutex<Option<(String, Instant)>>,
    },
}

pub struct CloudTasksDispatcher {
    client: reqwest::Client,
    tasks_url: String,
    tokens: TokenSource,
}

/// Request body for `projects.locations.queues.tasks.create`.
pub fn task_body(task: &DispatchTask) -> Value {
    let body = serde_json::to_vec(&task.payload).unwrap_or_default();

    let mut http_request = json!({
        "httpMethod": "POST",
        "url": task.target_endpoint,
        "headers": { "Content-Type": "application/json" },
        "body": BASE64.encode(body),
    });
    if let AuthMode::Oidc {
        service_account_email,
    } = &task.auth_mode
    {
        http_request["oidcToken"] = json!({ "serviceAccountEmail": service_account_email });
    }

    json!({
        "task": {
            "httpRequest": http_request,
            "dispatchDeadline": format!("{}s", task.dispatch_deadline.as_secs()),
        }
    })
}

impl CloudTasksDispatcher {
    pub fn new(config: &DispatchConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build Cloud Tasks HTTP client")?;

        let tasks_url = format!(
            "{}/projects/{}/locations/{}/queues/{}/tasks",
            config.api_base_url.trim_end_matches('/'),
            config.project_id,
            config.region,
            config.queue_name
        );

        let tokens = if config.access_token.is_empty() {
            TokenSource::Metadata {
                cached: Mutex::new(None),
            }
        } else {
            TokenSource::Static(config.access_token.clone())
        };

        info!("Cloud Tasks dispatcher targeting {}", tasks_url);

        Ok(Self {
            client,
            tasks_url,
            tokens,
        })
    }

    pub fn tasks_url(&self) -> &str {
        &self.tasks_url
    }

    async fn access_token(&self) -> Result<String> {
        match &self.tokens {
            TokenSource::Static(token) => Ok(token.clone()),
            TokenSource::Metadata { cached } => {
                let mut cached = cached.lock().await;
                if let Some((token, expires)) = cached.as_ref() {
                    if Instant::now() + TOKEN_REFRESH_MARGIN < *expires {
                        return Ok(token.clone());
                    }
                }

                let token: MetadataToken = self
                    .client
                    .get(METADATA_TOKEN_URL)
                    .header("Metadata-Flavor", "Google")
                    .send()
                    .await
                    .context("Failed to reach metadata server")?
                    .error_for_status()
                    .context("Metadata server rejected token request")?
                    .json()
                    .await
                    .context("Failed to parse metadata token")?;

                let expires = Instant::now() + Duration::from_secs(token.expires_in);
                *cached = Some((token.access_token.clone(), expires));
                Ok(token.access_token)
            }
        }
    }

    async fn submit(&self, task: &DispatchTask) -> Result<String> {
        let token = self.access_token().await?;

        let response = self
            .client
            .post(&self.tasks_url)
            .bearer_auth(token)
            .json(&task_body(task))
            .send()
            .await
            .context("Failed to submit task")?;

        let status = response.status();
        let text = response
            .text()
            .await
            .context("Failed to read task response body")?;

        if !status.is_success() {
            anyhow::bail!("Cloud Tasks returned {}: {}", status, text);
        }

        let created: CreatedTask =
            serde_json::from_str(&text).context("Failed to parse task response")?;
        Ok(created.name)
    }
}

#[async_trait]
impl TaskDispatcher for CloudTasksDispatcher {
    fn name(&self) -> &'static str {
        "cloud-tasks"
    }

    async fn enqueue(&self, task: DispatchTask) -> bool {
        debug!(
            "Enqueueing {} task for {}",
            task.kind.as_str(),
            task.target_endpoint
        );

        match self.submit(&task).await {
            Ok(name) => {
                info!("{} task enqueued: {}", task.kind.as_str(), name);
                true
            }
            Err(e) => {
                error!("Failed to enqueue {} task: {:#}", task.kind.as_str(), e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{TaskKind, TaskRoutes};

    #[test]
    fn test_task_body_encodes_payload_and_deadline() {
        let routes = TaskRoutes::new("https://svc.run.app", "tasks@proj.iam.gserviceaccount.com");
        let task = routes.task(TaskKind::StartSpyCall, json!({"extension": "6190"}));

        let body = task_body(&task);
        let http = &body["task"]["httpRequest"];

        assert_eq!(http["httpMethod"], "POST");
        assert_eq!(http["url"], "https://svc.run.app/api/tasks/start-spy-call");
        assert_eq!(
            http["oidcToken"]["serviceAccountEmail"],
            "tasks@proj.iam.gserviceaccount.com"
        );
        assert_eq!(body["task"]["dispatchDeadline"], "60s");

        let decoded = BASE64.decode(http["body"].as_str().unwrap()).unwrap();
        let payload: Value = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(payload, json!({"extension": "6190"}));
    }

    #[test]
    fn test_task_body_without_oidc() {
        let routes = TaskRoutes::new("http://localhost:8080", "");
        let task = routes.task(TaskKind::CleanupSpyCall, json!({}));
        let body = task_body(&task);

        assert!(body["task"]["httpRequest"].get("oidcToken").is_none());
        assert_eq!(body["task"]["dispatchDeadline"], "600s");
    }

    #[test]
    fn test_tasks_url() {
        let config = DispatchConfig {
            enabled: true,
            project_id: "proj".to_string(),
            region: "us-central1".to_string(),
            access_token: "token".to_string(),
            ..DispatchConfig::default()
        };
        let dispatcher = CloudTasksDispatcher::new(&config).unwrap();
        assert_eq!(
            dispatcher.tasks_url(),
            "https://cloudtasks.googleapis.com/v2/projects/proj/locations/us-central1/queues/transcription-queue/tasks"
        );
    }

    #[tokio::test]
    async fn test_enqueue_failure_returns_false() {
        let config = DispatchConfig {
            enabled: true,
            project_id: "proj".to_string(),
            region: "r".to_string(),
            api_base_url: "http://127.0.0.1:1".to_string(),
            access_token: "token".to_string(),
            ..DispatchConfig::default()
        };
        let dispatcher = CloudTasksDispatcher::new(&config).unwrap();
        let task = TaskRoutes::new("http://localhost:8080", "")
            .task(TaskKind::CleanupSpyCall, json!({"buffaloCallId": "c1"}));

        assert!(!dispatcher.enqueue(task).await);
    }
}
