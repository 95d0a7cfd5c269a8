//! In-process dispatch backend.
//!
//! Tasks are sent over a channel to a [`LocalExecutor`] that spawns each one
//! on its own tokio task. Tasks for the same PBX call run one after another
//! in the order they were queued. There is no retry or backoff; a failed
//! task is only logged.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{DispatchTask, TaskDispatcher};

/// Executes a dispatched task in-process.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: DispatchTask) -> Result<()>;
}

#[derive(Clone)]
pub struct LocalDispatcher {
    tx: mpsc::UnboundedSender<DispatchTask>,
}

pub struct LocalExecutor {
    rx: mpsc::UnboundedReceiver<DispatchTask>,
}

/// Create a connected dispatcher/executor pair.
pub fn channel() -> (LocalDispatcher, LocalExecutor) {
    let (tx, rx) = mpsc::unbounded_channel();
    (LocalDispatcher { tx }, LocalExecutor { rx })
}

#[async_trait]
impl TaskDispatcher for LocalDispatcher {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn enqueue(&self, task: DispatchTask) -> bool {
        let kind = task.kind;
        match self.tx.send(task) {
            Ok(()) => {
                debug!("{} task queued locally", kind.as_str());
                true
            }
            Err(_) => {
                warn!("Local executor is gone, {} task not queued", kind.as_str());
                false
            }
        }
    }
}

/// PBX call a task belongs to, if any.
fn call_key(task: &DispatchTask) -> Option<String> {
    task.payload
        .get("buffaloCallId")
        .and_then(|v| v.as_str())
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

async fn handle_logged(handler: &dyn TaskHandler, task: DispatchTask) {
    let kind = task.kind;
    if let Err(e) = handler.handle(task).await {
        error!("Local {} task failed: {:#}", kind.as_str(), e);
    }
}

impl LocalExecutor {
    /// Run until cancelled or every dispatcher is dropped, then finish the
    /// tasks already queued.
    pub async fn run(mut self, handler: Arc<dyn TaskHandler>, cancel: CancellationToken) {
        info!("Local task executor started");

        // Last task spawned per call; the next one for that call waits on it.
        let mut lanes: HashMap<String, JoinHandle<()>> = HashMap::new();

        loop {
            let task = tokio::select! {
                _ = cancel.cancelled() => break,
                task = self.rx.recv() => match task {
                    Some(task) => task,
                    None => break,
                },
            };

            lanes.retain(|_, previous| !previous.is_finished());

            let handler = Arc::clone(&handler);
            match call_key(&task) {
                Some(key) => {
                    let previous = lanes.remove(&key);
                    let next = tokio::spawn(async move {
                        if let Some(previous) = previous {
                            let _ = previous.await;
                        }
                        handle_logged(handler.as_ref(), task).await;
                    });
                    lanes.insert(key, next);
                }
                None => {
                    tokio::spawn(async move { handle_logged(handler.as_ref(), task).await });
                }
            }
        }

        // Finish what was already queued, keeping per-call order.
        self.rx.close();
        while let Some(task) = self.rx.recv().await {
            if let Some(previous) = call_key(&task).and_then(|key| lanes.remove(&key)) {
                let _ = previous.await;
            }
            handle_logged(handler.as_ref(), task).await;
        }
        for (_, lane) in lanes {
            let _ = lane.await;
        }

        info!("Local task executor stopped");
    }

    /// Handle every task already queued, one after another, then stop.
    /// Used by one-shot commands that exit once their work is done.
    pub async fn drain(mut self, handler: Arc<dyn TaskHandler>) -> usize {
        self.rx.close();
        let mut handled = 0;
        while let Some(task) = self.rx.recv().await {
            handle_logged(handler.as_ref(), task).await;
            handled += 1;
        }
        handled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{TaskKind, TaskRoutes};
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingHandler {
        seen: Mutex<Vec<TaskKind>>,
        notify: tokio::sync::Notify,
    }

    #[async_trait]
    impl TaskHandler for RecordingHandler {
        async fn handle(&self, task: DispatchTask) -> Result<()> {
            self.seen.lock().await.push(task.kind);
            self.notify.notify_one();
            if task.kind == TaskKind::TranscribeAudio {
                anyhow::bail!("boom");
            }
            Ok(())
        }
    }

    fn routes() -> TaskRoutes {
        TaskRoutes::new("http://localhost:8080", "")
    }

    #[tokio::test]
    async fn test_enqueued_task_is_handled() {
        let (dispatcher, executor) = channel();
        let handler = Arc::new(RecordingHandler::default());
        let cancel = CancellationToken::new();
        let run = tokio::spawn(executor.run(handler.clone(), cancel.clone()));

        assert!(
            dispatcher
                .enqueue(routes().task(TaskKind::CleanupSpyCall, json!({"buffaloCallId": "c1"})))
                .await
        );
        tokio::time::timeout(Duration::from_secs(2), handler.notify.notified())
            .await
            .unwrap();

        assert_eq!(*handler.seen.lock().await, vec![TaskKind::CleanupSpyCall]);
        cancel.cancel();
        run.await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_task_does_not_stop_executor() {
        let (dispatcher, executor) = channel();
        let handler = Arc::new(RecordingHandler::default());
        let cancel = CancellationToken::new();
        let run = tokio::spawn(executor.run(handler.clone(), cancel.clone()));

        dispatcher
            .enqueue(routes().task(TaskKind::TranscribeAudio, json!({})))
            .await;
        tokio::time::timeout(Duration::from_secs(2), handler.notify.notified())
            .await
            .unwrap();
        dispatcher
            .enqueue(routes().task(TaskKind::StartSpyCall, json!({})))
            .await;
        tokio::time::timeout(Duration::from_secs(2), handler.notify.notified())
            .await
            .unwrap();

        assert_eq!(handler.seen.lock().await.len(), 2);
        cancel.cancel();
        run.await.unwrap();
    }

    /// Takes longer on start tasks and records when each task finished.
    #[derive(Default)]
    struct SlowStartHandler {
        finished: Mutex<Vec<(TaskKind, String)>>,
    }

    #[async_trait]
    impl TaskHandler for SlowStartHandler {
        async fn handle(&self, task: DispatchTask) -> Result<()> {
            if task.kind == TaskKind::StartSpyCall {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            let call = call_key(&task).unwrap_or_default();
            self.finished.lock().await.push((task.kind, call));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_tasks_for_one_call_run_in_order() {
        let (dispatcher, executor) = channel();
        let handler = Arc::new(SlowStartHandler::default());
        let cancel = CancellationToken::new();
        let run = tokio::spawn(executor.run(handler.clone(), cancel.clone()));

        let r = routes();
        dispatcher
            .enqueue(r.task(TaskKind::StartSpyCall, json!({"buffaloCallId": "c1"})))
            .await;
        dispatcher
            .enqueue(r.task(TaskKind::CleanupSpyCall, json!({"buffaloCallId": "c1"})))
            .await;
        dispatcher
            .enqueue(r.task(TaskKind::CleanupSpyCall, json!({"buffaloCallId": "c2"})))
            .await;

        tokio::time::sleep(Duration::from_millis(400)).await;

        let finished = handler.finished.lock().await.clone();
        assert_eq!(
            finished,
            vec![
                (TaskKind::CleanupSpyCall, "c2".to_string()),
                (TaskKind::StartSpyCall, "c1".to_string()),
                (TaskKind::CleanupSpyCall, "c1".to_string()),
            ]
        );
        cancel.cancel();
        run.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_finishes_queued_tasks() {
        let (dispatcher, executor) = channel();
        let handler = Arc::new(SlowStartHandler::default());
        let cancel = CancellationToken::new();

        let r = routes();
        dispatcher
            .enqueue(r.task(TaskKind::StartSpyCall, json!({"buffaloCallId": "c1"})))
            .await;
        dispatcher
            .enqueue(r.task(TaskKind::CleanupSpyCall, json!({"buffaloCallId": "c1"})))
            .await;
        cancel.cancel();

        executor.run(handler.clone(), cancel).await;

        assert_eq!(
            *handler.finished.lock().await,
            vec![
                (TaskKind::StartSpyCall, "c1".to_string()),
                (TaskKind::CleanupSpyCall, "c1".to_string()),
            ]
        );
        assert!(
            !dispatcher
                .enqueue(r.task(TaskKind::StartSpyCall, json!({})))
                .await
        );
    }

    #[tokio::test]
    async fn test_drain_handles_queued_tasks_then_refuses_more() {
        let (dispatcher, executor) = channel();
        let handler = Arc::new(RecordingHandler::default());

        dispatcher
            .enqueue(routes().task(TaskKind::CleanupSpyCall, json!({})))
            .await;
        dispatcher
            .enqueue(routes().task(TaskKind::TranscribeAudio, json!({})))
            .await;

        assert_eq!(executor.drain(handler.clone()).await, 2);
        assert_eq!(
            *handler.seen.lock().await,
            vec![TaskKind::CleanupSpyCall, TaskKind::TranscribeAudio]
        );
        assert!(
            !dispatcher
                .enqueue(routes().task(TaskKind::StartSpyCall, json!({})))
                .await
        );
    }

    #[tokio::test]
    async fn test_enqueue_after_executor_dropped_returns_false() {
        let (dispatcher, executor) = channel();
        drop(executor);

        assert!(
            !dispatcher
                .enqueue(routes().task(TaskKind::StartSpyCall, json!({})))
                .await
        );
    }
}
