use crate::api::{ApiServer, WorkerState};
use crate::cleanup::{
    CleanupDispatch, CleanupOrchestrator, CleanupOutcome, CleanupWorker, RecordingHarvester,
    RecordingPoller,
};
use crate::config::{Config, FlagSource, StorageBackend};
use crate::control::{cancel_on_shutdown, ControlLoop};
use crate::correlation::LifecycleSignal;
use crate::db::SessionStore;
use crate::dispatch::{
    local, CloudTasksDispatcher, DispatchTask, LocalExecutor, TaskDispatcher, TaskHandler,
    TaskKind, TaskRoutes,
};
use crate::flags::{FeatureFlags, StaticFlags, SupabaseFlags};
use crate::global;
use crate::pbx::{ConnectionManager, FeedStatusHandle};
use crate::provider::{TelephonyProvider, TwilioProvider};
use crate::spy::{SpyCallInitiator, SpyCallSettings, SpyDispatch, SpyOrchestrator, StartSpyCall};
use crate::storage::{LocalStorage, ObjectStore, SupabaseStorage};
use crate::transcription::{LocalTranscriptionForwarder, TranscriptionTrigger};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Everything the monitor and the task worker share.
pub struct Components {
    pub config: Config,
    pub sessions: SessionStore,
    pub routes: TaskRoutes,
    pub dispatcher: Arc<dyn TaskDispatcher>,
    /// Present when tasks run in-process instead of through the queue.
    pub executor: Option<LocalExecutor>,
    pub initiator: SpyCallInitiator,
    pub harvester: RecordingHarvester,
    pub cleanup: CleanupWorker,
}

impl Components {
    pub fn build(config: Config) -> Result<Self> {
        let sessions = SessionStore::open(&config.database_path()?)?;
        Self::with_sessions(config, sessions)
    }

    pub fn with_sessions(config: Config, sessions: SessionStore) -> Result<Self> {
        let provider: Arc<dyn TelephonyProvider> = Arc::new(
            TwilioProvider::new(&config.provider).context("Failed to configure Twilio")?,
        );
        let storage = build_storage(&config)?;
        let (dispatcher, executor) = build_dispatcher(&config)?;
        let routes = TaskRoutes::new(
            &config.dispatch.service_url,
            &config.dispatch.service_account_email,
        );

        let initiator = SpyCallInitiator::new(
            provider.clone(),
            sessions.clone(),
            SpyCallSettings::from_config(&config),
        );
        let harvester = RecordingHarvester::new(
            provider.clone(),
            storage,
            sessions.clone(),
            TranscriptionTrigger::new(dispatcher.clone(), routes.clone()),
        );
        let poller = RecordingPoller::new(
            provider.clone(),
            Duration::from_secs(config.cleanup.poll_interval_secs),
            Duration::from_secs(config.cleanup.max_wait_secs),
        );
        let cleanup = CleanupWorker::new(provider, sessions.clone(), poller, harvester.clone());

        Ok(Self {
            config,
            sessions,
            routes,
            dispatcher,
            executor,
            initiator,
            harvester,
            cleanup,
        })
    }

    pub fn worker_state(&self, feed_status: Option<FeedStatusHandle>) -> WorkerState {
        let dispatch = &self.config.dispatch;
        WorkerState {
            initiator: self.initiator.clone(),
            cleanup: self.cleanup.clone(),
            harvester: self.harvester.clone(),
            sessions: self.sessions.clone(),
            expected_queue: dispatch.enabled.then(|| dispatch.queue_name.clone()),
            feed_status,
        }
    }

    pub fn task_handler(&self) -> Result<Arc<dyn TaskHandler>> {
        Ok(Arc::new(WorkerTaskHandler {
            initiator: self.initiator.clone(),
            cleanup: self.cleanup.clone(),
            forwarder: LocalTranscriptionForwarder::new(
                &self.config.dispatch.local_transcription_url,
            )?,
        }))
    }

    /// Start the in-process executor when no queue is configured.
    fn spawn_executor(&mut self, cancel: CancellationToken) -> Result<Option<JoinHandle<()>>> {
        let Some(executor) = self.executor.take() else {
            return Ok(None);
        };
        let handler = self.task_handler()?;
        Ok(Some(tokio::spawn(executor.run(handler, cancel))))
    }

    fn orchestrators(&self) -> (SpyOrchestrator, CleanupOrchestrator) {
        (
            SpyOrchestrator::new(
                self.dispatcher.clone(),
                self.routes.clone(),
                self.initiator.clone(),
            ),
            CleanupOrchestrator::new(
                self.dispatcher.clone(),
                self.routes.clone(),
                self.cleanup.clone(),
            ),
        )
    }
}

fn build_storage(config: &Config) -> Result<Arc<dyn ObjectStore>> {
    match config.storage.backend {
        StorageBackend::Supabase => Ok(Arc::new(
            SupabaseStorage::new(&config.supabase).context("Failed to configure Supabase storage")?,
        )),
        StorageBackend::Local => {
            let root = match &config.storage.local_dir {
                Some(dir) => dir.clone(),
                None => global::recordings_dir()?,
            };
            info!("Recordings stored under {:?}", root);
            Ok(Arc::new(LocalStorage::new(root)))
        }
    }
}

fn build_dispatcher(config: &Config) -> Result<(Arc<dyn TaskDispatcher>, Option<LocalExecutor>)> {
    let dispatch = &config.dispatch;
    if dispatch.enabled && dispatch.is_complete() {
        let cloud = CloudTasksDispatcher::new(dispatch)?;
        info!("Dispatching tasks to {}", cloud.tasks_url());
        return Ok((Arc::new(cloud), None));
    }

    if dispatch.enabled {
        warn!("Cloud Tasks enabled but project/region/queue incomplete, running tasks locally");
    } else {
        info!("Cloud Tasks disabled, running tasks locally");
    }
    let (dispatcher, executor) = local::channel();
    Ok((Arc::new(dispatcher), Some(executor)))
}

fn build_flags(config: &Config) -> Result<Arc<dyn FeatureFlags>> {
    let overrides = config.flags.overrides.clone();
    match config.flags.source {
        FlagSource::Static => Ok(Arc::new(StaticFlags::new(overrides))),
        FlagSource::Supabase => Ok(Arc::new(SupabaseFlags::new(
            &config.supabase,
            Duration::from_secs(config.flags.cache_ttl_secs),
            overrides,
        )?)),
    }
}

/// Runs dispatched tasks in-process with the same handlers the HTTP worker uses.
struct WorkerTaskHandler {
    initiator: SpyCallInitiator,
    cleanup: CleanupWorker,
    forwarder: LocalTranscriptionForwarder,
}

#[async_trait]
impl TaskHandler for WorkerTaskHandler {
    async fn handle(&self, task: DispatchTask) -> Result<()> {
        match task.kind {
            TaskKind::StartSpyCall => {
                let request: StartSpyCall = serde_json::from_value(task.payload)
                    .context("Invalid start_spy_call payload")?;
                let started = self.initiator.initiate(&request).await?;
                info!(
                    "Spy call {} started for session {}",
                    started.call_sid, started.session_id
                );
            }
            TaskKind::CleanupSpyCall => {
                let call_id = task
                    .payload
                    .get("buffaloCallId")
                    .and_then(|v| v.as_str())
                    .context("cleanup_spy_call payload has no buffaloCallId")?;
                let outcome = self.cleanup.cleanup(call_id).await?;
                info!("Cleanup of {} finished: {}", call_id, outcome.as_str());
            }
            TaskKind::TranscribeAudio => self.forwarder.forward(&task.payload).await?,
        }
        Ok(())
    }
}

/// Applies lifecycle signals in arrival order. On shutdown, cleanups still
/// queued are applied; spy calls not yet started are skipped.
pub async fn run_signal_worker(
    mut signals: mpsc::UnboundedReceiver<LifecycleSignal>,
    spy: SpyOrchestrator,
    cleanup: CleanupOrchestrator,
    cancel: CancellationToken,
) {
    loop {
        let signal = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            signal = signals.recv() => match signal {
                Some(signal) => signal,
                None => break,
            },
        };
        apply_signal(signal, &spy, &cleanup).await;
    }

    signals.close();
    while let Some(signal) = signals.recv().await {
        match signal {
            LifecycleSignal::Spy(call) => {
                info!("Shutting down, not starting spy call for {}", call.call_id)
            }
            cleanup_signal => apply_signal(cleanup_signal, &spy, &cleanup).await,
        }
    }

    info!("Signal worker stopped");
}

async fn apply_signal(
    signal: LifecycleSignal,
    spy: &SpyOrchestrator,
    cleanup: &CleanupOrchestrator,
) {
    match signal {
        LifecycleSignal::Spy(call) => match spy.on_spy_signal(call).await {
            SpyDispatch::Queued => {}
            SpyDispatch::RanInline(Ok(started)) => {
                info!("Spy call {} started inline", started.call_sid)
            }
            SpyDispatch::RanInline(Err(failure)) => error!("{}", failure),
        },
        LifecycleSignal::Cleanup { call_id } => match cleanup.on_cleanup_signal(&call_id).await {
            CleanupDispatch::Queued => {}
            CleanupDispatch::RanInline(Ok(outcome)) => {
                info!("Inline cleanup of {} finished: {}", call_id, outcome.as_str())
            }
            CleanupDispatch::RanInline(Err(e)) => {
                error!("Inline cleanup of {} failed: {}", call_id, e)
            }
        },
    }
}

/// Feed monitor and task worker in one process.
pub async fn run_service() -> Result<()> {
    info!("Starting pbx-monitor service");

    let config = Config::load()?;
    config.validate_monitor()?;

    let cancel = CancellationToken::new();
    cancel_on_shutdown(cancel.clone());

    let mut components = Components::build(config.clone())?;
    let executor_cancel = CancellationToken::new();
    let executor = components.spawn_executor(executor_cancel.clone())?;

    let feed_status = FeedStatusHandle::default();
    let server = ApiServer::new(
        &config.server.host,
        config.server.port,
        components.worker_state(Some(feed_status.clone())),
    );
    let server_cancel = cancel.clone();
    let server_task = tokio::spawn(async move {
        if let Err(e) = server.start(server_cancel.clone()).await {
            error!("API server failed: {:#}", e);
            server_cancel.cancel();
        }
    });

    run_feed(&config, &components, feed_status, cancel).await?;

    if let Err(e) = server_task.await {
        warn!("API server task ended abnormally: {}", e);
    }
    wait_for_executor(executor, &executor_cancel).await;
    info!("pbx-monitor stopped");
    Ok(())
}

/// Feed monitor only; tasks go to the queue or run in-process.
pub async fn run_monitor() -> Result<()> {
    info!("Starting pbx-monitor feed monitor");

    let config = Config::load()?;
    config.validate_monitor()?;

    let cancel = CancellationToken::new();
    cancel_on_shutdown(cancel.clone());

    let mut components = Components::build(config.clone())?;
    let executor_cancel = CancellationToken::new();
    let executor = components.spawn_executor(executor_cancel.clone())?;

    run_feed(&config, &components, FeedStatusHandle::default(), cancel).await?;
    wait_for_executor(executor, &executor_cancel).await;
    Ok(())
}

/// HTTP task worker and webhooks only.
pub async fn run_worker() -> Result<()> {
    info!("Starting pbx-monitor task worker");

    let config = Config::load()?;
    let cancel = CancellationToken::new();
    cancel_on_shutdown(cancel.clone());

    let mut components = Components::build(config.clone())?;
    let executor_cancel = CancellationToken::new();
    let executor = components.spawn_executor(executor_cancel.clone())?;

    let result = ApiServer::new(
        &config.server.host,
        config.server.port,
        components.worker_state(None),
    )
    .start(cancel)
    .await;
    wait_for_executor(executor, &executor_cancel).await;
    result
}

/// Stop the local executor once nothing else can queue work, and wait for it
/// to finish what it already has.
async fn wait_for_executor(executor: Option<JoinHandle<()>>, cancel: &CancellationToken) {
    cancel.cancel();
    if let Some(executor) = executor {
        if let Err(e) = executor.await {
            warn!("Local task executor ended abnormally: {}", e);
        }
    }
}

/// One cleanup pass for a PBX call, for manual recovery.
pub async fn run_cleanup_once(call_id: &str) -> Result<CleanupOutcome> {
    let config = Config::load()?;
    let mut components = Components::build(config)?;

    let outcome = components.cleanup.cleanup(call_id).await?;

    if let Some(executor) = components.executor.take() {
        let handled = executor.drain(components.task_handler()?).await;
        if handled > 0 {
            info!("Ran {} follow-up task(s) in-process", handled);
        }
    }

    Ok(outcome)
}

async fn run_feed(
    config: &Config,
    components: &Components,
    feed_status: FeedStatusHandle,
    cancel: CancellationToken,
) -> Result<()> {
    let (signal_tx, signal_rx) = mpsc::unbounded_channel();
    let (spy, cleanup) = components.orchestrators();
    let worker = tokio::spawn(run_signal_worker(signal_rx, spy, cleanup, cancel.clone()));

    let flags = build_flags(config)?;
    let control = ControlLoop::new(
        flags,
        &config.flags.monitor_key,
        config.flags.monitor_default,
        Duration::from_secs(config.flags.poll_interval_secs.max(1)),
        cancel.clone(),
    );
    let mut manager = ConnectionManager::new(config.pbx.clone(), signal_tx, feed_status);
    control.run(&mut manager).await;

    drop(manager);
    if let Err(e) = worker.await {
        warn!("Signal worker ended abnormally: {}", e);
    }
    Ok(())
}
