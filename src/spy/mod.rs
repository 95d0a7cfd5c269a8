//! Spy orchestration: turn an answered call into a recorded spy call.

pub mod initiator;

use std::sync::Arc;
use tracing::{error, info, warn};

pub use initiator::{SpyCallInitiator, SpyCallSettings, SpyCallStarted, SpyFailure, StartSpyCall};

use crate::correlation::PendingCall;
use crate::dispatch::{TaskDispatcher, TaskKind, TaskRoutes};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpyDispatch {
    /// Handed to the dispatcher; a worker will create the call.
    Queued,
    /// Dispatch failed and the initiation ran in-process.
    RanInline(Result<SpyCallStarted, SpyFailure>),
}

pub struct SpyOrchestrator {
    dispatcher: Arc<dyn TaskDispatcher>,
    routes: TaskRoutes,
    initiator: SpyCallInitiator,
}

impl SpyOrchestrator {
    pub fn new(
        dispatcher: Arc<dyn TaskDispatcher>,
        routes: TaskRoutes,
        initiator: SpyCallInitiator,
    ) -> Self {
        Self {
            dispatcher,
            routes,
            initiator,
        }
    }

    pub async fn on_spy_signal(&self, call: PendingCall) -> SpyDispatch {
        let request = StartSpyCall::from(&call);

        match self.routes.task_for(TaskKind::StartSpyCall, &request) {
            Ok(task) => {
                if self.dispatcher.enqueue(task).await {
                    info!(
                        "Spy call queued - Extension={}, CallId={}",
                        call.agent_extension, call.call_id
                    );
                    return SpyDispatch::Queued;
                }
                warn!(
                    "Dispatch via {} failed for CallId={}, starting spy call inline",
                    self.dispatcher.name(),
                    call.call_id
                );
            }
            Err(e) => warn!("Could not encode spy task for {}: {}", call.call_id, e),
        }

        let result = self.initiator.initiate(&request).await;
        if let Err(failure) = &result {
            error!("{}", failure);
        }
        SpyDispatch::RanInline(result)
    }
}
