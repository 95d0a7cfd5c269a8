//! Call correlation engine.
//!
//! Turns raw PBX feed events into lifecycle signals. The engine owns all
//! per-call state (calls still ringing, calls already handed to the spy
//! orchestrator) and performs no I/O, so it is driven synchronously from
//! the single feed consumer and tested without a connection.

pub mod event;
pub mod numbering;

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

pub use event::{EventType, PbxEvent, SourceType};
pub use numbering::is_did;

use numbering::is_did_opt;

const UNKNOWN_CALLER: &str = "Unknown";
const UNKNOWN_DESTINATION: &str = "N/A";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "INBOUND",
            Self::Outbound => "OUTBOUND",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_uppercase().as_str() {
            "INBOUND" => Some(Self::Inbound),
            "OUTBOUND" => Some(Self::Outbound),
            _ => None,
        }
    }
}

/// A call seen ringing at an agent extension but not yet answered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCall {
    pub call_id: String,
    pub agent_extension: String,
    pub direction: Direction,
    pub caller_display: String,
    pub destination_number: String,
    pub snumber: Option<String>,
    pub dnumber: Option<String>,
    pub cnumber: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleSignal {
    /// The call was answered; start recording it.
    Spy(PendingCall),
    /// The call ended; tear down any spy call and harvest the recording.
    Cleanup { call_id: String },
}

#[derive(Debug, Default)]
pub struct CorrelationEngine {
    own_extension: Option<String>,
    pending: HashMap<String, PendingCall>,
    answered: HashSet<String>,
}

impl CorrelationEngine {
    pub fn new(own_extension: Option<String>) -> Self {
        Self {
            own_extension,
            pending: HashMap::new(),
            answered: HashSet::new(),
        }
    }

    pub fn process(&mut self, event: &PbxEvent) -> Option<LifecycleSignal> {
        debug!("{} - CallId={}", event.event_type.as_str(), event.call_id);

        match event.event_type {
            EventType::New | EventType::Ringing => {
                self.on_ring(event);
                None
            }
            EventType::Answered => self.on_answered(&event.call_id),
            EventType::Terminated => Some(self.on_terminated(&event.call_id)),
            EventType::Other(_) => None,
        }
    }

    pub fn pending(&self, call_id: &str) -> Option<&PendingCall> {
        self.pending.get(call_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_answer_processed(&self, call_id: &str) -> bool {
        self.answered.contains(call_id)
    }

    fn on_ring(&mut self, event: &PbxEvent) {
        let (agent_extension, direction) = match &event.stype {
            Some(SourceType::Phone) => {
                let ext = if is_did_opt(event.snumber.as_deref()) {
                    event.dnumber.clone()
                } else {
                    event.snumber.clone()
                };
                (ext, Direction::Outbound)
            }
            Some(SourceType::External) => {
                let ext = if is_did_opt(event.cnumber.as_deref()) {
                    event.dnumber.clone()
                } else {
                    event.cnumber.clone()
                };
                (ext, Direction::Inbound)
            }
            Some(SourceType::Queue) => {
                // The queue has routed the call to the agent who will pick up.
                if let (Some(pending), Some(dnumber)) =
                    (self.pending.get_mut(&event.call_id), event.dnumber.as_ref())
                {
                    info!(
                        "CallId={} - agent updated {} -> {}",
                        event.call_id, pending.agent_extension, dnumber
                    );
                    pending.agent_extension = dnumber.clone();
                }
                return;
            }
            Some(SourceType::Other(_)) | None => return,
        };

        let Some(agent_extension) = agent_extension else {
            debug!("CallId={} - no agent extension resolved", event.call_id);
            return;
        };

        if self.own_extension.as_deref() == Some(agent_extension.as_str()) {
            debug!("Ignoring call to own extension: {}", agent_extension);
            return;
        }

        let call = PendingCall {
            call_id: event.call_id.clone(),
            agent_extension,
            direction,
            caller_display: event
                .caller_name
                .clone()
                .unwrap_or_else(|| UNKNOWN_CALLER.to_string()),
            destination_number: event
                .dnumber
                .clone()
                .unwrap_or_else(|| UNKNOWN_DESTINATION.to_string()),
            snumber: event.snumber.clone(),
            dnumber: event.dnumber.clone(),
            cnumber: event.cnumber.clone(),
        };

        info!(
            "Tracking CallId={} - Agent={}, Direction={}, Caller={}, Dest={}",
            call.call_id,
            call.agent_extension,
            call.direction.as_str(),
            call.caller_display,
            call.destination_number
        );
        self.pending.insert(call.call_id.clone(), call);
    }

    fn on_answered(&mut self, call_id: &str) -> Option<LifecycleSignal> {
        if self.answered.contains(call_id) {
            debug!("CallId={} - duplicate answered event ignored", call_id);
            return None;
        }

        let Some(call) = self.pending.remove(call_id) else {
            debug!("CallId={} - answered but not tracked", call_id);
            return None;
        };

        self.answered.insert(call_id.to_string());
        info!(
            "CallId={} answered - Agent={}, Direction={}",
            call_id,
            call.agent_extension,
            call.direction.as_str()
        );
        Some(LifecycleSignal::Spy(call))
    }

    fn on_terminated(&mut self, call_id: &str) -> LifecycleSignal {
        if self.pending.remove(call_id).is_some() {
            info!("CallId={} ended before answer", call_id);
        } else {
            debug!("CallId={} ended", call_id);
        }
        self.answered.remove(call_id);

        LifecycleSignal::Cleanup {
            call_id: call_id.to_string(),
        }
    }
}
