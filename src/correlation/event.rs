//! SPOP wire events.

use serde::{Deserialize, Deserializer};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventType {
    New,
    Ringing,
    Answered,
    Terminated,
    Other(String),
}

impl EventType {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "new" => Self::New,
            "ringing" => Self::Ringing,
            "answered" => Self::Answered,
            "terminated" => Self::Terminated,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::New => "new",
            Self::Ringing => "ringing",
            Self::Answered => "answered",
            Self::Terminated => "terminated",
            Self::Other(raw) => raw,
        }
    }
}

/// Originating side of a call leg as reported by the PBX.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceType {
    Phone,
    External,
    Queue,
    Other(String),
}

impl SourceType {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "phone" => Self::Phone,
            "external" => Self::External,
            "queue" => Self::Queue,
            other => Self::Other(other.to_string()),
        }
    }
}

/// One call-state event from the PBX feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PbxEvent {
    pub event_type: EventType,
    pub call_id: String,
    pub stype: Option<SourceType>,
    pub snumber: Option<String>,
    pub dnumber: Option<String>,
    pub cnumber: Option<String>,
    pub caller_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawPbxEvent {
    #[serde(default, deserialize_with = "loose_string")]
    event: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    callid: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    uniqueid: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    stype: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    snumber: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    dnumber: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    cnumber: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    callername: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    callername_internal: Option<String>,
}

/// The PBX sends numbers either as JSON strings or bare numbers.
fn loose_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) if !s.is_empty() => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::Bool(b)) => Some(b.to_string()),
        _ => None,
    })
}

impl PbxEvent {
    /// Build an event from a decoded feed message. Messages without a call
    /// id (keepalives, registration notices) yield `None`.
    pub fn from_json(value: &Value) -> Option<Self> {
        if !value.is_object() {
            return None;
        }
        let raw = RawPbxEvent::deserialize(value).ok()?;
        let call_id = raw.callid.or(raw.uniqueid)?;

        Some(Self {
            event_type: EventType::parse(raw.event.as_deref().unwrap_or_default()),
            call_id,
            stype: raw.stype.as_deref().map(SourceType::parse),
            snumber: raw.snumber,
            dnumber: raw.dnumber,
            cnumber: raw.cnumber,
            caller_name: raw.callername_internal.or(raw.callername),
        })
    }

    pub fn parse(text: &str) -> Result<Option<Self>, serde_json::Error> {
        let value: Value = serde_json::from_str(text)?;
        Ok(Self::from_json(&value))
    }
}
