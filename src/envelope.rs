//! Envelope wire type.
//!
//! Every frame on a relay connection is one UTF-8 text frame holding a JSON
//! serialized [`Envelope`]:
//!
//! ```text
//! { "type": "chat-message", "correlationId": "…", "sessionId": "…",
//!   "timestamp": "2026-01-01T00:00:00Z", ...type-specific fields }
//! ```
//!
//! `correlationId` is only present on request/response pairs. Type-specific
//! fields are kept as a flattened JSON map so the relay never needs to know
//! the backend's business payloads.
//!
//! Inbound timestamps may lack an offset (`2026-01-01T00:00:00.123456`, as
//! Python's `isoformat()` writes them); those are read as UTC. A missing or
//! unreadable timestamp becomes the receive time rather than failing the
//! frame.

// Rust guideline compliant 2026-02

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::RelayError;

/// Discriminant of an [`Envelope`].
///
/// Known kinds get their own variant so subscriptions are checked at compile
/// time; anything else round-trips through [`MessageType::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    /// User chat message for the backend.
    ChatMessage,
    /// Agent task execution request.
    AgentTask,
    /// Document search request.
    DocumentSearch,
    /// Backend status request.
    StatusRequest,
    /// Progress notification for a running agent task.
    AgentProgress,
    /// Unsolicited system notification.
    SystemNotification,
    /// Error report.
    Error,
    /// Sent by the edge when a client attaches.
    Welcome,
    /// Application-level keepalive.
    Ping,
    /// Reply to [`MessageType::Ping`].
    Pong,
    /// Edge process status query / reply.
    EdgeStatus,
    /// Any other type tag.
    Other(String),
}

impl MessageType {
    /// Wire tag for this type.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::ChatMessage => "chat-message",
            Self::AgentTask => "agent-task",
            Self::DocumentSearch => "document-search",
            Self::StatusRequest => "status-request",
            Self::AgentProgress => "agent-progress",
            Self::SystemNotification => "system-notification",
            Self::Error => "error",
            Self::Welcome => "welcome",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::EdgeStatus => "edge-status",
            Self::Other(tag) => tag,
        }
    }
}

impl From<String> for MessageType {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "chat-message" => Self::ChatMessage,
            "agent-task" => Self::AgentTask,
            "document-search" => Self::DocumentSearch,
            "status-request" => Self::StatusRequest,
            "agent-progress" => Self::AgentProgress,
            "system-notification" => Self::SystemNotification,
            "error" => Self::Error,
            "welcome" => Self::Welcome,
            "ping" => Self::Ping,
            "pong" => Self::Pong,
            "edge-status" => Self::EdgeStatus,
            _ => Self::Other(tag),
        }
    }
}

impl From<&str> for MessageType {
    fn from(tag: &str) -> Self {
        Self::from(tag.to_string())
    }
}

impl From<MessageType> for String {
    fn from(kind: MessageType) -> Self {
        match kind {
            MessageType::Other(tag) => tag,
            known => known.as_str().to_string(),
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One discrete message unit exchanged over a relay connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Message kind.
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Links a request to its response. Absent on notifications.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Session of the relay that originated the envelope.
    #[serde(default)]
    pub session_id: String,
    /// Creation (or last transmission) time.
    #[serde(default = "Utc::now", deserialize_with = "deserialize_timestamp")]
    pub timestamp: DateTime<Utc>,
    /// Type-specific payload fields.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Envelope {
    /// Create an envelope with no payload fields.
    pub fn new(kind: impl Into<MessageType>) -> Self {
        Self {
            kind: kind.into(),
            correlation_id: None,
            session_id: String::new(),
            timestamp: Utc::now(),
            fields: Map::new(),
        }
    }

    /// Add a payload field.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Set the correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Set the session id.
    #[must_use]
    pub fn with_session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = id.into();
        self
    }

    /// Build an `error` envelope.
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::new(MessageType::Error)
            .with_field("code", code)
            .with_field("message", message.into())
    }

    /// Look up a payload field.
    #[must_use]
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Look up a string payload field.
    #[must_use]
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    /// Serialize to the wire representation.
    pub fn encode(&self) -> Result<String, RelayError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a wire frame.
    pub fn decode(text: &str) -> Result<Self, RelayError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Payload fields as a JSON object (used when printing replies).
    #[must_use]
    pub fn payload(&self) -> Value {
        Value::Object(self.fields.clone())
    }
}

/// Parse an ISO-8601 timestamp, with or without an offset.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(time) = DateTime::parse_from_rfc3339(raw) {
        return Some(time.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Value::deserialize(deserializer)?;
    let parsed = raw.as_str().and_then(parse_timestamp);
    if parsed.is_none() {
        log::debug!("[Envelope] Unreadable timestamp {}, using receive time", raw);
    }
    Ok(parsed.unwrap_or_else(Utc::now))
}
