//! Relay error taxonomy.
//!
//! Transport failures are recovered inside the relay via reconnection and
//! only reach a caller indirectly, as a [`RelayError::Timeout`] on a specific
//! pending request. Shutdown fails every pending caller at once. Handler
//! failures never leave the dispatch loop; the variant exists so they can be
//! logged and reported uniformly.

// Rust guideline compliant 2026-02

use std::time::Duration;

/// Errors surfaced by relay operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// Connect failed or the connection dropped. Surfaces as the status
    /// `last_error`; callers only ever see the timeout it may cause.
    Transport(String),
    /// No matching response arrived within the request timeout.
    Timeout {
        /// Correlation id of the request that timed out.
        correlation_id: String,
        /// The timeout that elapsed.
        after: Duration,
    },
    /// The relay was intentionally shut down.
    Shutdown,
    /// A subscriber failed while handling an inbound envelope.
    Handler(String),
    /// The outbound queue is at capacity and rejected the envelope.
    QueueFull {
        /// Configured queue capacity.
        capacity: usize,
    },
    /// An envelope could not be serialized or parsed.
    Encode(String),
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(msg) => write!(f, "Transport error: {msg}"),
            Self::Timeout {
                correlation_id,
                after,
            } => write!(
                f,
                "Request {correlation_id} timed out after {}ms",
                after.as_millis()
            ),
            Self::Shutdown => write!(f, "Connection closed"),
            Self::Handler(msg) => write!(f, "Handler error: {msg}"),
            Self::QueueFull { capacity } => {
                write!(f, "Outbound queue full ({capacity} messages)")
            }
            Self::Encode(msg) => write!(f, "Encode error: {msg}"),
        }
    }
}

impl std::error::Error for RelayError {}

impl RelayError {
    /// Returns `true` for the timeout variant.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Short machine-readable code, used when an error is relayed as an
    /// `error` envelope.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport_error",
            Self::Timeout { .. } => "timeout",
            Self::Shutdown => "connection_closed",
            Self::Handler(_) => "handler_error",
            Self::QueueFull { .. } => "queue_full",
            Self::Encode(_) => "encode_error",
        }
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        Self::Encode(e.to_string())
    }
}
