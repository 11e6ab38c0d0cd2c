//! Observability hooks.
//!
//! The relay produces these; monitoring and UI layers consume them. Events
//! go out on a broadcast channel, while [`RelayStatus`] is a watch snapshot
//! that doubles as the queue-depth and pending-correlation gauges.

// Rust guideline compliant 2026-02

use std::time::Duration;

use serde::Serialize;

use super::state::ConnectionState;

/// Something observable happened on a relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// Connection state changed.
    StateChanged {
        /// Previous state.
        from: ConnectionState,
        /// New state.
        to: ConnectionState,
    },
    /// A reconnect attempt was scheduled.
    ReconnectScheduled {
        /// 1-based attempt number.
        attempt: u32,
        /// Wait before the attempt.
        delay: Duration,
    },
    /// Reconnection gave up; a manual `connect()` is required.
    ReconnectExhausted {
        /// Attempts that were made.
        attempts: u32,
    },
    /// An outbound envelope was discarded by the queue bound.
    MessageDropped {
        /// Type tag of the discarded envelope.
        message_type: String,
        /// Why it was discarded.
        reason: String,
    },
}

/// Point-in-time view of a relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStatus {
    /// Stable session id.
    pub session_id: String,
    /// Connection state.
    pub state: ConnectionState,
    /// Current reconnect attempt count.
    pub attempt: u32,
    /// Queue-depth gauge.
    pub queue_depth: usize,
    /// Pending-correlation gauge.
    pub pending_requests: usize,
    /// Last transport error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Set once reconnection has given up, cleared by a manual connect.
    pub exhausted: bool,
    /// Handler invocations that returned an error or panicked.
    pub handler_failures: u64,
}

impl RelayStatus {
    /// Initial status for a new relay.
    pub fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            state: ConnectionState::Idle,
            attempt: 0,
            queue_depth: 0,
            pending_requests: 0,
            last_error: None,
            exhausted: false,
            handler_failures: 0,
        }
    }
}
