//! Connection lifecycle.
//!
//! ```text
//!   IDLE ──connect()──► CONNECTING ──success──► OPEN
//!                           │                    │
//!                           └──error/close──► CLOSED ◄──┘
//!                                               │
//!                         (reconnect policy) ───┘──► CONNECTING
//!
//!   any ──disconnect()──► SHUTDOWN   (terminal)
//! ```

// Rust guideline compliant 2026-02

use serde::Serialize;

/// State of one relay connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    /// Never connected.
    #[default]
    Idle,
    /// Connect attempt in flight.
    Connecting,
    /// Transport is up; sends go straight to the wire.
    Open,
    /// Last attempt failed or the connection dropped.
    Closed,
    /// Explicitly disconnected. No further reconnection.
    Shutdown,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "IDLE",
            Self::Connecting => "CONNECTING",
            Self::Open => "OPEN",
            Self::Closed => "CLOSED",
            Self::Shutdown => "SHUTDOWN",
        };
        f.write_str(name)
    }
}

/// A state change, as reported to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// Previous state.
    pub from: ConnectionState,
    /// New state.
    pub to: ConnectionState,
}

/// One transport session of a relay instance.
///
/// The session id is generated once per relay and survives reconnects; the
/// transport behind it is recreated on every attempt.
#[derive(Debug, Clone)]
pub struct Connection {
    session_id: String,
    state: ConnectionState,
    attempt: u32,
    last_error: Option<String>,
}

impl Connection {
    /// New connection in [`ConnectionState::Idle`].
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            state: ConnectionState::Idle,
            attempt: 0,
            last_error: None,
        }
    }

    /// Stable session id.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Reconnect attempts since the last successful open.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Most recent transport error.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Whether a connect attempt should start on `connect()`.
    pub fn can_connect(&self) -> bool {
        matches!(self.state, ConnectionState::Idle | ConnectionState::Closed)
    }

    /// IDLE/CLOSED → CONNECTING.
    pub fn begin_connect(&mut self) -> Option<Transition> {
        if !self.can_connect() {
            return None;
        }
        Some(self.set(ConnectionState::Connecting))
    }

    /// CONNECTING → OPEN. Resets the attempt counter.
    pub fn opened(&mut self) -> Option<Transition> {
        if self.state != ConnectionState::Connecting {
            return None;
        }
        self.attempt = 0;
        self.last_error = None;
        Some(self.set(ConnectionState::Open))
    }

    /// CONNECTING/OPEN → CLOSED.
    pub fn closed(&mut self, error: impl Into<String>) -> Option<Transition> {
        if !matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Open
        ) {
            return None;
        }
        self.last_error = Some(error.into());
        Some(self.set(ConnectionState::Closed))
    }

    /// Any → SHUTDOWN. Returns `None` when already shut down.
    pub fn shutdown(&mut self) -> Option<Transition> {
        if self.state == ConnectionState::Shutdown {
            return None;
        }
        Some(self.set(ConnectionState::Shutdown))
    }

    /// Count one more reconnect attempt and return the new count.
    pub fn next_attempt(&mut self) -> u32 {
        self.attempt = self.attempt.saturating_add(1);
        self.attempt
    }

    /// Manual connect: start counting from zero again.
    pub fn reset_attempts(&mut self) {
        self.attempt = 0;
    }

    fn set(&mut self, to: ConnectionState) -> Transition {
        let from = self.state;
        self.state = to;
        Transition { from, to }
    }
}
