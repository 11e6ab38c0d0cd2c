//! Application-wide constants for aibox-relay.
//!
//! Centralizes default intervals, bounds and timeouts so the configuration
//! layer and the relay agree on the same values.
//!
//! # Categories
//!
//! - **Reconnection**: linear backoff parameters
//! - **Correlation**: request timeouts and late-response tracking
//! - **Queue**: outbound buffer bounds
//! - **Edge**: listener and session defaults

// Rust guideline compliant 2026-02

use std::time::Duration;

// ============================================================================
// Reconnection
// ============================================================================

/// Base reconnect interval; attempt `n` waits `n * base`.
pub const DEFAULT_BASE_INTERVAL: Duration = Duration::from_millis(1000);

/// Ceiling for the reconnect delay.
pub const DEFAULT_MAX_INTERVAL: Duration = Duration::from_secs(30);

/// Reconnect attempts scheduled before reporting exhaustion.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

// ============================================================================
// Correlation
// ============================================================================

/// Timeout applied when a caller does not pick one.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// How many settled correlation ids are remembered to recognize late replies.
pub const LATE_RESPONSE_MEMORY: usize = 256;

// ============================================================================
// Queue
// ============================================================================

/// Default outbound queue bound.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

// ============================================================================
// Relay plumbing
// ============================================================================

/// Capacity of the relay event broadcast channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Upper bound on a WebSocket dial, TCP connect plus handshake.
pub const WS_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Edge
// ============================================================================

/// Default edge listen address.
pub const DEFAULT_EDGE_LISTEN: &str = "127.0.0.1:5000";

/// Default backend service URL.
pub const DEFAULT_BACKEND_URL: &str = "ws://127.0.0.1:8002/ws";

/// Default mock backend listen address.
pub const DEFAULT_MOCK_BACKEND_LISTEN: &str = "127.0.0.1:8002";

/// WebSocket path prefix for browser sessions (`/ws/{session_id}`).
pub const EDGE_WS_PATH: &str = "/ws";

/// Edge-side session relays only poll their accepted-socket slot, so they
/// retry quickly and give up early; the browser owns real reconnection.
pub const SESSION_BASE_INTERVAL: Duration = Duration::from_millis(500);

/// Attempts before an unattached session is reaped.
pub const SESSION_MAX_ATTEMPTS: u32 = 20;
