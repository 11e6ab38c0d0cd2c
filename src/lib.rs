//! AI Box relay - reconnecting, correlating message relay.
//!
//! Carries JSON envelopes between a browser client, an edge process and a
//! backend service over WebSockets, surviving disconnects without losing
//! order or in-flight requests.
//!
//! # Architecture
//!
//! - **Relay** - one hop: connection lifecycle, reconnection, outbound queue
//!   and request/response correlation, driven by a background task
//! - **Transport** - where a relay's sockets come from (dialed, accepted,
//!   in-memory)
//! - **Edge** - per-browser responder relays chained to one backend relay
//! - **Mock backend** - a stand-in backend service for development and tests
//!
//! # Modules
//!
//! - [`relay`] - the relay and its building blocks
//! - [`envelope`] - wire type
//! - [`edge`] - edge process
//! - [`config`] - configuration loading

// Rust guideline compliant 2026-02

pub mod commands;
pub mod config;
pub mod constants;
pub mod edge;
pub mod envelope;
pub mod error;
pub mod mock_backend;
pub mod relay;
pub mod transport;
pub mod ws;

// Re-export commonly used types
pub use config::{Config, EdgeConfig, RelayConfig};
pub use edge::Edge;
pub use envelope::{Envelope, MessageType};
pub use error::RelayError;
pub use relay::{ConnectionState, Relay, RelayBuilder, RelayEvent, RelayRole, RelayStatus, Subscription};
