//! Transport seam between a relay and the wire.
//!
//! A relay never owns a socket type directly. It asks its [`Connector`] for a
//! fresh [`Transport`] on every (re)connect attempt and drives the boxed
//! halves from its event loop.
//!
//! # Architecture
//!
//! ```text
//! Connector (trait)
//!     │
//!     ├── WsConnector        dial a URL (client tier, edge → backend)
//!     ├── AttachedConnector  take a socket the edge listener accepted
//!     └── MemoryConnector    in-process pair for tests
//! ```

// Rust guideline compliant 2026-02

pub mod memory;

use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;

use crate::ws::{self, WsMessage, WsReader, WsWriter};

/// Outbound half of a transport.
#[async_trait]
pub trait FrameSink: Send {
    /// Transmit one text frame.
    async fn send_text(&mut self, text: &str) -> Result<()>;

    /// Answer a transport ping.
    async fn send_pong(&mut self, data: Vec<u8>) -> Result<()>;

    /// Close the connection.
    async fn close(&mut self) -> Result<()>;
}

/// Inbound half of a transport.
///
/// `recv` must be cancel-safe: the relay polls it inside `tokio::select!`.
#[async_trait]
pub trait FrameStream: Send {
    /// Next frame, or `None` once the peer is gone.
    async fn recv(&mut self) -> Option<Result<WsMessage>>;
}

/// One live connection, split into halves.
pub struct Transport {
    /// Write half.
    pub sink: Box<dyn FrameSink>,
    /// Read half.
    pub stream: Box<dyn FrameStream>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").finish_non_exhaustive()
    }
}

impl Transport {
    /// Bundle two halves.
    pub fn new(sink: impl FrameSink + 'static, stream: impl FrameStream + 'static) -> Self {
        Self {
            sink: Box::new(sink),
            stream: Box::new(stream),
        }
    }
}

impl From<(WsWriter, WsReader)> for Transport {
    fn from((writer, reader): (WsWriter, WsReader)) -> Self {
        Self::new(writer, reader)
    }
}

#[async_trait]
impl FrameSink for WsWriter {
    async fn send_text(&mut self, text: &str) -> Result<()> {
        WsWriter::send_text(self, text).await
    }

    async fn send_pong(&mut self, data: Vec<u8>) -> Result<()> {
        WsWriter::send_pong(self, data).await
    }

    async fn close(&mut self) -> Result<()> {
        WsWriter::close(self).await
    }
}

#[async_trait]
impl FrameStream for WsReader {
    async fn recv(&mut self) -> Option<Result<WsMessage>> {
        WsReader::recv(self).await
    }
}

/// Produces a fresh transport for each connect attempt.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a new connection.
    async fn connect(&self) -> Result<Transport>;

    /// Human-readable target, for logs.
    fn describe(&self) -> String;

    /// Whether a connect attempt now would yield a transport the relay has
    /// not seen yet. Dialers always can; a slot only while a socket waits.
    fn has_pending(&self) -> bool {
        true
    }
}

/// Dials a fixed WebSocket URL. Reconnects reuse the same URL.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    /// Connector for `url` (`http(s)://` is rewritten to `ws(s)://`).
    pub fn new(url: &str) -> Self {
        Self {
            url: ws::http_to_ws_scheme(url),
        }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Transport> {
        log::debug!("[Transport] Dialing {}", self.url);
        Ok(ws::connect(&self.url).await?.into())
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

/// Server-side connector fed by an accept loop.
///
/// The listener drops each accepted socket into the slot with
/// [`AttachedConnector::attach`]; the relay's next connect attempt takes it.
/// With nothing attached, connecting fails and the relay's reconnection
/// policy keeps polling until the client comes back or attempts run out.
#[derive(Clone, Default)]
pub struct AttachedConnector {
    slot: Arc<Mutex<Option<Transport>>>,
    label: String,
}

impl std::fmt::Debug for AttachedConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachedConnector")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

impl AttachedConnector {
    /// Empty slot labelled for logs.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
            label: label.into(),
        }
    }

    /// Hand over a freshly accepted transport, replacing any unclaimed one.
    pub fn attach(&self, transport: Transport) {
        let mut slot = self.slot.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if slot.replace(transport).is_some() {
            log::debug!("[Transport] Replaced unclaimed socket for {}", self.label);
        }
    }
}

#[async_trait]
impl Connector for AttachedConnector {
    async fn connect(&self) -> Result<Transport> {
        self.slot
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
            .ok_or_else(|| anyhow::anyhow!("no client attached for {}", self.label))
    }

    fn describe(&self) -> String {
        format!("attached:{}", self.label)
    }

    fn has_pending(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .is_some()
    }
}
