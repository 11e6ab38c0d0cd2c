//! In-process transport.
//!
//! Gives tests (and embedders that run both tiers in one process) a relay
//! connection without sockets. The [`MemoryConnector`] can be scripted to
//! refuse connections, delay the handshake, or drop the connection after a
//! fixed number of outbound frames, which is how mid-flush failures are
//! reproduced deterministically.

// Rust guideline compliant 2026-02

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{Connector, FrameSink, FrameStream, Transport};
use crate::envelope::Envelope;
use crate::ws::WsMessage;

struct MemorySink {
    tx: Option<mpsc::UnboundedSender<String>>,
    /// Frames left before the connection "drops". `None` = unlimited.
    budget: Option<usize>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send_text(&mut self, text: &str) -> Result<()> {
        if self.budget == Some(0) {
            self.tx = None;
            anyhow::bail!("memory connection dropped");
        }
        let Some(tx) = self.tx.as_ref() else {
            anyhow::bail!("memory connection closed");
        };
        tx.send(text.to_string())
            .map_err(|_| anyhow::anyhow!("memory peer gone"))?;
        if let Some(budget) = self.budget.as_mut() {
            *budget -= 1;
        }
        Ok(())
    }

    async fn send_pong(&mut self, _data: Vec<u8>) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.tx = None;
        Ok(())
    }
}

struct MemoryStream {
    rx: mpsc::UnboundedReceiver<WsMessage>,
}

#[async_trait]
impl FrameStream for MemoryStream {
    async fn recv(&mut self) -> Option<Result<WsMessage>> {
        self.rx.recv().await.map(Ok)
    }
}

/// Far end of an in-memory connection.
#[derive(Debug)]
pub struct MemoryPeer {
    inbound: mpsc::UnboundedReceiver<String>,
    outbound: Option<mpsc::UnboundedSender<WsMessage>>,
}

impl MemoryPeer {
    /// Next raw frame sent by the relay, `None` once the relay side is gone.
    pub async fn recv_text(&mut self) -> Option<String> {
        self.inbound.recv().await
    }

    /// Next envelope sent by the relay. Undecodable frames are skipped.
    pub async fn recv(&mut self) -> Option<Envelope> {
        while let Some(text) = self.inbound.recv().await {
            match Envelope::decode(&text) {
                Ok(envelope) => return Some(envelope),
                Err(e) => log::warn!("[MemoryPeer] Skipping undecodable frame: {}", e),
            }
        }
        None
    }

    /// Envelope already sent by the relay, without waiting.
    pub fn try_recv(&mut self) -> Option<Envelope> {
        let text = self.inbound.try_recv().ok()?;
        Envelope::decode(&text).ok()
    }

    /// Deliver an envelope to the relay.
    pub fn send(&self, envelope: &Envelope) {
        if let Ok(text) = envelope.encode() {
            self.send_text(&text);
        }
    }

    /// Deliver a raw text frame to the relay.
    pub fn send_text(&self, text: &str) {
        if let Some(tx) = self.outbound.as_ref() {
            let _ = tx.send(WsMessage::Text(text.to_string()));
        }
    }

    /// Drop the connection from the far side.
    pub fn close(&mut self) {
        self.outbound = None;
    }
}

fn pair_with_budget(budget: Option<usize>) -> (Transport, MemoryPeer) {
    let (to_peer_tx, to_peer_rx) = mpsc::unbounded_channel();
    let (to_relay_tx, to_relay_rx) = mpsc::unbounded_channel();

    let transport = Transport::new(
        MemorySink {
            tx: Some(to_peer_tx),
            budget,
        },
        MemoryStream { rx: to_relay_rx },
    );
    let peer = MemoryPeer {
        inbound: to_peer_rx,
        outbound: Some(to_relay_tx),
    };
    (transport, peer)
}

/// A connected transport and its far end.
pub fn pair() -> (Transport, MemoryPeer) {
    pair_with_budget(None)
}

#[derive(Debug, Default)]
struct Plan {
    refuse_next: u32,
    refuse_all: bool,
    connect_delay: Duration,
    fail_after_frames: Option<usize>,
    attempts: u32,
}

/// Scriptable in-memory [`Connector`].
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    plan: Arc<Mutex<Plan>>,
    accept_tx: mpsc::UnboundedSender<MemoryPeer>,
}

/// Receives the far end of every connection a [`MemoryConnector`] opens.
#[derive(Debug)]
pub struct MemoryListener {
    accept_rx: mpsc::UnboundedReceiver<MemoryPeer>,
}

impl MemoryListener {
    /// Wait for the next connection.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.accept_rx.recv().await
    }

    /// A connection that was already opened, without waiting.
    pub fn try_accept(&mut self) -> Option<MemoryPeer> {
        self.accept_rx.try_recv().ok()
    }
}

/// New connector/listener pair.
pub fn connector() -> (MemoryConnector, MemoryListener) {
    let (accept_tx, accept_rx) = mpsc::unbounded_channel();
    (
        MemoryConnector {
            plan: Arc::new(Mutex::new(Plan::default())),
            accept_tx,
        },
        MemoryListener { accept_rx },
    )
}

impl MemoryConnector {
    fn plan(&self) -> std::sync::MutexGuard<'_, Plan> {
        self.plan
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Refuse the next `n` connect attempts.
    pub fn refuse_next(&self, n: u32) {
        self.plan().refuse_next = n;
    }

    /// Refuse every connect attempt until switched off.
    pub fn refuse_all(&self, refuse: bool) {
        self.plan().refuse_all = refuse;
    }

    /// Delay before each attempt resolves.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.plan().connect_delay = delay;
    }

    /// The next successful connection drops after `frames` outbound frames.
    pub fn fail_after_frames(&self, frames: usize) {
        self.plan().fail_after_frames = Some(frames);
    }

    /// Total connect attempts seen so far.
    pub fn attempts(&self) -> u32 {
        self.plan().attempts
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Transport> {
        let (delay, refuse) = {
            let mut plan = self.plan();
            plan.attempts += 1;
            let refuse = if plan.refuse_all {
                true
            } else if plan.refuse_next > 0 {
                plan.refuse_next -= 1;
                true
            } else {
                false
            };
            (plan.connect_delay, refuse)
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if refuse {
            anyhow::bail!("connection refused");
        }

        let budget = self.plan().fail_after_frames.take();
        let (transport, peer) = pair_with_budget(budget);
        let _ = self.accept_tx.send(peer);
        Ok(transport)
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
