//! Edge process.
//!
//! Terminates browser WebSocket connections and originates the single
//! connection to the backend service.
//!
//! # Architecture
//!
//! ```text
//!   browser ──/ws/{session}──► Session relay (Responder) ─┐
//!   browser ──/ws/{session}──► Session relay (Responder) ─┼─► backend Relay ──► Backend
//!                                     ▲                   │      (Initiator)
//!                                     └──── responses ────┘
//! ```
//!
//! Each hop is an independent relay: a browser dropping does not touch the
//! backend connection, and a backend outage only delays (or times out) the
//! browser's requests.

// Rust guideline compliant 2026-02

mod forward;
pub mod sessions;

use std::future::Future;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;

use crate::config::{EdgeConfig, RelayConfig};
use crate::constants::EDGE_WS_PATH;
use crate::envelope::{Envelope, MessageType};
use crate::relay::{ConnectionState, Relay, RelayEvent, RelayRole, Subscription};
use crate::transport::{AttachedConnector, Transport, WsConnector};
use crate::ws;
use sessions::{Session, SessionRegistry};

/// The edge process. Cheap to clone; clones share sessions and backend.
#[derive(Debug, Clone)]
pub struct Edge {
    backend: Relay,
    sessions: SessionRegistry,
    session_config: RelayConfig,
}

impl Edge {
    /// Edge dialing `config.backend.url`. Must be called inside a runtime.
    pub fn new(config: &EdgeConfig) -> Self {
        let backend = Relay::builder(WsConnector::new(&config.backend.url))
            .label("backend")
            .config(&config.backend)
            .build();
        Self::with_backend(backend, config.session.clone())
    }

    /// Edge over an existing backend relay.
    pub fn with_backend(backend: Relay, session_config: RelayConfig) -> Self {
        let sessions = SessionRegistry::new();
        backend.on(Subscription::Any, forward::backend_handler(sessions.clone()));
        Self {
            backend,
            sessions,
            session_config,
        }
    }

    /// Backend relay.
    pub fn backend(&self) -> &Relay {
        &self.backend
    }

    /// Registered sessions.
    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Accept browsers on `listener` until `shutdown` resolves, then shut
    /// everything down.
    pub async fn serve(&self, listener: TcpListener, shutdown: impl Future<Output = ()>) -> Result<()> {
        log::info!(
            "[Edge] Listening on {} (backend {})",
            listener.local_addr()?,
            self.backend.label()
        );
        self.backend.connect();

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let edge = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = edge.handle_socket(stream).await {
                                log::warn!("[Edge] Connection from {} rejected: {:#}", peer, e);
                            }
                        });
                    }
                    Err(e) => log::warn!("[Edge] Accept failed: {}", e),
                },
                () = &mut shutdown => break,
            }
        }

        self.shutdown().await;
        Ok(())
    }

    async fn handle_socket(&self, stream: TcpStream) -> Result<()> {
        let (path, mut writer, reader) = ws::accept(stream).await?;
        let requested = match session_id_from_path(&path) {
            Ok(requested) => requested,
            Err(e) => {
                let _ = writer.close().await;
                return Err(e);
            }
        };
        self.attach(requested, Transport::from((writer, reader)))
            .await?;
        Ok(())
    }

    /// Bind a browser socket to a session, creating the session if needed.
    ///
    /// A `welcome` envelope goes out on the socket first. Returns the session
    /// id (freshly generated when none was requested).
    pub async fn attach(&self, requested: Option<String>, mut transport: Transport) -> Result<String> {
        let session_id = requested
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let welcome = Envelope::new(MessageType::Welcome)
            .with_session_id(&session_id)
            .with_field("message", "Connected to AI Box edge");
        transport
            .sink
            .send_text(&welcome.encode()?)
            .await
            .context("Failed to send welcome")?;

        if let Some(session) = self.sessions.get(&session_id) {
            log::info!("[Edge] Session {} re-attached", session_id);
            session.connector.attach(transport);
            session.relay.reconnect_now();
            return Ok(session_id);
        }

        let connector = AttachedConnector::new(&session_id);
        connector.attach(transport);
        let relay = Relay::builder(connector.clone())
            .label(format!("session:{}", short_id(&session_id)))
            .session_id(&session_id)
            .role(RelayRole::Responder)
            .reply_on_malformed(true)
            .config(&self.session_config)
            .build();
        relay.on(
            Subscription::Any,
            forward::session_handler(
                session_id.clone(),
                self.sessions.clone(),
                self.backend.clone(),
            ),
        );
        self.spawn_reaper(&session_id, &relay);
        self.sessions.insert(
            session_id.clone(),
            Session {
                relay: relay.clone(),
                connector,
            },
        );
        relay.connect();

        log::info!(
            "[Edge] Session {} attached ({} active)",
            session_id,
            self.sessions.len()
        );
        Ok(session_id)
    }

    /// Remove a session once its browser has been gone long enough for the
    /// relay to give up.
    fn spawn_reaper(&self, session_id: &str, relay: &Relay) {
        let mut events = relay.events();
        let relay = relay.clone();
        let sessions = self.sessions.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(RelayEvent::ReconnectExhausted { attempts }) => {
                        log::info!(
                            "[Edge] Reaping session {} (browser gone after {} attempts)",
                            session_id,
                            attempts
                        );
                        if let Some(session) = sessions.remove_if_current(&session_id, &relay) {
                            session.relay.disconnect().await;
                        }
                        break;
                    }
                    Ok(RelayEvent::StateChanged {
                        to: ConnectionState::Shutdown,
                        ..
                    })
                    | Err(RecvError::Closed) => break,
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                }
            }
        });
    }

    /// Disconnect every session and the backend.
    pub async fn shutdown(&self) {
        let sessions = self.sessions.drain();
        log::info!("[Edge] Shutting down {} sessions", sessions.len());
        for session in sessions {
            session.relay.disconnect().await;
        }
        self.backend.disconnect().await;
    }
}

/// Bind `config.listen` and serve until `shutdown` resolves.
pub async fn run(config: &EdgeConfig, shutdown: impl Future<Output = ()>) -> Result<()> {
    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen))?;
    Edge::new(config).serve(listener, shutdown).await
}

/// `/ws` → no id, `/ws/{id}` → `id`. Anything else is rejected.
fn session_id_from_path(path: &str) -> Result<Option<String>> {
    let rest = path
        .strip_prefix(EDGE_WS_PATH)
        .with_context(|| format!("Unexpected path {path}"))?;
    if rest.is_empty() || rest == "/" {
        return Ok(None);
    }
    match rest.strip_prefix('/') {
        Some(id) if !id.contains('/') => Ok(Some(id.to_string())),
        _ => anyhow::bail!("Unexpected path {path}"),
    }
}

fn short_id(session_id: &str) -> &str {
    session_id.get(..8).unwrap_or(session_id)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::transport::memory::{self, MemoryPeer};

    struct Harness {
        edge: Edge,
        backend: MemoryPeer,
    }

    async fn harness() -> Harness {
        let (connector, mut listener) = memory::connector();
        let backend = Relay::builder(connector)
            .label("backend")
            .request_timeout(Duration::from_secs(5))
            .build();
        let session_config = RelayConfig {
            base_interval_ms: 10,
            max_attempts: 2,
            ..RelayConfig::default()
        };
        let edge = Edge::with_backend(backend, session_config);
        edge.backend().connect();
        let backend = listener.accept().await.unwrap();
        Harness { edge, backend }
    }

    async fn browser(edge: &Edge, id: &str) -> MemoryPeer {
        let (transport, mut peer) = memory::pair();
        edge.attach(Some(id.to_string()), transport).await.unwrap();
        let welcome = peer.recv().await.unwrap();
        assert_eq!(welcome.kind, MessageType::Welcome);
        assert_eq!(welcome.session_id, id);
        peer
    }

    #[test]
    fn test_session_id_from_path() {
        assert_eq!(session_id_from_path("/ws").unwrap(), None);
        assert_eq!(session_id_from_path("/ws/").unwrap(), None);
        assert_eq!(
            session_id_from_path("/ws/abc-123").unwrap(),
            Some("abc-123".to_string())
        );
        assert!(session_id_from_path("/other").is_err());
        assert!(session_id_from_path("/wsx").is_err());
        assert!(session_id_from_path("/ws/a/b").is_err());
    }

    #[tokio::test]
    async fn test_correlated_request_round_trips_with_browser_id() {
        let mut h = harness().await;
        let mut browser = browser(&h.edge, "s1").await;

        browser.send(
            &Envelope::new(MessageType::ChatMessage)
                .with_correlation_id("browser-1")
                .with_field("text", "hi"),
        );

        let forwarded = h.backend.recv().await.unwrap();
        assert_eq!(forwarded.kind, MessageType::ChatMessage);
        assert_eq!(forwarded.session_id, "s1");
        let backend_id = forwarded.correlation_id.clone().unwrap();
        assert_ne!(backend_id, "browser-1");

        h.backend.send(
            &Envelope::new(MessageType::ChatMessage)
                .with_correlation_id(backend_id)
                .with_field("response", "hello"),
        );

        let reply = browser.recv().await.unwrap();
        assert_eq!(reply.correlation_id.as_deref(), Some("browser-1"));
        assert_eq!(reply.session_id, "s1");
        assert_eq!(reply.str_field("response"), Some("hello"));
    }

    #[tokio::test]
    async fn test_ping_answered_locally() {
        let mut h = harness().await;
        let mut browser = browser(&h.edge, "s1").await;

        browser.send(&Envelope::new(MessageType::Ping).with_correlation_id("p1"));
        let pong = browser.recv().await.unwrap();
        assert_eq!(pong.kind, MessageType::Pong);
        assert_eq!(pong.correlation_id.as_deref(), Some("p1"));
        assert!(h.backend.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_notifications_route_by_session_or_broadcast() {
        let h = harness().await;
        let mut one = browser(&h.edge, "one").await;
        let mut two = browser(&h.edge, "two").await;

        h.backend.send(
            &Envelope::new(MessageType::AgentProgress)
                .with_session_id("two")
                .with_field("step", 1),
        );
        let got = two.recv().await.unwrap();
        assert_eq!(got.kind, MessageType::AgentProgress);

        h.backend.send(&Envelope::new(MessageType::SystemNotification).with_session_id("nobody"));
        assert_eq!(one.recv().await.unwrap().kind, MessageType::SystemNotification);
        assert_eq!(two.recv().await.unwrap().kind, MessageType::SystemNotification);
    }

    #[tokio::test]
    async fn test_uncorrelated_browser_message_is_sent_to_backend() {
        let mut h = harness().await;
        let browser = browser(&h.edge, "s1").await;

        browser.send(&Envelope::new("typing").with_field("active", true));
        let forwarded = h.backend.recv().await.unwrap();
        assert_eq!(forwarded.kind, MessageType::from("typing"));
        assert_eq!(forwarded.correlation_id, None);
        assert_eq!(forwarded.session_id, "s1");
    }

    #[tokio::test]
    async fn test_reattach_reuses_session() {
        let mut h = harness().await;
        let mut first = browser(&h.edge, "s1").await;
        first.close();

        let mut second = browser(&h.edge, "s1").await;
        assert_eq!(h.edge.sessions().len(), 1);

        second.send(&Envelope::new(MessageType::ChatMessage).with_correlation_id("b2"));
        let forwarded = h.backend.recv().await.unwrap();
        h.backend.send(
            &Envelope::new(MessageType::ChatMessage)
                .with_correlation_id(forwarded.correlation_id.unwrap()),
        );
        assert_eq!(second.recv().await.unwrap().correlation_id.as_deref(), Some("b2"));
    }

    #[tokio::test]
    async fn test_back_to_back_reattach_keeps_newest_socket() {
        let h = harness().await;
        let mut first = browser(&h.edge, "s1").await;
        let relay = h.edge.sessions().get("s1").unwrap().relay;
        relay.wait_for_state(ConnectionState::Open).await.unwrap();

        let mut second = browser(&h.edge, "s1").await;
        let mut third = browser(&h.edge, "s1").await;

        third.send(&Envelope::new(MessageType::Ping).with_correlation_id("p3"));
        let pong = tokio::time::timeout(Duration::from_secs(2), third.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pong.kind, MessageType::Pong);
        assert_eq!(pong.correlation_id.as_deref(), Some("p3"));

        assert!(first.recv().await.is_none());
        assert!(second.recv().await.is_none());
        assert_eq!(h.edge.sessions().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_session_is_reaped() {
        let h = harness().await;
        let mut browser = browser(&h.edge, "gone").await;
        let relay = h.edge.sessions().get("gone").unwrap().relay;
        relay.wait_for_state(ConnectionState::Open).await.unwrap();

        browser.close();
        relay.wait_for_state(ConnectionState::Shutdown).await.unwrap();
        assert!(h.edge.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_disconnects_everything() {
        let h = harness().await;
        let _browser = browser(&h.edge, "s1").await;
        let relay = h.edge.sessions().get("s1").unwrap().relay;

        h.edge.shutdown().await;
        assert!(h.edge.sessions().is_empty());
        assert_eq!(relay.state(), ConnectionState::Shutdown);
        assert_eq!(h.edge.backend().state(), ConnectionState::Shutdown);
    }
}
