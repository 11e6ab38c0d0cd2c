//! Message paths through the edge.
//!
//! Browser → backend: a session relay's catch-all handler. Correlated
//! envelopes become `backend.request` calls whose outcome is sent back to the
//! same session under the browser's own correlation id; the rest go out via
//! `backend.send`. `ping` and `edge-status` are answered locally.
//!
//! Backend → browser: the backend relay's catch-all handler sees only
//! unsolicited notifications (responses settle their request instead) and
//! routes them by `sessionId`, falling back to a broadcast.

// Rust guideline compliant 2026-02

use super::sessions::SessionRegistry;
use crate::envelope::{Envelope, MessageType};
use crate::relay::Relay;

/// Handler for everything a browser sends on session `session_id`.
pub fn session_handler(
    session_id: String,
    sessions: SessionRegistry,
    backend: Relay,
) -> impl Fn(&Envelope) -> anyhow::Result<()> + Send + Sync + 'static {
    move |envelope: &Envelope| match envelope.kind {
        MessageType::Ping => {
            reply(&sessions, &session_id, envelope, Envelope::new(MessageType::Pong));
            Ok(())
        }
        MessageType::EdgeStatus => {
            let status = Envelope::new(MessageType::EdgeStatus)
                .with_field("sessions", sessions.len())
                .with_field("backend", serde_json::to_value(backend.status())?);
            reply(&sessions, &session_id, envelope, status);
            Ok(())
        }
        _ => forward_to_backend(&session_id, &sessions, &backend, envelope),
    }
}

/// Handler for unsolicited envelopes arriving from the backend.
pub fn backend_handler(
    sessions: SessionRegistry,
) -> impl Fn(&Envelope) -> anyhow::Result<()> + Send + Sync + 'static {
    move |envelope: &Envelope| {
        if sessions.deliver(&envelope.session_id, envelope.clone()) {
            return Ok(());
        }
        let reached = sessions.broadcast(envelope);
        log::debug!(
            "[Edge] Broadcast backend '{}' to {} sessions",
            envelope.kind,
            reached
        );
        Ok(())
    }
}

fn forward_to_backend(
    session_id: &str,
    sessions: &SessionRegistry,
    backend: &Relay,
    envelope: &Envelope,
) -> anyhow::Result<()> {
    let mut outbound = envelope.clone();
    outbound.session_id = session_id.to_string();

    let Some(browser_id) = outbound.correlation_id.clone() else {
        backend.send(outbound)?;
        return Ok(());
    };

    log::debug!(
        "[Edge] Forwarding '{}' {} from session {}",
        outbound.kind,
        browser_id,
        session_id
    );
    let request_type = outbound.kind.to_string();
    let pending = backend.request(outbound, backend.request_timeout());
    let sessions = sessions.clone();
    let session_id = session_id.to_string();
    tokio::spawn(async move {
        let mut response = match pending.await {
            Ok(response) => response,
            Err(e) => {
                log::warn!(
                    "[Edge] Backend request {} for session {} failed: {}",
                    browser_id,
                    session_id,
                    e
                );
                Envelope::error(e.code(), e.to_string())
                    .with_field("requestType", request_type)
            }
        };
        response.correlation_id = Some(browser_id);
        response.session_id.clone_from(&session_id);
        if !sessions.deliver(&session_id, response) {
            log::debug!("[Edge] Session {} gone before its response arrived", session_id);
        }
    });
    Ok(())
}

fn reply(sessions: &SessionRegistry, session_id: &str, request: &Envelope, mut response: Envelope) {
    response.correlation_id.clone_from(&request.correlation_id);
    response.session_id = session_id.to_string();
    sessions.deliver(session_id, response);
}
