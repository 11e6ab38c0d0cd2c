//! Browser sessions known to the edge.
//!
//! Each session owns a responder [`Relay`] whose transport is whatever socket
//! the browser most recently attached. The relay (and its queue) outlives
//! individual sockets, so replies produced while the browser is away are
//! flushed when it comes back under the same session id.

// Rust guideline compliant 2026-02

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::envelope::Envelope;
use crate::relay::Relay;
use crate::transport::AttachedConnector;

/// One browser session.
#[derive(Debug, Clone)]
pub struct Session {
    /// Responder relay toward the browser.
    pub relay: Relay,
    /// Slot the listener drops re-attached sockets into.
    pub connector: AttachedConnector,
}

/// Sessions keyed by session id. Cheap to clone; clones share the map.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<String, Session>>>,
}

impl SessionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Session>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Session by id.
    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.lock().get(session_id).cloned()
    }

    /// Register a session, returning the one it replaced.
    pub fn insert(&self, session_id: impl Into<String>, session: Session) -> Option<Session> {
        self.lock().insert(session_id.into(), session)
    }

    /// Remove a session, but only if it is still backed by `relay`. A reaper
    /// holding a stale handle must not evict a newer session with the same id.
    pub fn remove_if_current(&self, session_id: &str, relay: &Relay) -> Option<Session> {
        let mut sessions = self.lock();
        let current = sessions
            .get(session_id)
            .is_some_and(|s| s.relay.same_instance(relay));
        if current {
            sessions.remove(session_id)
        } else {
            None
        }
    }

    /// Remove and return every session.
    pub fn drain(&self) -> Vec<Session> {
        self.lock().drain().map(|(_, s)| s).collect()
    }

    /// Number of sessions.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether there are no sessions.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Sorted session ids.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Send to one session. Returns `false` if it is unknown or shut down.
    pub fn deliver(&self, session_id: &str, envelope: Envelope) -> bool {
        let Some(session) = self.get(session_id) else {
            return false;
        };
        match session.relay.send(envelope) {
            Ok(()) => true,
            Err(e) => {
                log::debug!("[Edge] Session {} cannot take message: {}", session_id, e);
                false
            }
        }
    }

    /// Send to every session. Returns how many accepted it.
    pub fn broadcast(&self, envelope: &Envelope) -> usize {
        let relays: Vec<Relay> = self.lock().values().map(|s| s.relay.clone()).collect();
        relays
            .iter()
            .filter(|relay| relay.send(envelope.clone()).is_ok())
            .count()
    }
}
