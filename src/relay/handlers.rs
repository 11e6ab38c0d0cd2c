//! Inbound subscription table.
//!
//! Handlers are keyed by [`Subscription`] and invoked in subscription order.
//! A handler that returns an error or panics is logged and skipped; the rest
//! still see the envelope.

// Rust guideline compliant 2026-02

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::envelope::{Envelope, MessageType};
use crate::error::RelayError;

/// Which inbound envelopes a handler receives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Subscription {
    /// Envelopes of one type.
    Type(MessageType),
    /// Every dispatched envelope (the `'*'` subscription).
    Any,
}

impl Subscription {
    fn matches(&self, kind: &MessageType) -> bool {
        match self {
            Self::Any => true,
            Self::Type(t) => t == kind,
        }
    }
}

impl From<MessageType> for Subscription {
    fn from(kind: MessageType) -> Self {
        Self::Type(kind)
    }
}

/// `"*"` subscribes to everything; any other string names one type.
impl From<&str> for Subscription {
    fn from(kind: &str) -> Self {
        if kind == "*" {
            Self::Any
        } else {
            Self::Type(MessageType::from(kind))
        }
    }
}

/// Token returned by `on`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Inbound envelope callback.
pub type Handler = Arc<dyn Fn(&Envelope) -> anyhow::Result<()> + Send + Sync>;

struct Entry {
    id: HandlerId,
    subscription: Subscription,
    handler: Handler,
}

/// Ordered list of subscriptions.
#[derive(Default)]
pub struct HandlerRegistry {
    entries: Vec<Entry>,
    next_id: u64,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.entries.len())
            .finish_non_exhaustive()
    }
}

impl HandlerRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe. Multiple handlers per subscription are allowed.
    pub fn on(&mut self, subscription: Subscription, handler: Handler) -> HandlerId {
        let id = HandlerId(self.next_id);
        self.next_id += 1;
        self.entries.push(Entry {
            id,
            subscription,
            handler,
        });
        id
    }

    /// Unsubscribe. Returns `false` if the id was unknown.
    pub fn off(&mut self, id: HandlerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != id);
        self.entries.len() != before
    }

    /// Handlers interested in `kind`, in subscription order.
    ///
    /// Returned as owned clones so the caller can release the registry lock
    /// before invoking them; a handler may then call `on`/`off` itself.
    pub fn matching(&self, kind: &MessageType) -> Vec<Handler> {
        self.entries
            .iter()
            .filter(|e| e.subscription.matches(kind))
            .map(|e| Arc::clone(&e.handler))
            .collect()
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no handlers are registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Invoke each handler with `envelope`, isolating failures.
///
/// Returns the failures (already logged) so callers can count them.
pub fn dispatch(label: &str, handlers: &[Handler], envelope: &Envelope) -> Vec<RelayError> {
    let mut failures = Vec::new();
    for handler in handlers {
        let outcome = catch_unwind(AssertUnwindSafe(|| handler(envelope)));
        let failure = match outcome {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => RelayError::Handler(format!("{e:#}")),
            Err(panic) => {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "handler panicked".to_string());
                RelayError::Handler(format!("panic: {msg}"))
            }
        };
        log::error!(
            "[Relay:{}] Handler for '{}' failed: {}",
            label,
            envelope.kind,
            failure
        );
        failures.push(failure);
    }
    failures
}
