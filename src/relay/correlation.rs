//! Correlation table.
//!
//! Maps an outgoing request's correlation id to the caller waiting on it.
//! Each entry is settled exactly once: by a matching response, by its timeout
//! firing, or by shutdown. Removing the entry is the act of settling, so a
//! second settlement can never find it.
//!
//! Timeouts run on a [`DelayQueue`] owned by the table; the relay loop polls
//! [`CorrelationTable::next_timeout`] alongside its other event sources.

// Rust guideline compliant 2026-02

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::poll_fn;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio_util::time::{delay_queue, DelayQueue};

use crate::constants::LATE_RESPONSE_MEMORY;
use crate::envelope::Envelope;
use crate::error::RelayError;

/// Delivers the outcome of a correlated request.
pub type Resolver = oneshot::Sender<Result<Envelope, RelayError>>;

/// Caller side of a [`Resolver`].
pub type ResponseReceiver = oneshot::Receiver<Result<Envelope, RelayError>>;

/// A request waiting for its response.
#[derive(Debug)]
pub struct PendingRequest {
    /// Id stamped on the outgoing envelope.
    pub correlation_id: String,
    /// When the request was registered.
    pub created_at: Instant,
    /// Timeout the caller asked for.
    pub timeout: Duration,
    resolver: Resolver,
    timer: delay_queue::Key,
}

/// Outcome of offering an inbound envelope to the table.
#[derive(Debug)]
pub enum Resolution {
    /// The envelope has no correlation id.
    Uncorrelated(Envelope),
    /// A pending request was resolved with the envelope.
    Matched,
    /// The id belongs to a request that already timed out or failed.
    Late(Envelope),
    /// The id was never issued by this table (or was forgotten).
    Unknown(Envelope),
}

/// Bounded memory of recently settled ids.
#[derive(Debug)]
struct Settled {
    order: VecDeque<String>,
    ids: HashSet<String>,
    capacity: usize,
}

impl Settled {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            ids: HashSet::new(),
            capacity,
        }
    }

    fn remember(&mut self, id: String) {
        if self.capacity == 0 || !self.ids.insert(id.clone()) {
            return;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }
}

/// Pending correlated requests of one relay.
#[derive(Debug)]
pub struct CorrelationTable {
    pending: HashMap<String, PendingRequest>,
    timers: DelayQueue<String>,
    settled: Settled,
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrelationTable {
    /// Empty table.
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
            timers: DelayQueue::new(),
            settled: Settled::new(LATE_RESPONSE_MEMORY),
        }
    }

    /// Register a request and return the fresh correlation id to stamp on it.
    ///
    /// Ids are UUID v4, unique across every relay in the process, so requests
    /// from many sessions can share one backend connection.
    pub fn register(&mut self, resolver: Resolver, timeout: Duration) -> String {
        let mut correlation_id = uuid::Uuid::new_v4().to_string();
        while self.pending.contains_key(&correlation_id) {
            correlation_id = uuid::Uuid::new_v4().to_string();
        }

        let timer = self.timers.insert(correlation_id.clone(), timeout);
        self.pending.insert(
            correlation_id.clone(),
            PendingRequest {
                correlation_id: correlation_id.clone(),
                created_at: Instant::now(),
                timeout,
                resolver,
                timer,
            },
        );
        correlation_id
    }

    /// Offer an inbound envelope. Resolves the matching request, if any;
    /// otherwise hands the envelope back inside the resolution.
    pub fn resolve(&mut self, envelope: Envelope) -> Resolution {
        let Some(id) = envelope.correlation_id.as_deref() else {
            return Resolution::Uncorrelated(envelope);
        };
        if let Some(request) = self.pending.remove(id) {
            self.timers.remove(&request.timer);
            log::trace!(
                "[Correlation] {} resolved after {}ms",
                request.correlation_id,
                request.created_at.elapsed().as_millis()
            );
            let _ = request.resolver.send(Ok(envelope));
            return Resolution::Matched;
        }
        if self.settled.contains(id) {
            Resolution::Late(envelope)
        } else {
            Resolution::Unknown(envelope)
        }
    }

    /// Settle one request with an error. Returns `false` if it was not pending.
    pub fn fail(&mut self, correlation_id: &str, error: RelayError) -> bool {
        let Some(request) = self.pending.remove(correlation_id) else {
            return false;
        };
        self.timers.remove(&request.timer);
        self.settled.remember(request.correlation_id);
        let _ = request.resolver.send(Err(error));
        true
    }

    /// Settle every pending request with `error`. Returns how many there were.
    pub fn fail_all(&mut self, error: &RelayError) -> usize {
        self.timers.clear();
        let drained: Vec<PendingRequest> = self.pending.drain().map(|(_, r)| r).collect();
        let count = drained.len();
        for request in drained {
            self.settled.remember(request.correlation_id);
            let _ = request.resolver.send(Err(error.clone()));
        }
        count
    }

    /// Wait for the next timeout, settle that request as
    /// [`RelayError::Timeout`] and return its id.
    ///
    /// Resolves to `None` immediately when nothing is pending.
    pub async fn next_timeout(&mut self) -> Option<String> {
        let expired = poll_fn(|cx| self.timers.poll_expired(cx)).await?;
        let correlation_id = expired.into_inner();
        let request = self.pending.remove(&correlation_id)?;
        self.settled.remember(correlation_id.clone());
        let _ = request.resolver.send(Err(RelayError::Timeout {
            correlation_id: correlation_id.clone(),
            after: request.timeout,
        }));
        Some(correlation_id)
    }

    /// Whether `correlation_id` is still pending.
    pub fn contains(&self, correlation_id: &str) -> bool {
        self.pending.contains_key(correlation_id)
    }

    /// Number of pending requests.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(id: &str) -> Envelope {
        Envelope::new("chat-message")
            .with_correlation_id(id)
            .with_field("answer", 42)
    }

    fn register(table: &mut CorrelationTable, timeout: Duration) -> (String, ResponseReceiver) {
        let (tx, rx) = oneshot::channel();
        (table.register(tx, timeout), rx)
    }

    #[tokio::test]
    async fn test_matching_response_resolves_and_removes() {
        let mut table = CorrelationTable::new();
        let (id, rx) = register(&mut table, Duration::from_secs(5));
        assert_eq!(table.len(), 1);

        assert!(matches!(table.resolve(reply(&id)), Resolution::Matched));
        assert!(table.is_empty());

        let response = rx.await.unwrap().unwrap();
        assert_eq!(response.field("answer"), Some(&serde_json::Value::from(42)));
    }

    #[tokio::test]
    async fn test_ids_are_unique() {
        let mut table = CorrelationTable::new();
        let (a, _ra) = register(&mut table, Duration::from_secs(5));
        let (b, _rb) = register(&mut table, Duration::from_secs(5));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_unknown_and_uncorrelated_hand_envelope_back() {
        let mut table = CorrelationTable::new();
        match table.resolve(reply("nope")) {
            Resolution::Unknown(env) => assert_eq!(env.correlation_id.as_deref(), Some("nope")),
            other => panic!("expected Unknown, got {other:?}"),
        }
        assert!(matches!(
            table.resolve(Envelope::new("agent-progress")),
            Resolution::Uncorrelated(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_settles_once_and_late_reply_is_recognized() {
        let mut table = CorrelationTable::new();
        let (id, rx) = register(&mut table, Duration::from_millis(100));

        let expired = table.next_timeout().await;
        assert_eq!(expired.as_deref(), Some(id.as_str()));
        assert!(rx.await.unwrap().unwrap_err().is_timeout());

        assert!(matches!(table.resolve(reply(&id)), Resolution::Late(_)));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_next_timeout_empty_returns_none() {
        let mut table = CorrelationTable::new();
        assert_eq!(table.next_timeout().await, None);
    }

    #[tokio::test]
    async fn test_fail_all_settles_everything() {
        let mut table = CorrelationTable::new();
        let receivers: Vec<_> = (0..3)
            .map(|_| register(&mut table, Duration::from_secs(60)).1)
            .collect();

        assert_eq!(table.fail_all(&RelayError::Shutdown), 3);
        assert!(table.is_empty());
        for rx in receivers {
            assert_eq!(rx.await.unwrap().unwrap_err(), RelayError::Shutdown);
        }
        assert_eq!(table.next_timeout().await, None);
    }

    #[tokio::test]
    async fn test_fail_single_request() {
        let mut table = CorrelationTable::new();
        let (id, rx) = register(&mut table, Duration::from_secs(60));
        assert!(table.fail(&id, RelayError::QueueFull { capacity: 1 }));
        assert!(!table.fail(&id, RelayError::Shutdown));
        assert_eq!(
            rx.await.unwrap().unwrap_err(),
            RelayError::QueueFull { capacity: 1 }
        );
    }
}
