//! Reconnecting, correlating message relay.
//!
//! One [`Relay`] covers one hop of the path (browser ↔ edge, edge ↔ backend).
//! It composes the connection state machine, reconnection policy, outbound
//! queue and correlation table behind a small send/receive contract.
//!
//! # Architecture
//!
//! ```text
//!   Relay (handle, Clone)                  RelayTask (tokio task)
//!     │ connect / reconnect_now               │ Connection
//!     │ send / request ──── Command ────────► │ OutboundQueue
//!     │ disconnect                            │ CorrelationTable
//!     │                                       │ Transport (from Connector)
//!     │ on / off ──► HandlerRegistry ◄─────── │ dispatch
//!     │ status()  ◄── watch ──────────────────│
//!     │ events()  ◄── broadcast ──────────────│
//! ```
//!
//! Commands are queued at call time, so call order is transmission order
//! even when a `request` future is awaited later or on another task.

// Rust guideline compliant 2026-02

pub mod backoff;
pub mod correlation;
pub mod events;
pub mod handlers;
pub mod queue;
pub mod state;

mod event_loop;

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

pub use backoff::{ReconnectDecision, ReconnectPolicy};
pub use correlation::CorrelationTable;
pub use events::{RelayEvent, RelayStatus};
pub use handlers::{HandlerId, Subscription};
pub use queue::{OutboundQueue, OverflowPolicy};
pub use state::ConnectionState;

use crate::config::RelayConfig;
use crate::constants::{DEFAULT_QUEUE_CAPACITY, DEFAULT_REQUEST_TIMEOUT, EVENT_CHANNEL_CAPACITY};
use crate::envelope::Envelope;
use crate::error::RelayError;
use crate::transport::Connector;
use event_loop::{Command, RelayTask, TaskConfig};
use handlers::HandlerRegistry;

/// How a relay treats inbound correlated envelopes it did not issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RelayRole {
    /// Correlated inbound envelopes are responses; unmatched ones are
    /// dropped without reaching handlers.
    #[default]
    Initiator,
    /// The peer issues requests over this hop (edge-side session relay):
    /// unmatched correlated envelopes are dispatched to handlers.
    Responder,
}

/// Handle to a running relay.
///
/// Cloning is cheap; all clones drive the same task. The task shuts down on
/// [`Relay::disconnect`] or once the last handle is dropped.
#[derive(Clone)]
pub struct Relay {
    label: Arc<str>,
    session_id: Arc<str>,
    request_timeout: Duration,
    commands: mpsc::UnboundedSender<Command>,
    handlers: Arc<Mutex<HandlerRegistry>>,
    events: broadcast::Sender<RelayEvent>,
    status: watch::Receiver<RelayStatus>,
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("label", &self.label)
            .field("session_id", &self.session_id)
            .field("state", &self.status.borrow().state)
            .finish_non_exhaustive()
    }
}

impl Relay {
    /// Start configuring a relay that connects through `connector`.
    pub fn builder(connector: impl Connector) -> RelayBuilder {
        RelayBuilder::new(Arc::new(connector))
    }

    /// Log label (`[Relay:<label>]`).
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Session id, stable across reconnects.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Timeout used by [`Relay::request_default`].
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Start connecting. No-op while CONNECTING or OPEN; from CLOSED it
    /// resets the attempt counter, including after reconnection gave up.
    pub fn connect(&self) {
        self.command(Command::Connect);
    }

    /// Drop the current transport and dial again right away with a fresh
    /// attempt counter.
    ///
    /// While OPEN or CONNECTING this is skipped when the connector has
    /// nothing new to offer, so a socket handed over by an
    /// [`AttachedConnector`](crate::transport::AttachedConnector) that the
    /// relay already picked up is never torn down.
    pub fn reconnect_now(&self) {
        self.command(Command::ReconnectNow);
    }

    /// Move to SHUTDOWN. Pending requests fail with [`RelayError::Shutdown`],
    /// queued messages are discarded and no reconnection is scheduled.
    ///
    /// Resolves once that has happened. Idempotent.
    pub async fn disconnect(&self) {
        let (done, finished) = oneshot::channel();
        if self.commands.send(Command::Disconnect { done }).is_ok() {
            let _ = finished.await;
        }
    }

    /// Fire-and-forget send. Transmits now when OPEN, otherwise queues (and
    /// connects on demand).
    ///
    /// Only fails once the relay has shut down.
    pub fn send(&self, envelope: Envelope) -> Result<(), RelayError> {
        self.commands
            .send(Command::Send(self.stamp(envelope)))
            .map_err(|_closed| RelayError::Shutdown)
    }

    /// Correlated send.
    ///
    /// The envelope gets a fresh correlation id and is queued before this
    /// returns. The future resolves exactly once: with the matching response,
    /// with [`RelayError::Timeout`] after `timeout`, or with
    /// [`RelayError::Shutdown`].
    pub fn request(
        &self,
        envelope: Envelope,
        timeout: Duration,
    ) -> impl Future<Output = Result<Envelope, RelayError>> + Send + 'static {
        let (resolver, response) = oneshot::channel();
        let queued = self
            .commands
            .send(Command::Request {
                envelope: self.stamp(envelope),
                timeout,
                resolver,
            })
            .map_err(|_closed| RelayError::Shutdown);

        async move {
            queued?;
            response.await.unwrap_or(Err(RelayError::Shutdown))
        }
    }

    /// [`Relay::request`] with the configured timeout.
    pub fn request_default(
        &self,
        envelope: Envelope,
    ) -> impl Future<Output = Result<Envelope, RelayError>> + Send + 'static {
        self.request(envelope, self.request_timeout)
    }

    /// Subscribe to inbound envelopes. Handlers run on the relay task in
    /// subscription order; keep them short and spawn for anything slow.
    pub fn on<F>(&self, subscription: impl Into<Subscription>, handler: F) -> HandlerId
    where
        F: Fn(&Envelope) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.registry().on(subscription.into(), Arc::new(handler))
    }

    /// Unsubscribe. Returns `false` if `id` was not registered.
    pub fn off(&self, id: HandlerId) -> bool {
        self.registry().off(id)
    }

    /// Lifecycle and drop events.
    pub fn events(&self) -> broadcast::Receiver<RelayEvent> {
        self.events.subscribe()
    }

    /// Current snapshot.
    pub fn status(&self) -> RelayStatus {
        self.status.borrow().clone()
    }

    /// Watch channel of snapshots.
    pub fn status_watch(&self) -> watch::Receiver<RelayStatus> {
        self.status.clone()
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    /// Wait until the relay reaches `state`.
    ///
    /// Fails with [`RelayError::Shutdown`] if the task exits first without
    /// ever reaching it.
    pub async fn wait_for_state(&self, state: ConnectionState) -> Result<(), RelayError> {
        let mut status = self.status.clone();
        status
            .wait_for(|s| s.state == state)
            .await
            .map(|_| ())
            .map_err(|_closed| RelayError::Shutdown)
    }

    /// Whether the task has exited.
    pub fn is_shutdown(&self) -> bool {
        self.commands.is_closed()
    }

    /// Whether both handles drive the same relay task.
    pub fn same_instance(&self, other: &Relay) -> bool {
        self.commands.same_channel(&other.commands)
    }

    fn stamp(&self, mut envelope: Envelope) -> Envelope {
        if envelope.session_id.is_empty() {
            envelope.session_id = self.session_id.to_string();
        }
        envelope.timestamp = Utc::now();
        envelope
    }

    fn command(&self, command: Command) {
        if self.commands.send(command).is_err() {
            log::debug!("[Relay:{}] Command after shutdown ignored", self.label);
        }
    }

    fn registry(&self) -> MutexGuard<'_, HandlerRegistry> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Configures and spawns a [`Relay`].
pub struct RelayBuilder {
    connector: Arc<dyn Connector>,
    label: String,
    session_id: Option<String>,
    role: RelayRole,
    policy: ReconnectPolicy,
    queue_capacity: usize,
    overflow: OverflowPolicy,
    request_timeout: Duration,
    reply_on_malformed: bool,
}

impl std::fmt::Debug for RelayBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayBuilder")
            .field("label", &self.label)
            .field("connector", &self.connector.describe())
            .field("role", &self.role)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl RelayBuilder {
    fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            label: "relay".to_string(),
            session_id: None,
            role: RelayRole::default(),
            policy: ReconnectPolicy::default(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            overflow: OverflowPolicy::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            reply_on_malformed: false,
        }
    }

    /// Label used in log lines.
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Fixed session id (default: fresh UUID v4).
    pub fn session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Initiator or responder.
    pub fn role(mut self, role: RelayRole) -> Self {
        self.role = role;
        self
    }

    /// Reconnection policy.
    pub fn policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Base reconnect interval.
    pub fn base_interval(mut self, interval: Duration) -> Self {
        self.policy.base_interval = interval;
        self
    }

    /// Reconnect delay ceiling.
    pub fn max_interval(mut self, interval: Duration) -> Self {
        self.policy.max_interval = interval;
        self
    }

    /// Reconnect attempts before giving up.
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.policy.max_attempts = attempts;
        self
    }

    /// Outbound queue bound.
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// What happens when the queue is full.
    pub fn overflow(mut self, overflow: OverflowPolicy) -> Self {
        self.overflow = overflow;
        self
    }

    /// Timeout for [`Relay::request_default`].
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Answer undecodable frames with an `error` envelope.
    pub fn reply_on_malformed(mut self, reply: bool) -> Self {
        self.reply_on_malformed = reply;
        self
    }

    /// Apply one tier's configuration (everything except the URL).
    pub fn config(self, config: &RelayConfig) -> Self {
        self.policy(config.policy())
            .queue_capacity(config.queue_capacity)
            .overflow(config.overflow)
            .request_timeout(config.request_timeout())
    }

    /// Spawn the relay task. Must be called from within a tokio runtime.
    ///
    /// The relay starts IDLE; call [`Relay::connect`] or just send.
    #[must_use]
    pub fn build(self) -> Relay {
        let session_id = self
            .session_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let handlers = Arc::new(Mutex::new(HandlerRegistry::new()));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (status_tx, status_rx) = watch::channel(RelayStatus::new(&session_id));
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let task = RelayTask::new(
            TaskConfig {
                label: self.label.clone(),
                session_id: session_id.clone(),
                role: self.role,
                policy: self.policy,
                queue_capacity: self.queue_capacity,
                overflow: self.overflow,
                reply_on_malformed: self.reply_on_malformed,
                connector: self.connector,
            },
            Arc::clone(&handlers),
            events.clone(),
            status_tx,
        );
        tokio::spawn(task.run(command_rx));

        Relay {
            label: self.label.into(),
            session_id: session_id.into(),
            request_timeout: self.request_timeout,
            commands: command_tx,
            handlers,
            events,
            status: status_rx,
        }
    }
}
