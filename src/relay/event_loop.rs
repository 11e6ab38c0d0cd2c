//! The relay's background task.
//!
//! Owns the [`Connection`], [`OutboundQueue`] and [`CorrelationTable`] of one
//! relay. Every mutation happens between the suspension points of a single
//! `tokio::select!` loop, so queue pushes, table inserts and state
//! transitions never interleave.
//!
//! Suspension points: a handle command, the in-flight connect attempt, an
//! inbound frame, the reconnect timer and the next correlation timeout.

// Rust guideline compliant 2026-02

use std::future::pending;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;

use super::backoff::{ReconnectDecision, ReconnectPolicy};
use super::correlation::{CorrelationTable, Resolution, Resolver};
use super::events::{RelayEvent, RelayStatus};
use super::handlers::{self, HandlerRegistry};
use super::queue::{OutboundQueue, OverflowPolicy, QueuedMessage};
use super::state::{Connection, ConnectionState, Transition};
use super::RelayRole;
use crate::envelope::Envelope;
use crate::error::RelayError;
use crate::transport::{Connector, Transport};
use crate::ws::WsMessage;

type ConnectAttempt = BoxFuture<'static, anyhow::Result<Transport>>;

/// Requests from [`super::Relay`] handles.
pub(super) enum Command {
    Connect,
    ReconnectNow,
    Send(Envelope),
    Request {
        envelope: Envelope,
        timeout: Duration,
        resolver: Resolver,
    },
    Disconnect {
        done: oneshot::Sender<()>,
    },
}

/// Everything the task needs from the builder.
pub(super) struct TaskConfig {
    pub label: String,
    pub session_id: String,
    pub role: RelayRole,
    pub policy: ReconnectPolicy,
    pub queue_capacity: usize,
    pub overflow: OverflowPolicy,
    pub reply_on_malformed: bool,
    pub connector: Arc<dyn Connector>,
}

pub(super) struct RelayTask {
    label: String,
    role: RelayRole,
    policy: ReconnectPolicy,
    reply_on_malformed: bool,
    connector: Arc<dyn Connector>,

    connection: Connection,
    queue: OutboundQueue,
    table: CorrelationTable,
    handlers: Arc<Mutex<HandlerRegistry>>,

    transport: Option<Transport>,
    attempt: Option<ConnectAttempt>,
    reconnect_at: Option<Instant>,
    exhausted: bool,
    handler_failures: u64,

    events: broadcast::Sender<RelayEvent>,
    status: watch::Sender<RelayStatus>,
}

impl RelayTask {
    pub(super) fn new(
        config: TaskConfig,
        handlers: Arc<Mutex<HandlerRegistry>>,
        events: broadcast::Sender<RelayEvent>,
        status: watch::Sender<RelayStatus>,
    ) -> Self {
        Self {
            label: config.label,
            role: config.role,
            policy: config.policy,
            reply_on_malformed: config.reply_on_malformed,
            connector: config.connector,
            connection: Connection::new(config.session_id),
            queue: OutboundQueue::new(config.queue_capacity, config.overflow),
            table: CorrelationTable::new(),
            handlers,
            transport: None,
            attempt: None,
            reconnect_at: None,
            exhausted: false,
            handler_failures: 0,
            events,
            status,
        }
    }

    /// Run until `disconnect()` or until every handle is dropped.
    pub(super) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        log::debug!(
            "[Relay:{}] Task started (session {})",
            self.label,
            self.connection.session_id()
        );

        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        log::debug!("[Relay:{}] All handles dropped", self.label);
                        self.shutdown().await;
                        break;
                    };
                    if let Command::Disconnect { done } = command {
                        // Later commands fail at the handle instead of queueing.
                        commands.close();
                        self.shutdown().await;
                        let _ = done.send(());
                        break;
                    }
                    self.handle_command(command).await;
                }
                result = attempt_outcome(&mut self.attempt) => {
                    self.attempt = None;
                    self.on_attempt_finished(result).await;
                }
                frame = next_frame(&mut self.transport) => {
                    self.on_frame(frame).await;
                }
                () = reconnect_timer(self.reconnect_at) => {
                    self.reconnect_at = None;
                    self.start_attempt();
                }
                Some(correlation_id) = self.table.next_timeout() => {
                    log::warn!(
                        "[Relay:{}] Request {} timed out",
                        self.label,
                        correlation_id
                    );
                }
            }
            self.publish_status();
        }

        self.publish_status();
        log::debug!("[Relay:{}] Task exited", self.label);
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => self.connect_manual(),
            Command::ReconnectNow => self.reconnect_now().await,
            Command::Send(envelope) => self.enqueue_or_send(envelope).await,
            Command::Request {
                mut envelope,
                timeout,
                resolver,
            } => {
                let correlation_id = self.table.register(resolver, timeout);
                log::debug!(
                    "[Relay:{}] Request '{}' as {} (timeout {}ms)",
                    self.label,
                    envelope.kind,
                    correlation_id,
                    timeout.as_millis()
                );
                envelope.correlation_id = Some(correlation_id);
                self.enqueue_or_send(envelope).await;
            }
            // Handled by the loop, which owns the receiver.
            Command::Disconnect { done } => {
                let _ = done.send(());
            }
        }
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    fn connect_manual(&mut self) {
        if !self.connection.can_connect() {
            log::debug!(
                "[Relay:{}] connect() ignored while {}",
                self.label,
                self.connection.state()
            );
            return;
        }
        self.connection.reset_attempts();
        self.exhausted = false;
        self.reconnect_at = None;
        self.start_attempt();
    }

    async fn reconnect_now(&mut self) {
        match self.connection.state() {
            ConnectionState::Shutdown => return,
            // The transport that prompted this was already claimed.
            ConnectionState::Open | ConnectionState::Connecting
                if !self.connector.has_pending() =>
            {
                log::debug!(
                    "[Relay:{}] Reconnect skipped, nothing new to connect to",
                    self.label
                );
                return;
            }
            ConnectionState::Open | ConnectionState::Connecting => {
                self.attempt = None;
                self.drop_transport().await;
                if let Some(transition) = self.connection.closed("reconnect requested") {
                    self.emit_transition(transition);
                }
            }
            ConnectionState::Idle | ConnectionState::Closed => {}
        }
        log::info!("[Relay:{}] Reconnecting immediately", self.label);
        self.connection.reset_attempts();
        self.exhausted = false;
        self.reconnect_at = None;
        self.start_attempt();
    }

    fn start_attempt(&mut self) {
        let Some(transition) = self.connection.begin_connect() else {
            return;
        };
        self.emit_transition(transition);
        log::info!(
            "[Relay:{}] Connecting to {}",
            self.label,
            self.connector.describe()
        );
        let connector = Arc::clone(&self.connector);
        self.attempt = Some(Box::pin(async move { connector.connect().await }));
    }

    async fn on_attempt_finished(&mut self, result: anyhow::Result<Transport>) {
        match result {
            Ok(transport) => {
                self.transport = Some(transport);
                let Some(transition) = self.connection.opened() else {
                    self.drop_transport().await;
                    return;
                };
                log::info!("[Relay:{}] Connected", self.label);
                self.exhausted = false;
                self.emit_transition(transition);
                self.flush().await;
            }
            Err(e) => {
                self.on_closed(RelayError::Transport(format!("connect failed: {e:#}")))
                    .await;
            }
        }
    }

    /// Transport error or remote close. Recorded as the status `last_error`.
    async fn on_closed(&mut self, error: RelayError) {
        self.drop_transport().await;
        let Some(transition) = self.connection.closed(error.to_string()) else {
            return;
        };
        log::warn!("[Relay:{}] Connection lost: {}", self.label, error);
        self.emit_transition(transition);
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        let attempt = self.connection.next_attempt();
        match self.policy.decide(attempt) {
            ReconnectDecision::Retry { attempt, delay } => {
                log::warn!(
                    "[Relay:{}] Reconnecting in {}ms (attempt {}/{})",
                    self.label,
                    delay.as_millis(),
                    attempt,
                    self.policy.max_attempts
                );
                self.reconnect_at = Some(Instant::now() + delay);
                self.emit(RelayEvent::ReconnectScheduled { attempt, delay });
            }
            ReconnectDecision::Exhausted { attempts } => {
                log::warn!(
                    "[Relay:{}] Reconnection exhausted after {} attempts; waiting for connect()",
                    self.label,
                    attempts
                );
                self.exhausted = true;
                self.emit(RelayEvent::ReconnectExhausted { attempts });
            }
        }
    }

    async fn shutdown(&mut self) {
        self.reconnect_at = None;
        self.attempt = None;
        self.drop_transport().await;
        if let Some(transition) = self.connection.shutdown() {
            self.emit_transition(transition);
        }
        let failed = self.table.fail_all(&RelayError::Shutdown);
        let dropped = self.queue.clear().len();
        log::info!(
            "[Relay:{}] Shut down ({} pending requests failed, {} queued messages dropped)",
            self.label,
            failed,
            dropped
        );
    }

    async fn drop_transport(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport.sink.close().await {
                log::debug!("[Relay:{}] Close failed: {:#}", self.label, e);
            }
        }
    }

    // ---------------------------------------------------------------------
    // Outbound
    // ---------------------------------------------------------------------

    async fn enqueue_or_send(&mut self, envelope: Envelope) {
        if self.connection.state() == ConnectionState::Open {
            if let Err(e) = self.transmit(&envelope).await {
                self.queue.requeue_front(QueuedMessage::new(envelope));
                self.on_closed(RelayError::Transport(format!("send failed: {e:#}"))).await;
            }
            return;
        }

        self.enqueue(envelope);

        // Connect on demand, unless a scheduled retry is already pending.
        match self.connection.state() {
            ConnectionState::Idle => self.start_attempt(),
            ConnectionState::Closed if self.reconnect_at.is_none() => {
                self.connection.reset_attempts();
                self.exhausted = false;
                self.start_attempt();
            }
            _ => {}
        }
    }

    fn enqueue(&mut self, envelope: Envelope) {
        let kind = envelope.kind.to_string();
        let correlation_id = envelope.correlation_id.clone();
        match self.queue.push(envelope) {
            Ok(None) => {
                log::debug!(
                    "[Relay:{}] Queued '{}' ({} waiting)",
                    self.label,
                    kind,
                    self.queue.len()
                );
            }
            Ok(Some(evicted)) => {
                let error = RelayError::QueueFull {
                    capacity: self.queue.capacity(),
                };
                self.drop_message(
                    evicted.envelope.kind.to_string(),
                    evicted.envelope.correlation_id,
                    &error,
                );
            }
            Err(error) => self.drop_message(kind, correlation_id, &error),
        }
    }

    fn drop_message(&mut self, kind: String, correlation_id: Option<String>, error: &RelayError) {
        log::warn!("[Relay:{}] Dropping '{}': {}", self.label, kind, error);
        if let Some(id) = correlation_id.as_deref() {
            self.table.fail(id, error.clone());
        }
        self.emit(RelayEvent::MessageDropped {
            message_type: kind,
            reason: error.to_string(),
        });
    }

    /// Drain the queue in FIFO order. A failed transmission puts the message
    /// back at the head and closes the connection.
    async fn flush(&mut self) {
        let mut sent = 0usize;
        while let Some(message) = self.queue.pop_front() {
            if let Err(e) = self.transmit(&message.envelope).await {
                self.queue.requeue_front(message);
                log::warn!(
                    "[Relay:{}] Flush interrupted after {} messages ({} still queued)",
                    self.label,
                    sent,
                    self.queue.len()
                );
                self.on_closed(RelayError::Transport(format!("send failed during flush: {e:#}")))
                    .await;
                return;
            }
            sent += 1;
        }
        if sent > 0 {
            log::info!("[Relay:{}] Flushed {} queued messages", self.label, sent);
        }
    }

    async fn transmit(&mut self, envelope: &Envelope) -> anyhow::Result<()> {
        let text = match envelope.encode() {
            Ok(text) => text,
            Err(error) => {
                log::error!(
                    "[Relay:{}] Cannot encode '{}': {}",
                    self.label,
                    envelope.kind,
                    error
                );
                if let Some(id) = envelope.correlation_id.as_deref() {
                    self.table.fail(id, error);
                }
                return Ok(());
            }
        };
        let Some(transport) = self.transport.as_mut() else {
            anyhow::bail!("no transport");
        };
        transport.sink.send_text(&text).await?;
        log::trace!("[Relay:{}] -> {}", self.label, text);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Inbound
    // ---------------------------------------------------------------------

    async fn on_frame(&mut self, frame: Option<anyhow::Result<WsMessage>>) {
        match frame {
            None => {
                self.on_closed(RelayError::Transport("closed by peer".to_string()))
                    .await;
            }
            Some(Err(e)) => {
                self.on_closed(RelayError::Transport(format!("receive failed: {e:#}")))
                    .await;
            }
            Some(Ok(WsMessage::Text(text))) => self.on_text(&text).await,
            Some(Ok(WsMessage::Binary(data))) => match String::from_utf8(data) {
                Ok(text) => self.on_text(&text).await,
                Err(_) => log::debug!("[Relay:{}] Ignoring non-UTF-8 binary frame", self.label),
            },
            Some(Ok(WsMessage::Ping(data))) => {
                let Some(transport) = self.transport.as_mut() else {
                    return;
                };
                if let Err(e) = transport.sink.send_pong(data).await {
                    self.on_closed(RelayError::Transport(format!("pong failed: {e:#}"))).await;
                }
            }
            Some(Ok(WsMessage::Pong(_))) => {}
            Some(Ok(WsMessage::Close { code, reason })) => {
                let reason = format!("closed by peer ({code}): {reason}");
                self.on_closed(RelayError::Transport(reason)).await;
            }
        }
    }

    async fn on_text(&mut self, text: &str) {
        log::trace!("[Relay:{}] <- {}", self.label, text);
        let envelope = match Envelope::decode(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::warn!("[Relay:{}] Dropping malformed frame: {}", self.label, e);
                if self.reply_on_malformed {
                    let reply = Envelope::error("invalid_json", "Invalid JSON format")
                        .with_session_id(self.connection.session_id());
                    self.enqueue_or_send(reply).await;
                }
                return;
            }
        };

        match self.table.resolve(envelope) {
            Resolution::Matched => {}
            Resolution::Uncorrelated(envelope) => self.dispatch(&envelope),
            Resolution::Late(envelope) => {
                log::info!(
                    "[Relay:{}] Ignoring late '{}' for {}",
                    self.label,
                    envelope.kind,
                    envelope.correlation_id.as_deref().unwrap_or_default()
                );
            }
            Resolution::Unknown(envelope) => match self.role {
                RelayRole::Responder => self.dispatch(&envelope),
                RelayRole::Initiator => {
                    log::debug!(
                        "[Relay:{}] Dropping '{}' with unknown correlation id {}",
                        self.label,
                        envelope.kind,
                        envelope.correlation_id.as_deref().unwrap_or_default()
                    );
                }
            },
        }
    }

    fn dispatch(&mut self, envelope: &Envelope) {
        let matching = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .matching(&envelope.kind);
        if matching.is_empty() {
            log::trace!(
                "[Relay:{}] No handler for '{}'",
                self.label,
                envelope.kind
            );
            return;
        }
        let failures = handlers::dispatch(&self.label, &matching, envelope);
        self.handler_failures += failures.len() as u64;
    }

    // ---------------------------------------------------------------------
    // Observability
    // ---------------------------------------------------------------------

    fn emit(&self, event: RelayEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn emit_transition(&self, transition: Transition) {
        log::debug!(
            "[Relay:{}] {} -> {}",
            self.label,
            transition.from,
            transition.to
        );
        self.emit(RelayEvent::StateChanged {
            from: transition.from,
            to: transition.to,
        });
        self.publish_status();
    }

    fn publish_status(&self) {
        let next = RelayStatus {
            session_id: self.connection.session_id().to_string(),
            state: self.connection.state(),
            attempt: self.connection.attempt(),
            queue_depth: self.queue.len(),
            pending_requests: self.table.len(),
            last_error: self.connection.last_error().map(str::to_string),
            exhausted: self.exhausted,
            handler_failures: self.handler_failures,
        };
        self.status.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

async fn attempt_outcome(attempt: &mut Option<ConnectAttempt>) -> anyhow::Result<Transport> {
    match attempt {
        Some(future) => future.await,
        None => pending().await,
    }
}

async fn next_frame(transport: &mut Option<Transport>) -> Option<anyhow::Result<WsMessage>> {
    match transport {
        Some(transport) => transport.stream.recv().await,
        None => pending().await,
    }
}

async fn reconnect_timer(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => pending().await,
    }
}
