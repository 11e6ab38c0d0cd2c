//! Relay behavior over the in-memory transport.
//!
//! Time is paused, so reconnect backoff and request timeouts run instantly
//! and deterministically.

use std::time::Duration;

use aibox_relay::relay::{OverflowPolicy, RelayEvent};
use aibox_relay::transport::memory::{self, MemoryConnector, MemoryListener, MemoryPeer};
use aibox_relay::transport::{AttachedConnector, Connector};
use aibox_relay::{ConnectionState, Envelope, MessageType, Relay, RelayError};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

/// Helper to build a relay with short backoff over a scriptable connector
fn setup_relay() -> (Relay, MemoryConnector, MemoryListener) {
    let (connector, listener) = memory::connector();
    let relay = Relay::builder(connector.clone())
        .label("scenario")
        .base_interval(Duration::from_millis(100))
        .max_interval(Duration::from_secs(1))
        .max_attempts(9)
        .build();
    (relay, connector, listener)
}

/// Helper to connect and return the far end once OPEN
async fn open(relay: &Relay, listener: &mut MemoryListener) -> MemoryPeer {
    relay.connect();
    let peer = listener.accept().await.unwrap();
    relay.wait_for_state(ConnectionState::Open).await.unwrap();
    peer
}

/// Helper to record everything handed to handlers
fn collect(relay: &Relay) -> mpsc::UnboundedReceiver<Envelope> {
    let (tx, rx) = mpsc::unbounded_channel();
    relay.on("*", move |envelope: &Envelope| {
        let _ = tx.send(envelope.clone());
        Ok(())
    });
    rx
}

fn numbered(n: u64) -> Envelope {
    Envelope::new(MessageType::ChatMessage).with_field("n", n)
}

fn number(envelope: &Envelope) -> Option<u64> {
    envelope.field("n").and_then(serde_json::Value::as_u64)
}

fn reply_to(request: &Envelope) -> Envelope {
    Envelope::new(request.kind.clone())
        .with_correlation_id(request.correlation_id.clone().unwrap())
        .with_field("response", "ok")
}

async fn next_event(
    events: &mut broadcast::Receiver<RelayEvent>,
    matches: impl Fn(&RelayEvent) -> bool,
) -> RelayEvent {
    loop {
        let event = events.recv().await.unwrap();
        if matches(&event) {
            return event;
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_request_while_connecting_resolves_with_backend_reply() {
    let (relay, connector, mut listener) = setup_relay();
    connector.set_connect_delay(Duration::from_millis(200));

    relay.connect();
    relay
        .wait_for_state(ConnectionState::Connecting)
        .await
        .unwrap();

    let pending = relay.request(
        Envelope::new(MessageType::ChatMessage).with_field("text", "hi"),
        Duration::from_secs(5),
    );

    let mut backend = listener.accept().await.unwrap();
    let request = backend.recv().await.unwrap();
    assert_eq!(request.str_field("text"), Some("hi"));
    assert_eq!(request.session_id, relay.session_id());

    backend.send(&reply_to(&request).with_field("response", "hello"));
    let response = pending.await.unwrap();
    assert_eq!(response.str_field("response"), Some("hello"));

    let status = relay.status();
    assert_eq!(status.state, ConnectionState::Open);
    assert_eq!(status.queue_depth, 0);
    assert_eq!(status.pending_requests, 0);
}

#[tokio::test(start_paused = true)]
async fn test_reply_with_naive_timestamp_settles_request() {
    let (relay, _connector, mut listener) = setup_relay();
    let mut backend = open(&relay, &mut listener).await;

    let pending = relay.request(numbered(1), Duration::from_millis(500));
    let request = backend.recv().await.unwrap();
    backend.send_text(&format!(
        r#"{{"type":"chat-message","correlationId":"{}","timestamp":"2026-10-19T13:44:00.123456","response":"ok"}}"#,
        request.correlation_id.unwrap()
    ));

    let response = pending.await.unwrap();
    assert_eq!(response.str_field("response"), Some("ok"));
}

#[tokio::test(start_paused = true)]
async fn test_late_reply_after_timeout_is_ignored() {
    let (relay, _connector, mut listener) = setup_relay();
    let mut backend = open(&relay, &mut listener).await;
    let mut dispatched = collect(&relay);

    let started = Instant::now();
    let result = relay
        .request(numbered(1), Duration::from_millis(100))
        .await;
    match result {
        Err(RelayError::Timeout { after, .. }) => assert_eq!(after, Duration::from_millis(100)),
        other => panic!("expected timeout, got {other:?}"),
    }
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(relay.status().pending_requests, 0);

    let request = backend.recv().await.unwrap();
    tokio::time::sleep_until(started + Duration::from_millis(150)).await;
    backend.send(&reply_to(&request));

    // Anything dispatched from the late reply would arrive before this.
    backend.send(&Envelope::new(MessageType::SystemNotification));
    let first = dispatched.recv().await.unwrap();
    assert_eq!(first.kind, MessageType::SystemNotification);
}

#[tokio::test(start_paused = true)]
async fn test_flush_interrupted_resumes_in_order_before_new_messages() {
    let (relay, connector, mut listener) = setup_relay();
    connector.set_connect_delay(Duration::from_millis(50));
    connector.fail_after_frames(2);

    for n in 1..=5 {
        relay.send(numbered(n)).unwrap();
    }

    let mut first = listener.accept().await.unwrap();
    assert_eq!(first.recv().await.as_ref().and_then(number), Some(1));
    assert_eq!(first.recv().await.as_ref().and_then(number), Some(2));
    assert!(first.recv().await.is_none());

    // Sent while CLOSED with a retry pending: goes behind the leftovers.
    relay.send(numbered(6)).unwrap();

    let mut second = listener.accept().await.unwrap();
    for expected in 3..=6 {
        assert_eq!(second.recv().await.as_ref().and_then(number), Some(expected));
    }

    relay.wait_for_state(ConnectionState::Open).await.unwrap();
    relay.send(numbered(7)).unwrap();
    assert_eq!(second.recv().await.as_ref().and_then(number), Some(7));
    assert_eq!(connector.attempts(), 2);
    assert_eq!(relay.status().queue_depth, 0);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_fails_pending_requests_without_reconnecting() {
    let (relay, connector, mut listener) = setup_relay();
    let mut backend = open(&relay, &mut listener).await;

    let pending: Vec<_> = (1..=3)
        .map(|n| relay.request(numbered(n), Duration::from_secs(30)))
        .collect();
    for _ in 0..3 {
        assert!(backend.recv().await.is_some());
    }

    relay.disconnect().await;
    for request in pending {
        assert_eq!(request.await, Err(RelayError::Shutdown));
    }

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(connector.attempts(), 1);
    assert_eq!(relay.state(), ConnectionState::Shutdown);
    assert!(relay.is_shutdown());
    assert!(backend.recv().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_exhaustion_then_manual_connect() {
    let (relay, connector, mut listener) = setup_relay();
    connector.refuse_all(true);
    let mut events = relay.events();

    relay.connect();
    let exhausted = next_event(&mut events, |e| {
        matches!(e, RelayEvent::ReconnectExhausted { .. })
    })
    .await;
    assert_eq!(exhausted, RelayEvent::ReconnectExhausted { attempts: 9 });
    assert_eq!(connector.attempts(), 10);

    let status = relay.status();
    assert_eq!(status.state, ConnectionState::Closed);
    assert!(status.exhausted);
    assert_eq!(
        status.last_error.as_deref(),
        Some("Transport error: connect failed: connection refused")
    );

    // Nothing further is scheduled on its own.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(connector.attempts(), 10);

    connector.refuse_all(false);
    relay.connect();
    let _backend = listener.accept().await.unwrap();
    relay.wait_for_state(ConnectionState::Open).await.unwrap();

    let status = relay.status();
    assert_eq!(status.attempt, 0);
    assert!(!status.exhausted);
    assert_eq!(connector.attempts(), 11);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_delays_grow_linearly() {
    let (relay, connector, _listener) = setup_relay();
    connector.refuse_all(true);
    let mut events = relay.events();

    relay.connect();
    let mut delays = Vec::new();
    while delays.len() < 3 {
        if let RelayEvent::ReconnectScheduled { attempt, delay } = events.recv().await.unwrap() {
            assert_eq!(attempt as usize, delays.len() + 1);
            delays.push(delay);
        }
    }
    assert_eq!(
        delays,
        vec![
            Duration::from_millis(100),
            Duration::from_millis(200),
            Duration::from_millis(300)
        ]
    );
    relay.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn test_connect_is_idempotent_while_connecting() {
    let (relay, connector, mut listener) = setup_relay();
    connector.set_connect_delay(Duration::from_millis(50));

    relay.connect();
    relay.connect();
    relay.connect();
    let _backend = listener.accept().await.unwrap();
    relay.wait_for_state(ConnectionState::Open).await.unwrap();

    relay.connect();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(connector.attempts(), 1);
    assert!(listener.try_accept().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_sends_arrive_in_call_order() {
    let (relay, _connector, mut listener) = setup_relay();

    // Half queued before the connection exists, half sent while OPEN.
    for n in 1..=3 {
        relay.send(numbered(n)).unwrap();
    }
    let mut backend = listener.accept().await.unwrap();
    relay.wait_for_state(ConnectionState::Open).await.unwrap();
    for n in 4..=6 {
        relay.send(numbered(n)).unwrap();
    }

    for expected in 1..=6 {
        assert_eq!(backend.recv().await.as_ref().and_then(number), Some(expected));
    }
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_reply_settles_once() {
    let (relay, _connector, mut listener) = setup_relay();
    let mut backend = open(&relay, &mut listener).await;
    let mut dispatched = collect(&relay);

    let pending = relay.request(numbered(1), Duration::from_secs(5));
    let request = backend.recv().await.unwrap();
    backend.send(&reply_to(&request).with_field("copy", 1));
    backend.send(&reply_to(&request).with_field("copy", 2));
    backend.send(&Envelope::new(MessageType::SystemNotification));

    let response = pending.await.unwrap();
    assert_eq!(response.field("copy"), Some(&serde_json::json!(1)));
    let first = dispatched.recv().await.unwrap();
    assert_eq!(first.kind, MessageType::SystemNotification);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_correlation_is_dropped_by_initiator() {
    let (relay, _connector, mut listener) = setup_relay();
    let backend = open(&relay, &mut listener).await;
    let mut dispatched = collect(&relay);

    backend.send(&Envelope::new(MessageType::ChatMessage).with_correlation_id("never-sent"));
    backend.send(&Envelope::new(MessageType::AgentProgress));

    let first = dispatched.recv().await.unwrap();
    assert_eq!(first.kind, MessageType::AgentProgress);
}

#[tokio::test(start_paused = true)]
async fn test_full_queue_rejects_and_reports() {
    let (connector, _listener) = memory::connector();
    connector.set_connect_delay(Duration::from_secs(3600));
    let relay = Relay::builder(connector.clone())
        .label("bounded")
        .queue_capacity(2)
        .build();
    let mut events = relay.events();

    relay.send(numbered(1)).unwrap();
    relay.send(numbered(2)).unwrap();
    relay.send(numbered(3)).unwrap();

    let dropped = next_event(&mut events, |e| {
        matches!(e, RelayEvent::MessageDropped { .. })
    })
    .await;
    match dropped {
        RelayEvent::MessageDropped { message_type, .. } => {
            assert_eq!(message_type, "chat-message");
        }
        other => panic!("unexpected event {other:?}"),
    }

    let rejected = relay.request(numbered(4), Duration::from_secs(5)).await;
    assert_eq!(rejected, Err(RelayError::QueueFull { capacity: 2 }));

    let mut watch = relay.status_watch();
    let status = watch
        .wait_for(|s| s.queue_depth == 2 && s.pending_requests == 0)
        .await
        .unwrap()
        .clone();
    assert_eq!(status.queue_depth, 2);
    assert_eq!(status.pending_requests, 0);
    assert_eq!(status.state, ConnectionState::Connecting);
}

#[tokio::test(start_paused = true)]
async fn test_drop_oldest_fails_evicted_request() {
    let (connector, _listener) = memory::connector();
    connector.set_connect_delay(Duration::from_secs(3600));
    let relay = Relay::builder(connector.clone())
        .label("drop-oldest")
        .queue_capacity(2)
        .overflow(OverflowPolicy::DropOldest)
        .build();
    let mut events = relay.events();

    let evicted = relay.request(numbered(1), Duration::from_secs(30));
    relay.send(numbered(2)).unwrap();
    relay.send(numbered(3)).unwrap();

    assert_eq!(evicted.await, Err(RelayError::QueueFull { capacity: 2 }));
    let dropped = next_event(&mut events, |e| {
        matches!(e, RelayEvent::MessageDropped { .. })
    })
    .await;
    match dropped {
        RelayEvent::MessageDropped { message_type, .. } => {
            assert_eq!(message_type, "chat-message");
        }
        other => panic!("unexpected event {other:?}"),
    }

    let status = relay.status();
    assert_eq!(status.queue_depth, 2);
    assert_eq!(status.pending_requests, 0);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_now_keeps_socket_already_claimed() {
    let connector = AttachedConnector::new("browser");
    let relay = Relay::builder(connector.clone())
        .label("attached")
        .base_interval(Duration::from_millis(100))
        .build();

    let (transport, mut first) = memory::pair();
    connector.attach(transport);
    relay.connect();
    relay.wait_for_state(ConnectionState::Open).await.unwrap();

    first.close();
    relay.wait_for_state(ConnectionState::Closed).await.unwrap();

    // The retry timer picks the new socket up before the re-attach signal.
    let (transport, mut second) = memory::pair();
    connector.attach(transport);
    relay.wait_for_state(ConnectionState::Open).await.unwrap();
    relay.reconnect_now();

    relay.send(numbered(1)).unwrap();
    assert_eq!(second.recv().await.as_ref().and_then(number), Some(1));
    assert!(!connector.has_pending());
    assert_eq!(relay.state(), ConnectionState::Open);
}
