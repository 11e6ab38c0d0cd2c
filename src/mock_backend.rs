//! Minimal backend service for local development and end-to-end tests.
//!
//! Speaks the backend boundary of the relay protocol: requests of a known
//! type get a reply carrying the same `correlationId`; `agent-task` first
//! emits an uncorrelated `agent-progress` notification; unknown types get an
//! `error` envelope. No business logic lives here.

// Rust guideline compliant 2026-02

use std::future::Future;

use anyhow::{Context, Result};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};

use crate::config::MockBackendConfig;
use crate::envelope::{Envelope, MessageType};
use crate::ws::{self, WsMessage, WsWriter};

/// Envelopes to send back for one inbound request, in order.
pub fn respond(request: &Envelope) -> Vec<Envelope> {
    let reply = |kind: MessageType| {
        let mut envelope = Envelope::new(kind).with_session_id(&request.session_id);
        envelope.correlation_id.clone_from(&request.correlation_id);
        envelope
    };

    match &request.kind {
        MessageType::ChatMessage => {
            let text = request.str_field("text").unwrap_or_default();
            vec![reply(MessageType::ChatMessage)
                .with_field("response", format!("AI Box processed: {text}"))]
        }
        MessageType::AgentTask => {
            let task = request.str_field("task").unwrap_or("task").to_string();
            let progress = Envelope::new(MessageType::AgentProgress)
                .with_session_id(&request.session_id)
                .with_field("task", task.clone())
                .with_field("status", "running")
                .with_field("progress", 50);
            vec![
                progress,
                reply(MessageType::AgentTask)
                    .with_field("task", task)
                    .with_field("status", "completed"),
            ]
        }
        MessageType::DocumentSearch => {
            let query = request.str_field("query").unwrap_or_default();
            vec![reply(MessageType::DocumentSearch)
                .with_field("query", query)
                .with_field(
                    "results",
                    json!([{ "title": format!("Result for {query}"), "score": 0.9 }]),
                )]
        }
        MessageType::StatusRequest => vec![reply(MessageType::StatusRequest)
            .with_field("status", "healthy")
            .with_field(
                "services",
                json!({ "chat": "up", "agents": "up", "search": "up" }),
            )],
        MessageType::Ping => vec![reply(MessageType::Pong)],
        other => vec![reply(MessageType::Error)
            .with_field("code", "unknown_type")
            .with_field("message", format!("Unknown message type: {other}"))],
    }
}

/// Serve connections on `listener` until `shutdown` resolves.
pub async fn serve(listener: TcpListener, shutdown: impl Future<Output = ()>) -> Result<()> {
    log::info!("[MockBackend] Listening on {}", listener.local_addr()?);
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream).await {
                            log::warn!("[MockBackend] Connection {} ended: {:#}", peer, e);
                        }
                    });
                }
                Err(e) => log::warn!("[MockBackend] Accept failed: {}", e),
            },
            () = &mut shutdown => break,
        }
    }
    log::info!("[MockBackend] Stopped");
    Ok(())
}

/// Bind `config.listen` and serve until `shutdown` resolves.
pub async fn run(config: &MockBackendConfig, shutdown: impl Future<Output = ()>) -> Result<()> {
    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen))?;
    serve(listener, shutdown).await
}

async fn handle_connection(stream: TcpStream) -> Result<()> {
    let (path, mut writer, mut reader) = ws::accept(stream).await?;
    log::info!("[MockBackend] Client connected on {}", path);

    while let Some(message) = reader.recv().await {
        match message? {
            WsMessage::Text(text) => handle_text(&mut writer, &text).await?,
            WsMessage::Ping(data) => writer.send_pong(data).await?,
            WsMessage::Close { .. } => break,
            WsMessage::Binary(_) | WsMessage::Pong(_) => {}
        }
    }
    log::info!("[MockBackend] Client disconnected");
    Ok(())
}

async fn handle_text(writer: &mut WsWriter, text: &str) -> Result<()> {
    let responses = match Envelope::decode(text) {
        Ok(request) => {
            log::debug!(
                "[MockBackend] <- '{}' {}",
                request.kind,
                request.correlation_id.as_deref().unwrap_or("-")
            );
            respond(&request)
        }
        Err(e) => {
            log::warn!("[MockBackend] Invalid frame: {}", e);
            vec![Envelope::error("invalid_json", "Invalid JSON format")]
        }
    };
    for response in responses {
        writer.send_text(&response.encode()?).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(kind: &str) -> Envelope {
        Envelope::new(kind)
            .with_correlation_id("c-1")
            .with_session_id("s-1")
    }

    #[test]
    fn test_chat_reply_keeps_correlation() {
        let replies = respond(&request("chat-message").with_field("text", "hi"));
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].kind, MessageType::ChatMessage);
        assert_eq!(replies[0].correlation_id.as_deref(), Some("c-1"));
        assert_eq!(replies[0].session_id, "s-1");
        assert_eq!(replies[0].str_field("response"), Some("AI Box processed: hi"));
    }

    #[test]
    fn test_agent_task_emits_progress_first() {
        let replies = respond(&request("agent-task").with_field("task", "summarize"));
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].kind, MessageType::AgentProgress);
        assert_eq!(replies[0].correlation_id, None);
        assert_eq!(replies[0].session_id, "s-1");
        assert_eq!(replies[1].correlation_id.as_deref(), Some("c-1"));
        assert_eq!(replies[1].str_field("status"), Some("completed"));
    }

    #[test]
    fn test_search_and_status() {
        let search = respond(&request("document-search").with_field("query", "rust"));
        assert!(search[0].field("results").is_some_and(serde_json::Value::is_array));

        let status = respond(&request("status-request"));
        assert_eq!(status[0].str_field("status"), Some("healthy"));
    }

    #[test]
    fn test_unknown_type_is_error() {
        let replies = respond(&request("launch-rockets"));
        assert_eq!(replies[0].kind, MessageType::Error);
        assert_eq!(replies[0].str_field("code"), Some("unknown_type"));
        assert_eq!(replies[0].correlation_id.as_deref(), Some("c-1"));
    }

    #[tokio::test]
    async fn test_serves_over_websocket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(serve(listener, async move {
            let _ = stop_rx.await;
        }));

        let (mut writer, mut reader) = ws::connect(&format!("ws://{addr}/ws")).await.unwrap();
        writer
            .send_text(&request("status-request").encode().unwrap())
            .await
            .unwrap();
        let Some(Ok(WsMessage::Text(text))) = reader.recv().await else {
            panic!("expected a text frame");
        };
        let reply = Envelope::decode(&text).unwrap();
        assert_eq!(reply.kind, MessageType::StatusRequest);
        assert_eq!(reply.correlation_id.as_deref(), Some("c-1"));

        writer.send_text("not json").await.unwrap();
        let Some(Ok(WsMessage::Text(text))) = reader.recv().await else {
            panic!("expected a text frame");
        };
        assert_eq!(Envelope::decode(&text).unwrap().kind, MessageType::Error);

        stop_tx.send(()).unwrap();
        server.await.unwrap().unwrap();
    }
}
