//! `aibox-relay request`: one correlated request through an edge.
//!
//! Acts as the client tier: a relay dialing `<edge url>/<session id>`,
//! issuing a single request and printing unsolicited envelopes (welcome,
//! progress) to the log while it waits.

// Rust guideline compliant 2026-02

use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;

use crate::config::RelayConfig;
use crate::envelope::{Envelope, MessageType};
use crate::relay::{Relay, Subscription};
use crate::transport::WsConnector;

/// What to send.
#[derive(Debug, Clone)]
pub struct RequestArgs {
    /// Envelope `type`.
    pub message_type: String,
    /// Payload fields.
    pub fields: Vec<(String, Value)>,
    /// Correlation timeout.
    pub timeout: Duration,
}

/// Parse a `key=value` flag. The value is taken as JSON when it parses,
/// otherwise as a plain string.
pub fn parse_field(raw: &str) -> Result<(String, Value)> {
    let (key, value) = raw
        .split_once('=')
        .with_context(|| format!("Expected key=value, got '{raw}'"))?;
    if key.is_empty() {
        anyhow::bail!("Empty key in '{raw}'");
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

/// Envelope described by `args`.
pub fn build_envelope(args: &RequestArgs) -> Envelope {
    args.fields.iter().fold(
        Envelope::new(MessageType::from(args.message_type.as_str())),
        |envelope, (key, value)| envelope.with_field(key.clone(), value.clone()),
    )
}

/// Connect, send one request, wait for its reply and disconnect.
///
/// An `error` envelope from the edge is returned as `Ok`; the caller decides
/// how to present it.
pub async fn run(config: &RelayConfig, args: &RequestArgs) -> Result<Envelope> {
    let session_id = uuid::Uuid::new_v4().to_string();
    let url = format!("{}/{}", config.url.trim_end_matches('/'), session_id);

    let relay = Relay::builder(WsConnector::new(&url))
        .label("client")
        .session_id(&session_id)
        .config(config)
        .build();
    relay.on(Subscription::Any, |envelope: &Envelope| {
        log::info!(
            "[Client] '{}' {}",
            envelope.kind,
            serde_json::to_string(&envelope.payload())?
        );
        Ok(())
    });

    let reply = relay.request(build_envelope(args), args.timeout).await;
    relay.disconnect().await;
    reply.with_context(|| format!("Request to {url} failed"))
}
