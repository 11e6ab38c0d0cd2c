//! WebSocket plumbing over `tokio-tungstenite`.
//!
//! Dialed sockets (client → edge, edge → backend) and accepted ones
//! (browser → edge) come out as the same [`WsWriter`]/[`WsReader`] pair, so a
//! relay never knows which side opened its connection. Frames are mapped to
//! the crate's own [`WsMessage`]; raw frames never surface.

// Rust guideline compliant 2026-02

use anyhow::{Context, Result};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::constants::WS_CONNECT_TIMEOUT;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Close code reported when the peer's close frame carried none.
const NO_STATUS_CODE: u16 = 1005;

/// One inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsMessage {
    /// UTF-8 text frame.
    Text(String),
    /// Binary frame.
    Binary(Vec<u8>),
    /// Ping with payload.
    Ping(Vec<u8>),
    /// Pong with payload.
    Pong(Vec<u8>),
    /// Close frame.
    Close {
        /// Close code (1005 when absent).
        code: u16,
        /// Close reason, possibly empty.
        reason: String,
    },
}

impl WsMessage {
    fn from_tungstenite(message: Message) -> Option<Self> {
        Some(match message {
            Message::Text(text) => Self::Text(text),
            Message::Binary(data) => Self::Binary(data),
            Message::Ping(data) => Self::Ping(data),
            Message::Pong(data) => Self::Pong(data),
            Message::Close(frame) => match frame {
                Some(frame) => Self::Close {
                    code: frame.code.into(),
                    reason: frame.reason.into_owned(),
                },
                None => Self::Close {
                    code: NO_STATUS_CODE,
                    reason: String::new(),
                },
            },
            Message::Frame(_) => return None,
        })
    }
}

/// Outbound half of a socket.
#[derive(Debug)]
pub struct WsWriter {
    sink: SplitSink<Socket, Message>,
}

impl WsWriter {
    /// Send one text frame.
    pub async fn send_text(&mut self, text: &str) -> Result<()> {
        self.sink
            .send(Message::Text(text.to_owned()))
            .await
            .context("WebSocket text send failed")
    }

    /// Answer a ping.
    pub async fn send_pong(&mut self, data: Vec<u8>) -> Result<()> {
        self.sink
            .send(Message::Pong(data))
            .await
            .context("WebSocket pong failed")
    }

    /// Send a close frame and shut the sink.
    pub async fn close(&mut self) -> Result<()> {
        self.sink.close().await.context("WebSocket close failed")
    }
}

/// Inbound half of a socket.
#[derive(Debug)]
pub struct WsReader {
    stream: SplitStream<Socket>,
}

impl WsReader {
    /// Next frame, or `None` once the socket is gone. Cancel-safe.
    pub async fn recv(&mut self) -> Option<Result<WsMessage>> {
        while let Some(item) = self.stream.next().await {
            match item {
                Ok(message) => {
                    if let Some(message) = WsMessage::from_tungstenite(message) {
                        return Some(Ok(message));
                    }
                }
                Err(e) => return Some(Err(anyhow::Error::new(e).context("WebSocket read failed"))),
            }
        }
        None
    }
}

fn split(socket: Socket) -> (WsWriter, WsReader) {
    let (sink, stream) = socket.split();
    (WsWriter { sink }, WsReader { stream })
}

/// Dial `url`, giving up after [`WS_CONNECT_TIMEOUT`].
pub async fn connect(url: &str) -> Result<(WsWriter, WsReader)> {
    let request = url
        .into_client_request()
        .with_context(|| format!("Invalid WebSocket URL: {url}"))?;

    let (socket, _response) =
        tokio::time::timeout(WS_CONNECT_TIMEOUT, tokio_tungstenite::connect_async(request))
            .await
            .with_context(|| format!("Timed out connecting to {url}"))?
            .with_context(|| format!("WebSocket connect to {url} failed"))?;

    Ok(split(socket))
}

/// Server-side handshake on an accepted TCP stream.
///
/// Returns the request path (`/ws/<session>`) with the halves so the caller
/// can route the socket.
pub async fn accept(stream: TcpStream) -> Result<(String, WsWriter, WsReader)> {
    let mut path = String::new();
    let record_path = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        path = request.uri().path().to_owned();
        Ok(response)
    };

    let socket = tokio_tungstenite::accept_hdr_async(MaybeTlsStream::Plain(stream), record_path)
        .await
        .context("WebSocket handshake failed")?;

    let (writer, reader) = split(socket);
    Ok((path, writer, reader))
}

/// Rewrite `http(s)://` to `ws(s)://`; anything else is returned as is.
#[must_use]
pub fn http_to_ws_scheme(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_owned()
    }
}
