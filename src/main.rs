//! AI Box relay CLI.
//!
//! Runs the edge process, the mock backend, or a one-shot client request.
//! See the `aibox_relay` library for the relay itself.

// Rust guideline compliant 2026-02

use std::time::Duration;

use aibox_relay::commands::request::{self, RequestArgs};
use aibox_relay::{edge, mock_backend, Config, MessageType};
use anyhow::Result;
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;

/// Global allocator.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "aibox-relay")]
#[command(version)]
#[command(about = "Reconnecting request/response relay between browser, edge and backend")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the edge process
    Edge {
        /// Address to listen on for browser connections
        #[arg(long)]
        listen: Option<String>,
        /// Backend service WebSocket URL
        #[arg(long)]
        backend_url: Option<String>,
    },
    /// Run the mock backend service
    MockBackend {
        /// Address to listen on
        #[arg(long)]
        listen: Option<String>,
    },
    /// Send one correlated request through an edge and print the reply
    Request {
        /// Envelope type (e.g. chat-message, agent-task)
        #[arg(long = "type", default_value = "chat-message")]
        message_type: String,
        /// Payload field as key=value (value parsed as JSON when possible)
        #[arg(long = "field", value_parser = request::parse_field)]
        fields: Vec<(String, serde_json::Value)>,
        /// Request timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Edge WebSocket URL (without the session id)
        #[arg(long)]
        edge_url: Option<String>,
    },
    /// Print the effective configuration
    Config,
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    log::info!("Ctrl-C received, shutting down");
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();
    let mut config = Config::load()?;

    match cli.command {
        Commands::Edge {
            listen,
            backend_url,
        } => {
            if let Some(listen) = listen {
                config.edge.listen = listen;
            }
            if let Some(url) = backend_url {
                config.edge.backend.url = url;
            }
            log::info!("Starting aibox-relay edge v{}", env!("CARGO_PKG_VERSION"));
            edge::run(&config.edge, shutdown_signal()).await?;
        }
        Commands::MockBackend { listen } => {
            if let Some(listen) = listen {
                config.mock_backend.listen = listen;
            }
            mock_backend::run(&config.mock_backend, shutdown_signal()).await?;
        }
        Commands::Request {
            message_type,
            fields,
            timeout_ms,
            edge_url,
        } => {
            if let Some(url) = edge_url {
                config.client.url = url;
            }
            let args = RequestArgs {
                message_type,
                fields,
                timeout: timeout_ms
                    .map_or_else(|| config.client.request_timeout(), Duration::from_millis),
            };
            let reply = request::run(&config.client, &args).await?;
            println!("{}", serde_json::to_string_pretty(&reply)?);
            if reply.kind == MessageType::Error {
                anyhow::bail!(
                    "Edge replied with error: {}",
                    reply.str_field("message").unwrap_or("unknown")
                );
            }
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
