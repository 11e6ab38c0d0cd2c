//! Configuration loading.
//!
//! Layering, lowest to highest: built-in defaults, the JSON config file,
//! `AIBOX_*` environment variables, then CLI flags (applied by `main`).
//! Every field is optional in the file; missing ones keep their defaults.

// Rust guideline compliant 2026-02

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_BACKEND_URL, DEFAULT_BASE_INTERVAL, DEFAULT_EDGE_LISTEN, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_MAX_INTERVAL, DEFAULT_MOCK_BACKEND_LISTEN, DEFAULT_QUEUE_CAPACITY,
    DEFAULT_REQUEST_TIMEOUT, EDGE_WS_PATH, SESSION_BASE_INTERVAL, SESSION_MAX_ATTEMPTS,
};
use crate::relay::{OverflowPolicy, ReconnectPolicy};

/// Settings for one relay tier.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct RelayConfig {
    /// WebSocket URL to dial. Unused by accepted (edge session) relays.
    pub url: String,
    /// Reconnect backoff increment in milliseconds.
    pub base_interval_ms: u64,
    /// Reconnect delay ceiling in milliseconds.
    pub max_interval_ms: u64,
    /// Reconnect attempts before giving up.
    pub max_attempts: u32,
    /// Default correlated request timeout in milliseconds.
    pub request_timeout_ms: u64,
    /// Outbound queue bound.
    pub queue_capacity: usize,
    /// Behavior when the queue is full.
    pub overflow: OverflowPolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            base_interval_ms: DEFAULT_BASE_INTERVAL.as_millis() as u64,
            max_interval_ms: DEFAULT_MAX_INTERVAL.as_millis() as u64,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT.as_millis() as u64,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            overflow: OverflowPolicy::default(),
        }
    }
}

impl RelayConfig {
    /// Defaults pointed at `url`.
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Reconnection policy for this tier.
    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_interval: Duration::from_millis(self.base_interval_ms),
            max_interval: Duration::from_millis(self.max_interval_ms),
            max_attempts: self.max_attempts,
        }
    }

    /// Default request timeout for this tier.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Edge process settings.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct EdgeConfig {
    /// Address the browser-facing listener binds.
    pub listen: String,
    /// Relay to the backend service.
    pub backend: RelayConfig,
    /// Per-session relays toward browsers. While a browser is away its relay
    /// polls for a re-attach with this policy, then the session is reaped.
    pub session: RelayConfig,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_EDGE_LISTEN.to_string(),
            backend: RelayConfig::with_url(DEFAULT_BACKEND_URL),
            session: RelayConfig {
                base_interval_ms: SESSION_BASE_INTERVAL.as_millis() as u64,
                max_attempts: SESSION_MAX_ATTEMPTS,
                ..RelayConfig::default()
            },
        }
    }
}

/// Mock backend settings.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct MockBackendConfig {
    /// Address the mock backend binds.
    pub listen: String,
}

impl Default for MockBackendConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_MOCK_BACKEND_LISTEN.to_string(),
        }
    }
}

/// Configuration for every `aibox-relay` subcommand.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Client-tier relay (the `request` subcommand), dialing the edge.
    pub client: RelayConfig,
    /// Edge process.
    pub edge: EdgeConfig,
    /// Mock backend.
    pub mock_backend: MockBackendConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            client: RelayConfig::with_url(format!("ws://{DEFAULT_EDGE_LISTEN}{EDGE_WS_PATH}")),
            edge: EdgeConfig::default(),
            mock_backend: MockBackendConfig::default(),
        }
    }
}

impl Config {
    /// Path of the config file.
    ///
    /// `AIBOX_RELAY_CONFIG` wins; otherwise the platform config directory
    /// (e.g. `~/.config/aibox-relay/config.json` on Linux).
    pub fn config_path() -> Result<PathBuf> {
        if let Ok(path) = std::env::var("AIBOX_RELAY_CONFIG") {
            return Ok(PathBuf::from(path));
        }
        Ok(dirs::config_dir()
            .context("Could not determine config directory")?
            .join("aibox-relay")
            .join("config.json"))
    }

    /// Load from the config file (if any), then apply environment overrides.
    ///
    /// A missing file means defaults. A file that exists but does not parse
    /// is an error.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = if path.exists() {
            Self::load_from_file(&path)?
        } else {
            log::debug!("[Config] No config file at {}, using defaults", path.display());
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse one config file.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config = serde_json::from_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        log::info!("[Config] Loaded {}", path.display());
        Ok(config)
    }

    /// Apply `AIBOX_*` variables from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(listen) = var("AIBOX_EDGE_LISTEN") {
            self.edge.listen = listen;
        }

        if let Some(url) = var("AIBOX_BACKEND_URL") {
            self.edge.backend.url = url;
        }

        if let Some(url) = var("AIBOX_EDGE_URL") {
            self.client.url = url;
        }

        if let Some(max_attempts) = var("AIBOX_MAX_ATTEMPTS") {
            match max_attempts.parse::<u32>() {
                Ok(max) => {
                    self.client.max_attempts = max;
                    self.edge.backend.max_attempts = max;
                }
                Err(e) => log::warn!("[Config] Ignoring AIBOX_MAX_ATTEMPTS={max_attempts}: {e}"),
            }
        }

        if let Some(timeout) = var("AIBOX_REQUEST_TIMEOUT_MS") {
            match timeout.parse::<u64>() {
                Ok(ms) => {
                    self.client.request_timeout_ms = ms;
                    self.edge.backend.request_timeout_ms = ms;
                }
                Err(e) => log::warn!("[Config] Ignoring AIBOX_REQUEST_TIMEOUT_MS={timeout}: {e}"),
            }
        }
    }
}
