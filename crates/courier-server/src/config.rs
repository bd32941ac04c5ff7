//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (COURIER_*, nested keys joined with `__`)
//! - TOML configuration file

use anyhow::{Context, Result};
use courier_core::{ClientConfig, HubConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::auth::TokenEntry;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Liveness configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Hub configuration.
    #[serde(default)]
    pub hub: HubSection,

    /// Presence store configuration.
    #[serde(default)]
    pub presence: PresenceConfig,

    /// Accepted bearer tokens.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum inbound message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Per-connection outbound queue capacity in frames.
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue_capacity: usize,

    /// Hub event channel capacity.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

/// Liveness configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Ping interval in milliseconds.
    #[serde(default = "default_ping_interval")]
    pub ping_interval_ms: u64,

    /// Read deadline in milliseconds.
    #[serde(default = "default_pong_wait")]
    pub pong_wait_ms: u64,

    /// Write timeout in milliseconds.
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,
}

/// Hub sweep configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubSection {
    /// Liveness sweep interval in milliseconds.
    #[serde(default = "default_hub_cleanup_interval")]
    pub cleanup_interval_ms: u64,

    /// Idle time after which the sweep removes a device, in milliseconds.
    #[serde(default = "default_hub_inactive_threshold")]
    pub inactive_threshold_ms: u64,
}

/// Which store backs presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceBackend {
    /// In-process store. Lost on restart.
    Memory,
    /// Redis server at `redis_url`. Needs the `redis` feature.
    Redis,
    /// No presence: offline messages are dropped.
    Disabled,
}

/// Presence store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    #[serde(default = "default_presence_backend")]
    pub backend: PresenceBackend,

    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Interval of the inactive-user cleanup task in milliseconds.
    #[serde(default = "default_presence_cleanup_interval")]
    pub cleanup_interval_ms: u64,

    /// Users not seen for this long are marked offline, in milliseconds.
    #[serde(default = "default_presence_inactive_threshold")]
    pub inactive_threshold_ms: u64,
}

/// Authentication configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Statically provisioned tokens.
    #[serde(default)]
    pub tokens: Vec<TokenEntry>,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,

    /// How often hub statistics are exported, in milliseconds.
    #[serde(default = "default_metrics_interval")]
    pub export_interval_ms: u64,
}

// Default value functions
fn default_host() -> String {
    std::env::var("COURIER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("COURIER_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_message_size() -> usize {
    512 * 1024 // 512 KB
}

fn default_outbound_queue() -> usize {
    256
}

fn default_event_capacity() -> usize {
    1000
}

fn default_ping_interval() -> u64 {
    54_000 // 54 seconds
}

fn default_pong_wait() -> u64 {
    60_000 // 60 seconds
}

fn default_write_timeout() -> u64 {
    10_000 // 10 seconds
}

fn default_hub_cleanup_interval() -> u64 {
    30_000 // 30 seconds
}

fn default_hub_inactive_threshold() -> u64 {
    300_000 // 5 minutes
}

fn default_presence_backend() -> PresenceBackend {
    PresenceBackend::Memory
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_presence_cleanup_interval() -> u64 {
    300_000 // 5 minutes
}

fn default_presence_inactive_threshold() -> u64 {
    600_000 // 10 minutes
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_metrics_interval() -> u64 {
    10_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            hub: HubSection::default(),
            presence: PresenceConfig::default(),
            auth: AuthConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
            outbound_queue_capacity: default_outbound_queue(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: default_ping_interval(),
            pong_wait_ms: default_pong_wait(),
            write_timeout_ms: default_write_timeout(),
        }
    }
}

impl Default for HubSection {
    fn default() -> Self {
        Self {
            cleanup_interval_ms: default_hub_cleanup_interval(),
            inactive_threshold_ms: default_hub_inactive_threshold(),
        }
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            backend: default_presence_backend(),
            redis_url: default_redis_url(),
            cleanup_interval_ms: default_presence_cleanup_interval(),
            inactive_threshold_ms: default_presence_inactive_threshold(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
            export_interval_ms: default_metrics_interval(),
        }
    }
}

impl Config {
    /// Load configuration from the first config file found, with
    /// `COURIER_*` environment variables layered on top.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "courier.toml",
            "/etc/courier/courier.toml",
            "~/.config/courier/courier.toml",
        ];

        let mut builder = config::Config::builder();
        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                builder = builder.add_source(config::File::from(Path::new(expanded.as_ref())));
                break;
            }
        }

        builder
            .add_source(
                config::Environment::with_prefix("COURIER")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to assemble configuration")?
            .try_deserialize()
            .context("Failed to parse configuration")
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Connection worker settings.
    #[must_use]
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            outbound_capacity: self.limits.outbound_queue_capacity,
            ping_interval: Duration::from_millis(self.heartbeat.ping_interval_ms),
            pong_wait: Duration::from_millis(self.heartbeat.pong_wait_ms),
            write_timeout: Duration::from_millis(self.heartbeat.write_timeout_ms),
        }
    }

    /// Hub settings.
    #[must_use]
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            event_capacity: self.limits.event_capacity,
            cleanup_interval: Duration::from_millis(self.hub.cleanup_interval_ms),
            inactive_threshold: Duration::from_millis(self.hub.inactive_threshold_ms),
        }
    }
}
