//! Server configuration.
//!
//! Configuration is layered:
//! - Built-in defaults
//! - The first TOML file found in the search path
//! - Environment variables (`PARLEY_*`, nested keys separated by `__`)

use anyhow::{Context, Result};
use config::{Environment, File, FileFormat};
use parley_core::{Backoff, HubSettings};
use parley_protocol::codec::LENGTH_PREFIX_SIZE;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Files searched, in order, by [`Config::load`].
const CONFIG_PATHS: [&str; 3] = [
    "parley.toml",
    "/etc/parley/parley.toml",
    "~/.config/parley/parley.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address the HTTP listener binds to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port of the HTTP listener.
    #[serde(default = "default_port")]
    pub port: u16,

    /// WebSocket endpoint and frame limits.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Keepalive, handshake and presence timing.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Ingest pipeline configuration.
    #[serde(default)]
    pub ingest: IngestConfig,

    /// Bus and relay configuration.
    #[serde(default)]
    pub relay: RelayConfig,

    /// Prometheus exporter.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Static access tokens.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Static rooms and channels.
    #[serde(default)]
    pub directory: DirectoryConfig,
}

/// Client-facing transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// HTTP path upgraded to WebSocket.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Largest frame accepted from a client, in bytes.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    /// Largest WebSocket message accepted, in bytes. One message may carry
    /// several frames; never below one full frame.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Frames queued per connection before a write counts as failed.
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
}

/// Resource limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Open sockets allowed at once, authenticated or not.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Keepalive, handshake and presence timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Heartbeat interval advertised to clients, in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Time a client has to send its `connect` frame, in milliseconds.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,

    /// Age after which a presence record nobody refreshed is dropped, in
    /// milliseconds.
    #[serde(default = "default_presence_ttl")]
    pub presence_ttl_ms: u64,
}

/// Ingest pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Bound on the wait for declared media parts, in milliseconds.
    #[serde(default = "default_reconcile_timeout")]
    pub reconcile_timeout_ms: u64,

    /// Age after which unclaimed attachment events are dropped, in milliseconds.
    #[serde(default = "default_stale_attachment")]
    pub stale_attachment_ms: u64,
}

/// Bus and relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Per-topic buffer of the in-process bus.
    #[serde(default = "default_bus_capacity")]
    pub bus_capacity: usize,

    /// First delay before resubscribing to a lost topic, in milliseconds.
    #[serde(default = "default_resubscribe_initial")]
    pub resubscribe_initial_ms: u64,

    /// Upper bound on the resubscribe delay, in milliseconds.
    #[serde(default = "default_resubscribe_max")]
    pub resubscribe_max_ms: u64,

    /// Period of the retry of envelopes whose publish failed, in milliseconds.
    #[serde(default = "default_republish_interval")]
    pub republish_interval_ms: u64,
}

/// Prometheus exporter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether the exporter is installed.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Port of the scrape endpoint.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// Static authentication table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Access token to user id.
    #[serde(default)]
    pub tokens: HashMap<String, String>,
}

/// Static room and channel directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectoryConfig {
    /// Room id to members.
    #[serde(default)]
    pub rooms: HashMap<String, Vec<String>>,

    /// Channel id to members and admins.
    #[serde(default)]
    pub channels: HashMap<String, ChannelConfig>,
}

/// Members and admins of one channel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Users receiving the channel.
    #[serde(default)]
    pub members: Vec<String>,

    /// Users allowed to post.
    #[serde(default)]
    pub admins: Vec<String>,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_frame_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_max_message_size() -> usize {
    1024 * 1024 // 1 MB
}

fn default_outbound_queue() -> usize {
    256
}

fn default_max_connections() -> usize {
    100_000
}

fn default_heartbeat_interval() -> u64 {
    30_000 // 30 seconds
}

fn default_handshake_timeout() -> u64 {
    10_000
}

fn default_presence_ttl() -> u64 {
    90_000
}

fn default_reconcile_timeout() -> u64 {
    30_000
}

fn default_stale_attachment() -> u64 {
    300_000 // 5 minutes
}

fn default_bus_capacity() -> usize {
    1024
}

fn default_resubscribe_initial() -> u64 {
    100
}

fn default_resubscribe_max() -> u64 {
    10_000
}

fn default_republish_interval() -> u64 {
    5_000
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            ingest: IngestConfig::default(),
            relay: RelayConfig::default(),
            metrics: MetricsConfig::default(),
            auth: AuthConfig::default(),
            directory: DirectoryConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
            max_frame_size: default_max_frame_size(),
            max_message_size: default_max_message_size(),
            outbound_queue: default_outbound_queue(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            handshake_timeout_ms: default_handshake_timeout(),
            presence_ttl_ms: default_presence_ttl(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            reconcile_timeout_ms: default_reconcile_timeout(),
            stale_attachment_ms: default_stale_attachment(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bus_capacity: default_bus_capacity(),
            resubscribe_initial_ms: default_resubscribe_initial(),
            resubscribe_max_ms: default_resubscribe_max(),
            republish_interval_ms: default_republish_interval(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from the default search path and the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// environment override has the wrong type.
    pub fn load() -> Result<Self> {
        Self::load_from(&CONFIG_PATHS)
    }

    /// Load configuration from the first existing file in `paths`, with
    /// `PARLEY_*` environment overrides on top.
    ///
    /// # Errors
    ///
    /// Returns an error if the sources cannot be merged or deserialized.
    pub fn load_from(paths: &[&str]) -> Result<Self> {
        let mut builder = config::Config::builder();

        for path in paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                builder = builder.add_source(File::new(expanded.as_ref(), FileFormat::Toml));
                break;
            }
        }

        let config = builder
            .add_source(
                Environment::with_prefix("PARLEY")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Failed to parse configuration")?;

        Ok(config)
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

    /// Largest WebSocket message the upgrade accepts.
    #[must_use]
    pub fn websocket_message_limit(&self) -> usize {
        self.transport
            .max_message_size
            .max(self.transport.max_frame_size + LENGTH_PREFIX_SIZE)
    }

    /// Hub tunables derived from this configuration.
    ///
    /// The sweeper runs often enough to refresh presence well inside its
    /// TTL and to drop stale attachments near their deadline.
    #[must_use]
    pub fn hub_settings(&self) -> HubSettings {
        let defaults = HubSettings::default();
        let presence_ttl = Duration::from_millis(self.heartbeat.presence_ttl_ms);
        let sweep_interval = Duration::from_millis(self.ingest.stale_attachment_ms / 5)
            .min(presence_ttl / 3)
            .max(Duration::from_secs(1));
        HubSettings {
            outbound_queue: self.transport.outbound_queue,
            max_frame_size: self.transport.max_frame_size,
            handshake_timeout: Duration::from_millis(self.heartbeat.handshake_timeout_ms),
            heartbeat_interval: Duration::from_millis(self.heartbeat.interval_ms),
            reconcile_timeout: Duration::from_millis(self.ingest.reconcile_timeout_ms),
            stale_attachment_age: Duration::from_millis(self.ingest.stale_attachment_ms),
            sweep_interval,
            presence_ttl,
            republish_interval: Duration::from_millis(self.relay.republish_interval_ms)
                .max(Duration::from_millis(100)),
            resubscribe: Backoff {
                initial: Duration::from_millis(self.relay.resubscribe_initial_ms),
                max: Duration::from_millis(self.relay.resubscribe_max_ms),
            },
            ..defaults
        }
    }
}
