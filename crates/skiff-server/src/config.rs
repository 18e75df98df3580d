//! Server configuration.
//!
//! Sources, later ones overriding earlier ones:
//! - built-in defaults
//! - a TOML file: the `--config` path, or the first of [`CONFIG_PATHS`]
//!   that exists
//! - environment variables `SKIFF_*`, with `__` between section and key
//!   (`SKIFF_LIMITS__CONSUMER_CAPACITY=4096`)
//! - `--listen_at` on the command line

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use skiff_core::BrokerConfig;
use skiff_protocol::pool::DEFAULT_CLASSES;
use skiff_protocol::{BytePool, MessageCodec};
use skiff_transport::{GatewayConfig, SessionConfig};

/// Config files looked up when no path is given.
pub const CONFIG_PATHS: [&str; 3] = ["skiff.toml", "/etc/skiff/skiff.toml", "~/.config/skiff/skiff.toml"];

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "SKIFF";

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Broker (TCP) port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// WebSocket gateway port; 0 disables the gateway.
    #[serde(default = "default_ws_port")]
    pub ws_port: u16,

    /// HTTP admin port; 0 disables the admin endpoint.
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Keepalive and handshake timing.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Topic and gateway delivery.
    #[serde(default)]
    pub delivery: DeliveryConfig,

    /// Read buffer pooling.
    #[serde(default)]
    pub pool: PoolConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Largest accepted message payload in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Buffer capacity of queue backlogs and topic consumers.
    #[serde(default = "default_consumer_capacity")]
    pub consumer_capacity: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Silence in milliseconds after which a subscriber gets a `NOOP`.
    #[serde(default = "default_idle_interval")]
    pub idle_interval_ms: u64,

    /// Bound in milliseconds on the client's handshake.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,

    /// How long shutdown waits for connections, in milliseconds.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,
}

/// Delivery configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// How long a topic publish retries slow subscribers, in milliseconds.
    #[serde(default = "default_delivery_timeout")]
    pub timeout_ms: u64,

    /// Pause between topic retry rounds, in milliseconds.
    #[serde(default = "default_retry_interval")]
    pub retry_interval_ms: u64,

    /// Spacing of WebSocket delivery tries, in milliseconds.
    #[serde(default = "default_ws_retry_tick")]
    pub ws_retry_tick_ms: u64,

    /// WebSocket delivery tries before a frame is dropped.
    #[serde(default = "default_ws_tries")]
    pub ws_tries: usize,
}

/// Buffer pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Reuse read buffers through a size-classed pool.
    #[serde(default)]
    pub enabled: bool,

    /// Buffers kept per size class.
    #[serde(default = "default_pool_per_class")]
    pub per_class: usize,
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

    /// How often broker counters are sampled, in milliseconds.
    #[serde(default = "default_sample_interval")]
    pub sample_interval_ms: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    7070
}

fn default_ws_port() -> u16 {
    7071
}

fn default_http_port() -> u16 {
    7072
}

fn default_true() -> bool {
    true
}

fn default_max_message_size() -> usize {
    64 * 1024 * 1024
}

fn default_consumer_capacity() -> usize {
    1024
}

fn default_idle_interval() -> u64 {
    10_000
}

fn default_handshake_timeout() -> u64 {
    5_000
}

fn default_shutdown_grace() -> u64 {
    1_000
}

fn default_delivery_timeout() -> u64 {
    1_000
}

fn default_retry_interval() -> u64 {
    10
}

fn default_ws_retry_tick() -> u64 {
    100
}

fn default_ws_tries() -> usize {
    2
}

fn default_pool_per_class() -> usize {
    64
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_sample_interval() -> u64 {
    1_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            ws_port: default_ws_port(),
            http_port: default_http_port(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            delivery: DeliveryConfig::default(),
            pool: PoolConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
            consumer_capacity: default_consumer_capacity(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            idle_interval_ms: default_idle_interval(),
            handshake_timeout_ms: default_handshake_timeout(),
            shutdown_grace_ms: default_shutdown_grace(),
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_delivery_timeout(),
            retry_interval_ms: default_retry_interval(),
            ws_retry_tick_ms: default_ws_retry_tick(),
            ws_tries: default_ws_tries(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            per_class: default_pool_per_class(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
            sample_interval_ms: default_sample_interval(),
        }
    }
}

/// First existing file of [`CONFIG_PATHS`], with `~` expanded.
#[must_use]
pub fn find_config_file() -> Option<PathBuf> {
    CONFIG_PATHS
        .iter()
        .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
        .find(|path| path.exists())
}

impl Config {
    /// Load configuration from defaults, a config file and the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if an explicit `path` is missing, or if a file or an
    /// environment variable cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        use ::config::{Config as Layers, Environment, File, FileFormat};

        let mut builder = Layers::builder();
        match path {
            Some(path) => {
                let expanded = shellexpand::tilde(&path.to_string_lossy()).into_owned();
                builder = builder.add_source(File::new(&expanded, FileFormat::Toml).required(true));
            }
            None => {
                if let Some(found) = find_config_file() {
                    builder = builder.add_source(File::new(&found.to_string_lossy(), FileFormat::Toml).required(false));
                }
            }
        }

        let layers = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to load configuration")?;

        layers.try_deserialize().context("Invalid configuration")
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

    /// Apply a `--listen_at` value: `:PORT`, `HOST:PORT` or `PORT`.
    ///
    /// # Errors
    ///
    /// Returns an error if the port is not a number.
    pub fn apply_listen_at(&mut self, listen_at: &str) -> Result<()> {
        let (host, port) = match listen_at.rsplit_once(':') {
            Some((host, port)) => (host, port),
            None => ("", listen_at),
        };
        self.port = port
            .parse()
            .with_context(|| format!("Invalid port in listen address: {listen_at}"))?;
        if !host.is_empty() {
            self.host = host.trim_matches(|c| c == '[' || c == ']').to_string();
        }
        Ok(())
    }

    fn addr(&self, port: u16) -> Result<SocketAddr> {
        let addr = format!("{}:{}", self.host, port);
        match addr.parse() {
            Ok(addr) => Ok(addr),
            Err(_) => match self.host.parse::<std::net::IpAddr>() {
                Ok(ip) => Ok(SocketAddr::new(ip, port)),
                Err(e) => bail!("Invalid host {:?}: {e}", self.host),
            },
        }
    }

    /// Broker listen address.
    ///
    /// # Errors
    ///
    /// Returns an error if the host is not an IP address.
    pub fn broker_addr(&self) -> Result<SocketAddr> {
        self.addr(self.port)
    }

    /// WebSocket listen address, if enabled.
    ///
    /// # Errors
    ///
    /// Returns an error if the host is not an IP address.
    pub fn ws_addr(&self) -> Result<Option<SocketAddr>> {
        if self.ws_port == 0 {
            return Ok(None);
        }
        self.addr(self.ws_port).map(Some)
    }

    /// HTTP admin listen address, if enabled.
    ///
    /// # Errors
    ///
    /// Returns an error if the host is not an IP address.
    pub fn http_addr(&self) -> Result<Option<SocketAddr>> {
        if self.http_port == 0 {
            return Ok(None);
        }
        self.addr(self.http_port).map(Some)
    }

    /// Registry settings.
    #[must_use]
    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            consumer_capacity: self.limits.consumer_capacity.max(1),
            delivery_timeout: Duration::from_millis(self.delivery.timeout_ms),
            retry_interval: Duration::from_millis(self.delivery.retry_interval_ms),
        }
    }

    /// Codec for incoming broker connections.
    #[must_use]
    pub fn codec(&self) -> MessageCodec {
        let codec = MessageCodec::new().with_max_read(self.limits.max_message_size);
        if self.pool.enabled {
            codec.with_allocator(Arc::new(BytePool::with_classes(&DEFAULT_CLASSES, self.pool.per_class)))
        } else {
            codec
        }
    }

    /// TCP session settings.
    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            handshake_timeout: Duration::from_millis(self.heartbeat.handshake_timeout_ms),
            idle_interval: Duration::from_millis(self.heartbeat.idle_interval_ms),
            shutdown_grace: Duration::from_millis(self.heartbeat.shutdown_grace_ms),
            codec: self.codec(),
        }
    }

    /// WebSocket gateway settings.
    #[must_use]
    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            retry_tick: Duration::from_millis(self.delivery.ws_retry_tick_ms),
            tries: self.delivery.ws_tries.max(1),
            max_message_size: self.limits.max_message_size,
            shutdown_grace: Duration::from_millis(self.heartbeat.shutdown_grace_ms),
        }
    }
}
