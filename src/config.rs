//! # Configuration Management
//!
//! Centralized configuration for servers and clients.
//!
//! Configuration is consumed once, at construction of a [`Server`](crate::service::server::Server)
//! or [`Client`](crate::service::client::Client). Nothing inside the transport depends on
//! how these values were produced or persisted.
//!
//! ## Configuration Sources
//! - TOML text via `from_toml()`
//! - Direct instantiation with defaults
//! - Environment overrides via `from_env()`

use crate::core::message::Transport;
use crate::error::{ProtocolError, Result};
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::Level;

/// Stream version byte written after every length prefix
pub const STREAM_VERSION: u8 = 5;

/// Max allowed frame size, length prefix excluded (16 MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Receive buffer for a single datagram
pub const DATAGRAM_BUFFER_SIZE: usize = 2048;

/// Default port for both transports
pub const DEFAULT_PORT: u16 = 13900;

/// Default association token length in characters
pub const TOKEN_LENGTH: usize = 128;

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    /// Server-specific configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Client-specific configuration
    #[serde(default)]
    pub client: ClientConfig,

    /// Settings shared by both ends of a connection
    #[serde(default)]
    pub transport: TransportConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl NetworkConfig {
    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("DUALNET_SERVER_ADDRESS") {
            config.server.address = addr;
        }

        if let Ok(addr) = std::env::var("DUALNET_CLIENT_ADDRESS") {
            config.client.address = addr;
        }

        if let Ok(port) = std::env::var("DUALNET_RELIABLE_PORT") {
            let port = port
                .parse::<u16>()
                .map_err(|e| ProtocolError::ConfigError(format!("DUALNET_RELIABLE_PORT: {e}")))?;
            config.server.reliable_port = port;
            config.client.reliable_port = port;
        }

        if let Ok(port) = std::env::var("DUALNET_BEST_EFFORT_PORT") {
            let port = port.parse::<u16>().map_err(|e| {
                ProtocolError::ConfigError(format!("DUALNET_BEST_EFFORT_PORT: {e}"))
            })?;
            config.server.best_effort_port = port;
            config.client.best_effort_port = port;
        }

        if let Ok(max) = std::env::var("DUALNET_MAX_CONNECTIONS") {
            if let Ok(val) = max.parse::<usize>() {
                config.server.max_connections = val;
            }
        }

        if let Ok(timeout) = std::env::var("DUALNET_CONNECTION_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.client.connection_timeout = Duration::from_millis(val);
            }
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.server.validate_with(&self.transport));
        errors.extend(self.client.validate());
        errors.extend(self.transport.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Server-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Service name, used in log lines
    pub service: String,

    /// Interface to bind both transports on (e.g. "0.0.0.0")
    pub address: String,

    /// TCP port of the reliable channel (0 picks a free port)
    pub reliable_port: u16,

    /// UDP port of the best-effort channel (0 picks a free port)
    pub best_effort_port: u16,

    /// Wrap the reliable channel in TLS
    pub tls: bool,

    /// Generate a throwaway self-signed certificate instead of loading one
    pub tls_self_signed: bool,

    /// PEM certificate chain, required when `tls` is on and `tls_self_signed` is off
    #[serde(default)]
    pub tls_cert_path: Option<String>,

    /// PKCS8 PEM private key matching `tls_cert_path`
    #[serde(default)]
    pub tls_key_path: Option<String>,

    /// Maximum number of concurrent sessions
    pub max_connections: usize,

    /// Reject every new connection while set
    pub blocking: bool,

    /// Association token length in characters
    pub token_length: usize,

    /// How long an issued token stays redeemable
    #[serde(with = "duration_serde")]
    pub token_ttl: Duration,

    /// Number of real UDP sockets bound to the best-effort port
    pub best_effort_sockets: usize,

    /// Per-peer inbound datagram queue bound (None = unbounded)
    #[serde(default)]
    pub best_effort_queue_limit: Option<usize>,

    /// Upper bound on the TLS handshake of an accepted connection
    #[serde(with = "duration_serde", default = "default_connection_timeout")]
    pub connection_timeout: Duration,
}

fn default_connection_timeout() -> Duration {
    timeout::CONNECT_TIMEOUT
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            service: String::from("dualnet"),
            address: String::from("0.0.0.0"),
            reliable_port: DEFAULT_PORT,
            best_effort_port: DEFAULT_PORT,
            tls: false,
            tls_self_signed: false,
            tls_cert_path: None,
            tls_key_path: None,
            max_connections: 10,
            blocking: false,
            token_length: TOKEN_LENGTH,
            token_ttl: timeout::TOKEN_TTL,
            best_effort_sockets: 1,
            best_effort_queue_limit: None,
            connection_timeout: timeout::CONNECT_TIMEOUT,
        }
    }
}

impl ServerConfig {
    /// [`validate`](Self::validate) plus checks that depend on the transport
    pub fn validate_with(&self, transport: &TransportConfig) -> Vec<String> {
        let mut errors = self.validate();
        // A token datagram carries the token plus well under 64 bytes of framing.
        if self.token_length + 64 > transport.max_datagram_frame() {
            errors.push(format!(
                "Token length {} does not fit a {}-byte datagram buffer",
                self.token_length, transport.datagram_buffer_size
            ));
        }
        errors
    }

    /// `address:reliable_port`
    pub fn reliable_addr(&self) -> String {
        format!("{}:{}", self.address, self.reliable_port)
    }

    /// `address:best_effort_port`
    pub fn best_effort_addr(&self) -> String {
        format!("{}:{}", self.address, self.best_effort_port)
    }

    /// Validate server configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.service.is_empty() {
            errors.push("Service name cannot be empty".to_string());
        }

        if self.address.is_empty() {
            errors.push("Server address cannot be empty".to_string());
        } else if self.reliable_addr().parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid server address format: '{}' (expected an IP such as '0.0.0.0')",
                self.address
            ));
        }

        if self.tls
            && !self.tls_self_signed
            && (self.tls_cert_path.is_none() || self.tls_key_path.is_none())
        {
            errors.push(
                "tls_cert_path and tls_key_path are required when TLS is enabled without self-signing"
                    .to_string(),
            );
        }

        if self.max_connections == 0 {
            errors.push("Max connections must be greater than 0".to_string());
        } else if self.max_connections > 100_000 {
            errors.push(format!(
                "Max connections very high: {} (ensure system resources can support this)",
                self.max_connections
            ));
        }

        if self.token_length < 16 {
            errors.push("Token length too short (minimum: 16)".to_string());
        } else if self.token_length > 1024 {
            errors.push("Token length too long (maximum: 1024)".to_string());
        }

        if self.token_ttl.as_millis() < 100 {
            errors.push("Token TTL too short (minimum: 100ms)".to_string());
        }

        if self.best_effort_sockets == 0 {
            errors.push("Best-effort socket count must be at least 1".to_string());
        } else if self.best_effort_sockets > 64 {
            errors.push("Best-effort socket count too high (maximum: 64)".to_string());
        }

        if self.best_effort_queue_limit == Some(0) {
            errors.push("Best-effort queue limit must be greater than 0 when set".to_string());
        }

        if self.connection_timeout.as_millis() < 100 {
            errors.push("Server connection timeout too short (minimum: 100ms)".to_string());
        } else if self.connection_timeout.as_secs() > 300 {
            errors.push("Server connection timeout too long (maximum: 300s)".to_string());
        }

        errors
    }
}

/// What the client does with messages sent while it is not connected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    /// Drop every message sent while disconnected
    Disabled,
    /// Cache messages of both transports
    Both,
    /// Cache reliable messages, drop best-effort ones
    #[default]
    ReliableOnly,
    /// Cache best-effort messages, drop reliable ones
    BestEffortOnly,
}

impl CacheMode {
    /// Whether a message on `transport` is kept for later delivery
    pub fn caches(self, transport: Transport) -> bool {
        match self {
            CacheMode::Disabled => false,
            CacheMode::Both => true,
            CacheMode::ReliableOnly => transport == Transport::Reliable,
            CacheMode::BestEffortOnly => transport == Transport::BestEffort,
        }
    }
}

/// Client-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Service name, used in log lines
    pub service: String,

    /// Server host name or IP
    pub address: String,

    /// Server TCP port
    pub reliable_port: u16,

    /// Server UDP port
    pub best_effort_port: u16,

    /// Connect with TLS
    pub tls: bool,

    /// Accept any server certificate (pairs with a self-signed server)
    pub tls_self_signed: bool,

    /// Offline message policy
    pub cache_mode: CacheMode,

    /// Bound on connect plus handshake
    #[serde(with = "duration_serde")]
    pub connection_timeout: Duration,

    /// Period of the background reconnect driver
    #[serde(with = "duration_serde")]
    pub reconnect_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            service: String::from("dualnet"),
            address: String::from("127.0.0.1"),
            reliable_port: DEFAULT_PORT,
            best_effort_port: DEFAULT_PORT,
            tls: false,
            tls_self_signed: false,
            cache_mode: CacheMode::default(),
            connection_timeout: timeout::CONNECT_TIMEOUT,
            reconnect_interval: timeout::RECONNECT_INTERVAL,
        }
    }
}

impl ClientConfig {
    /// `address:reliable_port`
    pub fn reliable_addr(&self) -> String {
        format!("{}:{}", self.address, self.reliable_port)
    }

    /// `address:best_effort_port`
    pub fn best_effort_addr(&self) -> String {
        format!("{}:{}", self.address, self.best_effort_port)
    }

    /// Validate client configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Client address cannot be empty".to_string());
        }

        if self.reliable_port == 0 || self.best_effort_port == 0 {
            errors.push("Client ports must be non-zero".to_string());
        }

        if self.connection_timeout.as_millis() < 100 {
            errors.push("Connection timeout too short (minimum: 100ms)".to_string());
        } else if self.connection_timeout.as_secs() > 300 {
            errors.push("Connection timeout too long (maximum: 300s)".to_string());
        }

        if self.reconnect_interval.as_millis() < 10 {
            errors.push("Reconnect interval too short (minimum: 10ms)".to_string());
        } else if self.reconnect_interval.as_secs() > 60 {
            errors.push("Reconnect interval too long (maximum: 60s)".to_string());
        }

        errors
    }
}

/// Settings shared by both ends of a connection
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    /// Maximum frame size in bytes (length prefix excluded)
    pub max_frame_size: usize,

    /// Receive buffer for one datagram
    pub datagram_buffer_size: usize,

    /// Close the reliable channel after this long without inbound traffic
    #[serde(with = "duration_serde")]
    pub read_idle_timeout: Duration,

    /// Send a ping after this long without outbound traffic
    #[serde(with = "duration_serde")]
    pub write_idle_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
            datagram_buffer_size: DATAGRAM_BUFFER_SIZE,
            read_idle_timeout: timeout::READ_IDLE_TIMEOUT,
            write_idle_timeout: timeout::WRITE_IDLE_TIMEOUT,
        }
    }
}

impl TransportConfig {
    /// Largest best-effort frame whose datagram fits one receive buffer
    pub fn max_datagram_frame(&self) -> usize {
        self.datagram_buffer_size.saturating_sub(4)
    }

    /// Validate transport configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_frame_size < 1024 {
            errors.push("Max frame size too small (minimum: 1 KB)".to_string());
        } else if self.max_frame_size > 100 * 1024 * 1024 {
            errors.push(format!(
                "Max frame size too large: {} bytes (maximum recommended: 100 MB)",
                self.max_frame_size
            ));
        }

        if self.datagram_buffer_size < 512 {
            errors.push("Datagram buffer too small (minimum: 512 bytes)".to_string());
        } else if self.datagram_buffer_size > 65_535 {
            errors.push("Datagram buffer larger than a UDP datagram (maximum: 65535)".to_string());
        }

        if self.write_idle_timeout >= self.read_idle_timeout {
            errors.push(
                "Write-idle timeout must be shorter than read-idle timeout or peers time out between pings"
                    .to_string(),
            );
        }

        if self.write_idle_timeout.as_millis() < 100 {
            errors.push("Write-idle timeout too short (minimum: 100ms)".to_string());
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("dualnet"),
            log_level: Level::INFO,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
