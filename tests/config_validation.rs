//! Integration tests for configuration validation

#![allow(clippy::expect_used)]

use dualnet::config::{
    CacheMode, ClientConfig, LoggingConfig, NetworkConfig, ServerConfig, TransportConfig,
};
use dualnet::core::message::Transport;
use std::time::Duration;
use tracing::Level;

#[test]
fn test_default_config_validates() {
    let config = NetworkConfig::default();
    let errors = config.validate();
    assert!(
        errors.is_empty(),
        "Default config should be valid, but got errors: {:?}",
        errors
    );
}

#[test]
fn test_invalid_server_address() {
    let mut config = NetworkConfig::default();
    config.server.address = "invalid_address".to_string();

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Invalid server address")));
}

#[test]
fn test_empty_server_address() {
    let mut config = NetworkConfig::default();
    config.server.address = String::new();

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("cannot be empty")));
}

#[test]
fn test_zero_max_connections() {
    let mut config = NetworkConfig::default();
    config.server.max_connections = 0;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Max connections must be greater than 0")));
}

#[test]
fn test_high_max_connections_warning() {
    let mut config = NetworkConfig::default();
    config.server.max_connections = 150_000;

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Max connections very high")));
}

#[test]
fn test_tls_without_certificate_rejected() {
    let mut config = NetworkConfig::default();
    config.server.tls = true;

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("tls_cert_path")));

    config.server.tls_self_signed = true;
    assert!(config.validate().is_empty());
}

#[test]
fn test_token_length_bounds() {
    let mut config = NetworkConfig::default();
    config.server.token_length = 8;
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Token length too short")));

    config.server.token_length = 4096;
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Token length too long")));
}

#[test]
fn test_best_effort_socket_count_bounds() {
    let mut config = NetworkConfig::default();
    config.server.best_effort_sockets = 0;
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("at least 1")));

    config.server.best_effort_sockets = 128;
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("socket count too high")));
}

#[test]
fn test_zero_queue_limit_rejected() {
    let mut config = NetworkConfig::default();
    config.server.best_effort_queue_limit = Some(0);

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("queue limit")));
}

#[test]
fn test_client_ports_must_be_set() {
    let mut config = NetworkConfig::default();
    config.client.best_effort_port = 0;

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("non-zero")));
}

#[test]
fn test_server_connection_timeout_bounds() {
    let mut config = NetworkConfig::default();
    assert_eq!(config.server.connection_timeout, Duration::from_secs(10));

    config.server.connection_timeout = Duration::from_millis(20);
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Server connection timeout too short")));

    config.server.connection_timeout = Duration::from_secs(600);
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Server connection timeout too long")));
}

#[test]
fn test_token_must_fit_datagram_buffer() {
    let mut config = NetworkConfig::default();
    config.server.token_length = 1024;
    config.transport.datagram_buffer_size = 512;

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("does not fit")));

    config.transport.datagram_buffer_size = 2048;
    assert!(config.validate().is_empty());
    assert_eq!(config.transport.max_datagram_frame(), 2044);
}

#[test]
fn test_short_connection_timeout() {
    let mut config = NetworkConfig::default();
    config.client.connection_timeout = Duration::from_millis(50);

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Connection timeout too short")));
}

#[test]
fn test_long_connection_timeout() {
    let mut config = NetworkConfig::default();
    config.client.connection_timeout = Duration::from_secs(400);

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Connection timeout too long")));
}

#[test]
fn test_write_idle_must_be_shorter_than_read_idle() {
    let mut config = NetworkConfig::default();
    config.transport.write_idle_timeout = Duration::from_secs(30);
    config.transport.read_idle_timeout = Duration::from_secs(30);

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Write-idle timeout must be shorter")));
}

#[test]
fn test_tiny_max_frame_size() {
    let mut config = NetworkConfig::default();
    config.transport.max_frame_size = 512;

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Max frame size too small")));
}

#[test]
fn test_datagram_buffer_bounds() {
    let mut config = NetworkConfig::default();
    config.transport.datagram_buffer_size = 100_000;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("larger than a UDP datagram")));
}

#[test]
fn test_empty_app_name() {
    let mut config = NetworkConfig::default();
    config.logging.app_name = String::new();

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Application name cannot be empty")));
}

#[test]
fn test_validate_strict_with_invalid_config() {
    let mut config = NetworkConfig::default();
    config.server.address = String::new();

    let error = config.validate_strict().expect_err("should fail");
    assert!(error.to_string().contains("Configuration validation failed"));
}

#[test]
fn test_multiple_validation_errors() {
    let mut config = NetworkConfig::default();
    config.server.address = String::new();
    config.server.max_connections = 0;
    config.client.address = String::new();
    config.transport.max_frame_size = 0;
    config.logging.app_name = String::new();

    let errors = config.validate();
    assert!(
        errors.len() >= 5,
        "Expected at least 5 errors, got {}: {:?}",
        errors.len(),
        errors
    );
}

#[test]
fn test_cache_mode_policy() {
    assert!(CacheMode::Both.caches(Transport::Reliable));
    assert!(CacheMode::Both.caches(Transport::BestEffort));
    assert!(CacheMode::ReliableOnly.caches(Transport::Reliable));
    assert!(!CacheMode::ReliableOnly.caches(Transport::BestEffort));
    assert!(!CacheMode::BestEffortOnly.caches(Transport::Reliable));
    assert!(!CacheMode::Disabled.caches(Transport::Reliable));
}

#[test]
fn test_toml_overrides_defaults() {
    let config = NetworkConfig::from_toml(
        r#"
        [server]
        service = "arena"
        address = "127.0.0.1"
        reliable_port = 14000
        best_effort_port = 14001
        tls = false
        tls_self_signed = false
        max_connections = 64
        blocking = false
        token_length = 64
        token_ttl = 5000
        best_effort_sockets = 2

        [client]
        service = "arena"
        address = "arena.example"
        reliable_port = 14000
        best_effort_port = 14001
        tls = false
        tls_self_signed = false
        cache_mode = "both"
        connection_timeout = 2000
        reconnect_interval = 500
        "#,
    )
    .expect("valid TOML");

    assert_eq!(config.server.max_connections, 64);
    assert_eq!(config.server.token_ttl, Duration::from_secs(5));
    assert_eq!(config.client.cache_mode, CacheMode::Both);
    assert_eq!(config.client.reconnect_interval, Duration::from_millis(500));
    assert_eq!(config.transport.max_frame_size, dualnet::config::MAX_FRAME_SIZE);
    assert!(config.validate().is_empty());
}

#[test]
fn test_valid_production_config() {
    let config = NetworkConfig {
        server: ServerConfig {
            address: "0.0.0.0".to_string(),
            tls: true,
            tls_cert_path: Some("/etc/arena/cert.pem".to_string()),
            tls_key_path: Some("/etc/arena/key.pem".to_string()),
            max_connections: 10_000,
            best_effort_sockets: 4,
            best_effort_queue_limit: Some(256),
            ..ServerConfig::default()
        },
        client: ClientConfig {
            address: "arena.example".to_string(),
            tls: true,
            cache_mode: CacheMode::Both,
            connection_timeout: Duration::from_secs(10),
            ..ClientConfig::default()
        },
        transport: TransportConfig {
            max_frame_size: 1024 * 1024,
            datagram_buffer_size: 1400,
            read_idle_timeout: Duration::from_secs(30),
            write_idle_timeout: Duration::from_secs(10),
        },
        logging: LoggingConfig {
            app_name: "arena".to_string(),
            log_level: Level::INFO,
            json_format: true,
        },
    };

    let errors = config.validate();
    assert!(errors.is_empty(), "Production config should be valid, got: {:?}", errors);
}
