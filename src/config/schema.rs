//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the server.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

use crate::json::parser::MAX_NESTING_DEPTH;

/// Lower bound for the request queue backlog.
pub const MIN_QUEUE_LENGTH: u32 = 1;
/// Upper bound for the request queue backlog.
pub const MAX_QUEUE_LENGTH: u32 = 65_535;

/// Root configuration for the event server.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Request queue, worker pool and site overrides.
    pub server: HttpConfig,

    /// WebSocket framing and keepalive.
    pub websocket: WebSocketConfig,

    /// Server-push event channels.
    pub events: EventsConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Admin API.
    pub admin: AdminConfig,
}

/// Host part of a registered URL prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    /// `+`: every host name, ahead of explicit hosts.
    #[default]
    Strong,
    /// The machine's short host name.
    Named,
    /// The machine's fully qualified host name.
    FullyQualified,
    /// The bound IP address.
    Address,
    /// `*`: every host name not claimed by another prefix.
    Weak,
}

/// Detail included in 503 responses when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity503 {
    /// Status line only.
    #[default]
    Basic,
    /// Short reason in the body.
    Limited,
    /// Reason plus queue state.
    Full,
}

/// HTTP engine configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Server name, used for the request queue and logging.
    pub name: String,

    /// Address listeners bind to (e.g., "0.0.0.0").
    pub bind_host: String,

    /// Requests that may wait in the queue before 503 is returned.
    pub queue_length: u32,

    /// 503 response detail.
    pub verbosity_503: Verbosity503,

    /// Worker tasks servicing the request queue.
    pub worker_threads: usize,

    /// Largest accepted request body in bytes.
    pub max_body_size: usize,

    /// Deepest array/object nesting accepted in JSON bodies.
    pub max_json_depth: usize,

    /// Maximum concurrent connections per listening port.
    pub max_connections: usize,

    /// Overrides the channel type passed to `create_site`.
    pub channel_type: Option<ChannelType>,

    /// Overrides the port passed to `create_site`.
    pub port: Option<u16>,

    /// Overrides the secure flag passed to `create_site`.
    pub secure: Option<bool>,

    /// Overrides the base URL passed to `create_site`.
    pub base_url: Option<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            name: "event-server".to_string(),
            bind_host: "0.0.0.0".to_string(),
            queue_length: 64,
            verbosity_503: Verbosity503::Basic,
            worker_threads: 8,
            max_body_size: 1024 * 1024,
            max_json_depth: MAX_NESTING_DEPTH,
            max_connections: 10_000,
            channel_type: None,
            port: None,
            secure: None,
            base_url: None,
        }
    }
}

/// WebSocket configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WebSocketConfig {
    /// Payload bytes per outgoing frame.
    pub fragment_size: usize,

    /// Interval between keepalive pings in milliseconds (0 disables).
    pub keepalive_ms: u64,

    /// Time to wait for a pong in milliseconds.
    pub ping_timeout_ms: u64,

    /// Time to wait for the peer's close frame in milliseconds.
    pub close_timeout_ms: u64,

    /// Largest reassembled message in bytes.
    pub max_message_size: usize,

    /// Subprotocols the server accepts.
    pub protocols: Vec<String>,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            fragment_size: crate::websocket::frame::WS_FRAGMENT_DEFAULT,
            keepalive_ms: crate::websocket::frame::WS_KEEPALIVE_TIME,
            ping_timeout_ms: crate::websocket::frame::WS_PING_TIMEOUT,
            close_timeout_ms: 3000,
            max_message_size: 16 * 1024 * 1024,
            protocols: Vec::new(),
        }
    }
}

/// Event channel configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Interval of the channel monitor in milliseconds.
    pub monitor_interval_ms: u64,

    /// Window for counting failed authentications, in seconds.
    pub brute_force_window_secs: u64,

    /// Failed authentications allowed within the window.
    pub brute_force_max_attempts: u32,

    /// Name of the cookie carrying the channel token.
    pub cookie_name: String,

    /// Require the channel cookie on registration.
    pub require_auth: bool,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            monitor_interval_ms: 500,
            brute_force_window_secs: 60,
            brute_force_max_attempts: 5,
            cookie_name: "EventChannel".to_string(),
            require_auth: true,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Default log filter when RUST_LOG is not set.
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,

    /// Enable the Prometheus exporter.
    pub metrics_enabled: bool,

    /// Prometheus listen address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "event_server=info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Serve the admin API.
    pub enabled: bool,

    /// Admin API listen address.
    pub bind_address: String,

    /// Bearer token required on every admin request.
    pub api_key: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_address: "127.0.0.1:8081".to_string(),
            api_key: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: ServerConfig = toml::from_str("").unwrap();
        assert_eq!(config.server.queue_length, 64);
        assert_eq!(config.websocket.ping_timeout_ms, 5000);
        assert!(config.server.port.is_none());
    }

    #[test]
    fn test_partial_sections() {
        let config: ServerConfig = toml::from_str(
            r#"
            [server]
            port = 8080
            channel_type = "weak"
            verbosity_503 = "full"

            [websocket]
            protocols = ["events"]
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, Some(8080));
        assert_eq!(config.server.channel_type, Some(ChannelType::Weak));
        assert_eq!(config.server.verbosity_503, Verbosity503::Full);
        assert_eq!(config.server.worker_threads, 8);
        assert_eq!(config.websocket.protocols, vec!["events".to_string()]);
    }
}
