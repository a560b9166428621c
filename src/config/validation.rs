//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (queue length, pool size, timeouts)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServerConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use crate::config::schema::{ServerConfig, MAX_QUEUE_LENGTH, MIN_QUEUE_LENGTH};

/// One rejected configuration value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Check every semantic constraint and report all violations.
pub fn validate_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.server.name.trim().is_empty() {
        errors.push(ValidationError::new("server.name", "must not be empty"));
    }
    if config.server.bind_host.parse::<std::net::IpAddr>().is_err() {
        errors.push(ValidationError::new(
            "server.bind_host",
            format!("'{}' is not an IP address", config.server.bind_host),
        ));
    }
    if !(MIN_QUEUE_LENGTH..=MAX_QUEUE_LENGTH).contains(&config.server.queue_length) {
        errors.push(ValidationError::new(
            "server.queue_length",
            format!("must be between {MIN_QUEUE_LENGTH} and {MAX_QUEUE_LENGTH}"),
        ));
    }
    if config.server.worker_threads == 0 {
        errors.push(ValidationError::new("server.worker_threads", "must be at least 1"));
    }
    if config.server.max_json_depth == 0 {
        errors.push(ValidationError::new("server.max_json_depth", "must be at least 1"));
    }
    if config.server.max_connections == 0 {
        errors.push(ValidationError::new("server.max_connections", "must be at least 1"));
    }
    if let Some(base) = &config.server.base_url {
        if !base.starts_with('/') {
            errors.push(ValidationError::new("server.base_url", "must start with '/'"));
        }
    }

    if config.websocket.ping_timeout_ms == 0 {
        errors.push(ValidationError::new("websocket.ping_timeout_ms", "must be greater than 0"));
    }
    if config.websocket.keepalive_ms != 0 && config.websocket.keepalive_ms < 100 {
        errors.push(ValidationError::new(
            "websocket.keepalive_ms",
            "must be 0 (disabled) or at least 100",
        ));
    }
    if config.websocket.max_message_size == 0 {
        errors.push(ValidationError::new("websocket.max_message_size", "must be greater than 0"));
    }

    if config.events.monitor_interval_ms == 0 {
        errors.push(ValidationError::new("events.monitor_interval_ms", "must be greater than 0"));
    }
    if config.events.cookie_name.trim().is_empty() {
        errors.push(ValidationError::new("events.cookie_name", "must not be empty"));
    }

    if config.admin.enabled && config.admin.api_key.is_empty() {
        errors.push(ValidationError::new("admin.api_key", "required when the admin API is enabled"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
