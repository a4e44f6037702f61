//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (limits > 0, addresses parse)
//! - Check TLS material is named when TLS is enabled
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: BridgeConfig → Result<(), Vec<ValidationError>>

use std::net::SocketAddr;

use crate::config::schema::BridgeConfig;
use crate::grpcweb::frame::HEADER_SIZE;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {message}")]
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

/// Check a parsed configuration, collecting every problem found.
pub fn validate_config(config: &BridgeConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if !is_host_port(&config.client.endpoint) {
        errors.push(ValidationError::new(
            "client.endpoint",
            format!("expected host:port, got {:?}", config.client.endpoint),
        ));
    }
    if config.client.local_bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "client.local_bind_address",
            "not a socket address",
        ));
    }
    if config.client.max_connections == 0 {
        errors.push(ValidationError::new("client.max_connections", "must be > 0"));
    }
    if config.client.connect_timeout_secs == 0 {
        errors.push(ValidationError::new("client.connect_timeout_secs", "must be > 0"));
    }
    let tls = &config.client.tls;
    if tls.enabled && tls.ca_path.is_none() {
        errors.push(ValidationError::new(
            "client.tls.ca_path",
            "required when TLS is enabled",
        ));
    }
    if tls.client_cert_path.is_some() != tls.client_key_path.is_some() {
        errors.push(ValidationError::new(
            "client.tls.client_cert_path",
            "client certificate and key must be set together",
        ));
    }

    if config.server.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new("server.bind_address", "not a socket address"));
    }
    if config.server.max_connections == 0 {
        errors.push(ValidationError::new("server.max_connections", "must be > 0"));
    }
    if let Some(server_tls) = &config.server.tls {
        if server_tls.cert_path.is_empty() || server_tls.key_path.is_empty() {
            errors.push(ValidationError::new(
                "server.tls",
                "cert_path and key_path are required",
            ));
        }
    }

    let token = &config.alpn.pure_grpc_token;
    if token.is_empty() || token.len() > 255 {
        errors.push(ValidationError::new(
            "alpn.pure_grpc_token",
            "must be 1..=255 bytes",
        ));
    } else if token == "h2" || token == "http/1.1" {
        errors.push(ValidationError::new(
            "alpn.pure_grpc_token",
            "must differ from standard protocol ids",
        ));
    }

    let max = config.codec.max_frame_bytes;
    if max < HEADER_SIZE || max > u32::MAX as usize {
        errors.push(ValidationError::new(
            "codec.max_frame_bytes",
            format!("must be within {HEADER_SIZE}..={}", u32::MAX),
        ));
    }

    if config.observability.metrics_enabled
        && config
            .observability
            .metrics_address
            .parse::<SocketAddr>()
            .is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            "not a socket address",
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn is_host_port(value: &str) -> bool {
    match value.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    }
}
