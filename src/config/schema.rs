//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the bridge.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

use crate::grpcweb::DEFAULT_MAX_FRAME_LEN;
use crate::net::alpn::DEFAULT_PURE_GRPC_TOKEN;

/// Root configuration for the downgrade bridge.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct BridgeConfig {
    /// Client-side downgrading proxy.
    pub client: ClientConfig,

    /// Server-side downgrading handler.
    pub server: ServerConfig,

    /// Protocol negotiation settings.
    pub alpn: AlpnConfig,

    /// Web framing limits.
    pub codec: CodecConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Client-side proxy configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Real RPC endpoint (e.g., "central.example.com:443").
    pub endpoint: String,

    /// Local address for the standalone proxy mode.
    pub local_bind_address: String,

    /// Maximum concurrent local connections in standalone mode.
    pub max_connections: usize,

    /// TCP connect timeout towards the endpoint, in seconds.
    pub connect_timeout_secs: u64,

    /// TLS towards the endpoint.
    pub tls: ClientTlsConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: "127.0.0.1:8443".to_string(),
            local_bind_address: "127.0.0.1:8444".to_string(),
            max_connections: 1024,
            connect_timeout_secs: 5,
            tls: ClientTlsConfig::default(),
        }
    }
}

/// Client TLS configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ClientTlsConfig {
    /// Use TLS towards the endpoint.
    pub enabled: bool,

    /// PEM bundle of trusted roots.
    pub ca_path: Option<String>,

    /// Name to verify instead of the endpoint host.
    pub server_name: Option<String>,

    /// Client certificate (PEM) for mutual TLS.
    pub client_cert_path: Option<String>,

    /// Client private key (PEM) for mutual TLS.
    pub client_key_path: Option<String>,
}

/// Server-side configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0:8443").
    pub bind_address: String,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,

    /// Optional TLS configuration.
    pub tls: Option<ServerTlsConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8443".to_string(),
            max_connections: 10_000,
            tls: None,
        }
    }
}

/// TLS configuration for the server listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerTlsConfig {
    /// Path to certificate file (PEM).
    pub cert_path: String,

    /// Path to private key file (PEM).
    pub key_path: String,
}

/// ALPN configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AlpnConfig {
    /// Protocol id advertised for unmultiplexed RPC.
    pub pure_grpc_token: String,
}

impl Default for AlpnConfig {
    fn default() -> Self {
        Self {
            pure_grpc_token: DEFAULT_PURE_GRPC_TOKEN.to_string(),
        }
    }
}

/// Web framing limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CodecConfig {
    /// Largest accepted frame payload in bytes.
    pub max_frame_bytes: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
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
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
