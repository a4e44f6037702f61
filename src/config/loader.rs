//! Configuration loading from disk.

use std::fs;
use std::path::Path;

use crate::config::schema::BridgeConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation failed: {}", join(.0))]
    Validation(Vec<ValidationError>),
}

fn join(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<BridgeConfig, ConfigError> {
    let config: BridgeConfig = toml::from_str(content)?;
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<BridgeConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config(&content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::LogFormat;

    #[test]
    fn parses_partial_config_with_defaults() {
        let config = parse_config(
            r#"
            [client]
            endpoint = "central.example.com:443"

            [client.tls]
            enabled = true
            ca_path = "/etc/certs/ca.pem"

            [observability]
            log_format = "json"
            "#,
        )
        .unwrap();

        assert_eq!(config.client.endpoint, "central.example.com:443");
        assert!(config.client.tls.enabled);
        assert_eq!(config.observability.log_format, LogFormat::Json);
        assert_eq!(config.alpn.pure_grpc_token, "pure-grpc");
        assert_eq!(config.codec.max_frame_bytes, 16 * 1024 * 1024);
    }

    #[test]
    fn validation_errors_surface() {
        let err = parse_config("[server]\nmax_connections = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
        assert!(err.to_string().contains("server.max_connections"));
    }

    #[test]
    fn load_from_file() {
        let path = std::env::temp_dir().join(format!("grpc-downgrade-{}.toml", std::process::id()));
        fs::write(&path, "[alpn]\npure_grpc_token = \"rpc-direct\"\n").unwrap();
        let config = load_config(&path).unwrap();
        let _ = fs::remove_file(&path);
        assert_eq!(config.alpn.pure_grpc_token, "rpc-direct");
    }

    #[test]
    fn every_validation_error_is_reported() {
        let err = parse_config("[server]\nmax_connections = 0\n[client]\nmax_connections = 0\n").unwrap_err();
        let ConfigError::Validation(errors) = &err else {
            panic!("expected validation error, got {err}");
        };
        assert!(errors.len() >= 2);
        let message = err.to_string();
        assert!(message.starts_with("Validation failed: "));
        assert!(message.contains("server.max_connections"));
        assert!(message.contains("client.max_connections"));
    }

    #[test]
    fn syntax_error_is_parse_error() {
        let err = parse_config("[server\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = load_config(Path::new("/nonexistent/grpc-downgrade.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
