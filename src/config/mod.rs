//! Configuration management

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Client configuration
    pub client: Option<ClientConfig>,
    /// Server configuration
    pub server: Option<ServerConfig>,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Local SOCKS5 listen address
    pub listen: String,
    /// Remote server address
    pub remote: String,
    /// Shared tunnel secret
    pub secret: String,
    /// Connection pool capacity
    pub pool_size: usize,
    /// Idle timeout for pooled pipes, in seconds
    pub idle_timeout: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:2080".to_string(),
            remote: "127.0.0.1:7443".to_string(),
            secret: "secret".to_string(),
            pool_size: 32,
            idle_timeout: 60,
        }
    }
}

impl ClientConfig {
    /// Idle timeout as a duration
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout)
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address
    pub listen: String,
    /// Shared tunnel secret
    pub secret: String,
    /// TLS certificate path (PEM)
    pub cert: String,
    /// TLS private key path (PEM)
    pub key: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:7443".to_string(),
            secret: "secret".to_string(),
            cert: "certs/cert.pem".to_string(),
            key: "certs/key.pem".to_string(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_partial_client_section() {
        let config: Config = toml::from_str(
            r#"
            [client]
            listen = "0.0.0.0:1080"
            secret = "hunter2"
            "#,
        )
        .unwrap();

        let client = config.client.unwrap();
        assert_eq!(client.listen, "0.0.0.0:1080");
        assert_eq!(client.secret, "hunter2");
        // omitted fields fall back to defaults
        assert_eq!(client.pool_size, 32);
        assert_eq!(client.idle_timeout(), Duration::from_secs(60));
        assert!(config.server.is_none());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn parses_server_section() {
        let config: Config = toml::from_str(
            r#"
            [server]
            listen = "0.0.0.0:7443"
            secret = "hunter2"
            cert = "/etc/spool/cert.pem"
            key = "/etc/spool/key.pem"

            [logging]
            level = "debug"
            "#,
        )
        .unwrap();

        let server = config.server.unwrap();
        assert_eq!(server.listen, "0.0.0.0:7443");
        assert_eq!(server.cert, "/etc/spool/cert.pem");
        assert_eq!(config.logging.level, "debug");
    }
}
