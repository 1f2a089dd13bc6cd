//! On-disk startup configuration: which servers and listeners to seed the
//! fleet with, and the knobs that would otherwise require editing the
//! binary to change.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use proxy_fleet::DEFAULT_RECHECK_INTERVAL;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub id: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub server_ids: Vec<String>,
    #[serde(default)]
    pub ignore_all: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_recheck_secs")]
    pub recheck_interval_secs: u64,
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,
    #[serde(default)]
    pub geo_database_path: Option<String>,
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,
}

fn default_recheck_secs() -> u64 {
    DEFAULT_RECHECK_INTERVAL.as_secs()
}

fn default_worker_pool_size() -> usize {
    4
}

impl GatewayConfig {
    pub fn recheck_interval(&self) -> Duration {
        Duration::from_secs(self.recheck_interval_secs)
    }

    /// Small local demo fleet: a direct-only listener on 1080 plus a
    /// handful of commented-out-in-spirit placeholders an operator is
    /// expected to replace with real upstreams.
    pub fn default_config() -> Self {
        Self {
            recheck_interval_secs: default_recheck_secs(),
            worker_pool_size: default_worker_pool_size(),
            geo_database_path: None,
            servers: Vec::new(),
            listeners: vec![ListenerConfig {
                port: 1080,
                username: None,
                password: None,
                tags: Vec::new(),
                server_ids: Vec::new(),
                ignore_all: true,
            }],
        }
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(format!("{}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    IoError(String),

    #[error("failed to parse config: {0}")]
    ParseError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_toml() {
        let config = GatewayConfig::default_config();
        let rendered = config.to_toml();
        let parsed = GatewayConfig::from_toml(&rendered).unwrap();
        assert_eq!(parsed.listeners.len(), 1);
        assert_eq!(parsed.listeners[0].port, 1080);
        assert!(parsed.listeners[0].ignore_all);
    }

    #[test]
    fn missing_optional_fields_default() {
        let toml = r#"
            [[listeners]]
            port = 9050
            ignore_all = true
        "#;
        let config = GatewayConfig::from_toml(toml).unwrap();
        assert_eq!(config.worker_pool_size, default_worker_pool_size());
        assert_eq!(config.servers.len(), 0);
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let err = GatewayConfig::from_toml("not valid toml [[[").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }
}
