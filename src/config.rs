//! Configuration management for Tollgate.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TollgateError};
use crate::ratelimit::LimiterOptions;

/// Prefix for environment overrides, e.g. `TOLLGATE__STORE__URL`.
const ENV_PREFIX: &str = "TOLLGATE";

/// Main configuration for the Tollgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Rate limiter configuration
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Path to the YAML rules file
    #[serde(default)]
    pub rules_path: Option<String>,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Take the client address from `X-Forwarded-For` / `X-Real-IP`.
    /// Only enable behind a proxy that overwrites these headers.
    #[serde(default)]
    pub trust_proxy_headers: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            trust_proxy_headers: false,
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Which counter store backs the limiter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Shared Redis instance
    #[default]
    Redis,
    /// Process-local map; quotas are not shared between processes
    Memory,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Connection establishment timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Per-command response timeout in milliseconds
    #[serde(default = "default_response_timeout")]
    pub response_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: default_store_url(),
            connect_timeout_ms: default_connect_timeout(),
            response_timeout_ms: default_response_timeout(),
        }
    }
}

impl StoreConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

fn default_store_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_connect_timeout() -> u64 {
    2000
}

fn default_response_timeout() -> u64 {
    2000
}

/// Rate limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Upper bound on each counter store call in milliseconds
    #[serde(default = "default_store_timeout")]
    pub store_timeout_ms: u64,

    /// Report quotas without ever denying
    #[serde(default)]
    pub dry_run: bool,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            store_timeout_ms: default_store_timeout(),
            dry_run: false,
        }
    }
}

impl LimiterConfig {
    pub fn options(&self) -> LimiterOptions {
        LimiterOptions {
            store_timeout: Duration::from_millis(self.store_timeout_ms),
            dry_run: self.dry_run,
        }
    }
}

fn default_store_timeout() -> u64 {
    500
}

impl ServiceConfig {
    /// Load configuration from an optional YAML file, then apply
    /// `TOLLGATE__*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path).format(config::FileFormat::Yaml),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__"),
        );

        let config = builder.build()?;
        config
            .try_deserialize()
            .map_err(|e| TollgateError::Config(e.to_string()))
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| TollgateError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::default();
        assert_eq!(config.server.listen_addr, default_listen_addr());
        assert!(!config.server.trust_proxy_headers);
        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert_eq!(config.store.url, "redis://127.0.0.1:6379");
        assert_eq!(config.store.connect_timeout(), Duration::from_secs(2));
        assert_eq!(config.limiter.options().store_timeout, Duration::from_millis(500));
        assert!(!config.limiter.dry_run);
        assert!(config.rules_path.is_none());
    }

    #[test]
    fn test_from_yaml_partial() {
        let yaml = r#"
store:
  backend: memory
limiter:
  dry_run: true
rules_path: rules.yaml
"#;
        let config = ServiceConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.store.response_timeout_ms, 2000);
        assert!(config.limiter.options().dry_run);
        assert_eq!(config.rules_path.as_deref(), Some("rules.yaml"));
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("tollgate-config-{}.yaml", std::process::id()));
        std::fs::write(
            &path,
            "server:\n  listen_addr: \"0.0.0.0:9000\"\n  trust_proxy_headers: true\nlimiter:\n  store_timeout_ms: 250\n",
        )
        .unwrap();

        let config = ServiceConfig::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.server.listen_addr.port(), 9000);
        assert!(config.server.trust_proxy_headers);
        assert_eq!(config.limiter.store_timeout_ms, 250);
    }

    #[test]
    fn test_invalid_yaml_is_config_error() {
        let err = ServiceConfig::from_yaml("store: [").unwrap_err();
        assert!(matches!(err, TollgateError::Config(_)));
    }
}
