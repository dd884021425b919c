//! Command-line interface and logging setup for the `tollgate` binary.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{ServiceConfig, StoreBackend};

/// Tollgate - distributed rate limiting for HTTP services
#[derive(Parser, Debug)]
#[command(name = "tollgate", version, about, long_about = None)]
pub struct Cli {
    /// Service configuration file (YAML)
    #[arg(short, long, env = "TOLLGATE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Rate limit rules file (YAML); overrides `rules_path` from the config
    #[arg(short, long, env = "TOLLGATE_RULES")]
    pub rules: Option<PathBuf>,

    /// HTTP listen address; overrides `server.listen_addr`
    #[arg(long)]
    pub listen: Option<SocketAddr>,

    /// Keep counters in process memory instead of Redis
    #[arg(long)]
    pub memory_store: bool,

    /// Report quotas but never deny requests
    #[arg(long)]
    pub dry_run: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", env = "TOLLGATE_LOG_LEVEL")]
    pub log_level: String,

    /// Log format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, env = "TOLLGATE_LOG_FORMAT")]
    pub log_format: LogFormat,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable text
    Text,
    /// One JSON object per line
    Json,
}

impl Cli {
    /// Apply command-line overrides on top of the loaded configuration.
    pub fn apply(&self, config: &mut ServiceConfig) {
        if let Some(rules) = &self.rules {
            config.rules_path = Some(rules.display().to_string());
        }
        if let Some(listen) = self.listen {
            config.server.listen_addr = listen;
        }
        if self.memory_store {
            config.store.backend = StoreBackend::Memory;
        }
        if self.dry_run {
            config.limiter.dry_run = true;
        }
    }
}

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `level` when set.
pub fn init_logging(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false).with_thread_ids(true))
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_current_span(true))
            .init(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_defaults() {
        let cli = Cli::parse_from(["tollgate"]);
        assert!(cli.config.is_none());
        assert_eq!(cli.log_level, "info");
        assert_eq!(cli.log_format, LogFormat::Text);
        assert!(!cli.memory_store);
    }

    #[test]
    fn test_apply_overrides() {
        let cli = Cli::parse_from([
            "tollgate",
            "--rules",
            "rules.yaml",
            "--listen",
            "0.0.0.0:9999",
            "--memory-store",
            "--dry-run",
            "--log-format",
            "json",
        ]);
        let mut config = ServiceConfig::default();
        cli.apply(&mut config);

        assert_eq!(config.rules_path.as_deref(), Some("rules.yaml"));
        assert_eq!(config.server.listen_addr.port(), 9999);
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert!(config.limiter.dry_run);
        assert_eq!(cli.log_format, LogFormat::Json);
    }
}
