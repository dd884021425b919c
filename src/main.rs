use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tracing::info;

use tollgate::cli::{init_logging, Cli};
use tollgate::config::{ServiceConfig, StoreBackend};
use tollgate::http::{default_route_table, HttpServer, RateLimitState};
use tollgate::ratelimit::{CounterStore, MemoryStore, RateLimiter, RedisStore, RouteTable};

/// How often expired in-memory counters are dropped.
const PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.log_format);

    info!("Starting Tollgate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = ServiceConfig::load(cli.config.as_deref())?;
    cli.apply(&mut config);
    info!(
        listen_addr = %config.server.listen_addr,
        store = ?config.store.backend,
        dry_run = config.limiter.dry_run,
        "Configuration loaded"
    );

    let routes = match &config.rules_path {
        Some(path) => RouteTable::from_file(path)?,
        None => {
            info!("No rules file configured, using built-in demo rules");
            default_route_table()
        }
    };

    let store: Arc<dyn CounterStore> = match config.store.backend {
        StoreBackend::Redis => Arc::new(
            RedisStore::connect(
                &config.store.url,
                config.store.connect_timeout(),
                config.store.response_timeout(),
            )
            .await?,
        ),
        StoreBackend::Memory => {
            info!("Using in-memory counter store; quotas are not shared between processes");
            let memory = Arc::new(MemoryStore::new());
            spawn_purge(memory.clone());
            memory
        }
    };

    let limiter = RateLimiter::with_options(store, config.limiter.options());
    info!(routes = routes.len(), "Rate limiter initialized");

    let state = RateLimitState::new(limiter, routes)
        .with_trusted_proxy_headers(config.server.trust_proxy_headers);
    let server = HttpServer::new(config.server.listen_addr, state);

    // Run the server with graceful shutdown on Ctrl+C
    server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Tollgate stopped");
    Ok(())
}

/// Periodically drop expired in-memory counters.
fn spawn_purge(store: Arc<MemoryStore>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PURGE_INTERVAL);
        loop {
            interval.tick().await;
            store.purge_expired();
        }
    });
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
