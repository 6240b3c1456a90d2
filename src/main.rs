use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tollgate::config::{LoggingConfig, StoreBackend, TollgateConfig};
use tollgate::http::{Admission, HttpServer};
use tollgate::store::{CounterStore, MemoryStore, RedisStore};

/// Request admission control in front of an HTTP API.
#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = TollgateConfig::load(args.config.as_deref()).context("loading configuration")?;

    init_tracing(&config.logging);

    info!("Starting Tollgate admission control");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        http_addr = %config.server.http_addr,
        backend = ?config.store.backend,
        store_timeout_ms = config.server.store_timeout_ms,
        "Configuration loaded"
    );

    let store = build_store(&config).await?;
    let admission = Admission::from_config(&config, store).context("building rule table")?;
    info!("Admission layer initialized");

    HttpServer::new(config.server.http_addr, admission)
        .serve_with_shutdown(shutdown_signal())
        .await?;

    info!("Tollgate stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn build_store(config: &TollgateConfig) -> anyhow::Result<Arc<dyn CounterStore>> {
    match config.store.backend {
        StoreBackend::Redis => {
            let store = RedisStore::connect(&config.store.redis_url, &config.store.key_prefix)
                .await
                .context("connecting to Redis")?;
            Ok(Arc::new(store))
        }
        StoreBackend::Memory => {
            info!("Using in-memory counter store; counts are not shared between instances");
            let store = Arc::new(MemoryStore::new());

            let sweeper = store.clone();
            let interval = Duration::from_secs(config.store.purge_interval_secs.max(1));
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    sweeper.purge_expired();
                }
            });

            Ok(store)
        }
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
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
