mod broker;
mod cache;
mod codec;
mod config;
mod history;
mod service;
mod web;

#[cfg(test)]
mod testing;

use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use broker::Broker;
use history::PostgrestStore;
use service::TelemetryService;

/// How long shutdown waits for in-flight history writes.
const WRITE_DRAIN: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    // Env vars may come from the process instead of a .env file.
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "bridge.toml".to_string());
    let cfg = config::load(&config_path)?;

    // ── History store ───────────────────────────────────────────────
    let store = PostgrestStore::new(&cfg.store)?;
    if !store.is_configured() {
        warn!("no history store configured, running cache-only");
    }

    // ── Broker + service ────────────────────────────────────────────
    let broker = Broker::new(&cfg.mqtt);
    let svc = Arc::new(TelemetryService::new(store, broker.clone(), &cfg));

    if cfg.mqtt.is_enabled() {
        broker.start(Arc::clone(&svc)).await?;
    } else {
        warn!("MQTT_HOST not set, broker connection disabled");
    }

    // ── HTTP api ────────────────────────────────────────────────────
    let served = web::serve(Arc::clone(&svc), &cfg.api, shutdown_signal()).await;

    broker.stop().await;
    if tokio::time::timeout(WRITE_DRAIN, svc.flush_writes())
        .await
        .is_err()
    {
        warn!("history writes still pending at exit, abandoned");
    }
    info!("bridge stopped");
    served
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
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
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
}
