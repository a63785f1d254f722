// =============================================================================
// Candle Relay — Main Entry Point
// =============================================================================
//
// Connects to the upstream trade feed, folds trades into one-minute candles,
// persists every closed candle and streams live/closed updates to WebSocket
// subscribers. Ctrl+C cancels every task and closes all subscriber sockets.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod broadcast;
mod config;
mod market_data;
mod store;
mod types;

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::keepalive::KeepAlivePinger;
use crate::app_state::AppState;
use crate::broadcast::SubscriberRegistry;
use crate::config::{ServiceConfig, BUCKET_DURATION};
use crate::market_data::{CandleAggregator, FeedConnector, FeedSettings, FinnhubDialer};
use crate::store::{CandleStore, SqliteCandleStore};

const DEFAULT_CONFIG_PATH: &str = "candle_relay.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Candle Relay starting up");

    let config_path =
        std::env::var("CANDLE_RELAY_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
    let mut config = ServiceConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(path = %config_path, error = %e, "Failed to load config, using defaults");
        ServiceConfig::default()
    });
    config.apply_env();
    config.validate().context("invalid configuration")?;

    info!(symbols = ?config.symbols, "Configured symbols");

    // ── 2. Storage ───────────────────────────────────────────────────────
    let store: Arc<dyn CandleStore> = Arc::new(
        SqliteCandleStore::open(&config.database_url)
            .await
            .context("failed to open candle store")?,
    );

    // ── 3. Pipeline: feed → aggregator → broadcaster → subscribers ──────
    let (events_tx, events_rx) = mpsc::channel(config.event_queue_capacity);
    let aggregator = Arc::new(CandleAggregator::new(
        BUCKET_DURATION,
        store.clone(),
        events_tx,
    )?);

    let dialer = Arc::new(FinnhubDialer::new(
        config.feed_url.clone(),
        config.feed_token.clone(),
    ));
    let feed = Arc::new(FeedConnector::new(
        FeedSettings::from_config(&config),
        dialer,
        aggregator,
    ));
    let registry = Arc::new(SubscriberRegistry::new(config.subscriber_queue_capacity));

    let state = Arc::new(AppState::new(
        config.clone(),
        store,
        registry.clone(),
        feed.clone(),
    ));

    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();

    // ── 4. Feed health monitor (connects on its first tick) ──────────────
    tasks.push(tokio::spawn(
        feed.clone().run_health_monitor(cancel.child_token()),
    ));

    // ── 5. Feed read loop ────────────────────────────────────────────────
    let read_feed = feed.clone();
    let read_cancel = cancel.child_token();
    tasks.push(tokio::spawn(async move {
        if let Err(e) = read_feed.run_read_loop(read_cancel).await {
            error!(error = %e, "Feed read loop terminated");
        }
    }));

    // ── 6. Broadcaster ───────────────────────────────────────────────────
    tasks.push(tokio::spawn(broadcast::run_broadcaster(
        events_rx,
        registry.clone(),
        config.flush_interval(),
        cancel.child_token(),
    )));

    // ── 7. Keep-alive pinger ─────────────────────────────────────────────
    if config.keepalive_interval_secs > 0 {
        match config.port().map(KeepAlivePinger::for_port) {
            Some(Ok(pinger)) => tasks.push(tokio::spawn(pinger.run(
                std::time::Duration::from_secs(config.keepalive_interval_secs),
                cancel.child_token(),
            ))),
            Some(Err(e)) => warn!(error = %e, "Keep-alive pinger disabled"),
            None => warn!(bind_addr = %config.bind_addr, "No port in bind address — keep-alive pinger disabled"),
        }
    }

    // ── 8. HTTP / WebSocket server ───────────────────────────────────────
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "API server listening");

    let server_cancel = cancel.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, api::rest::router(state))
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 9. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    cancel.cancel();
    registry.clear();

    for task in tasks {
        if let Err(e) = task.await {
            error!(error = %e, "Task panicked during shutdown");
        }
    }
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "API server failed"),
        Err(e) => error!(error = %e, "API server task panicked"),
    }

    info!("Candle Relay shut down complete.");
    Ok(())
}
