// =============================================================================
// Central Application State — Candle Relay
// =============================================================================
//
// Ties the long-lived subsystems together for the HTTP and WebSocket layers.
// Every subsystem manages its own interior mutability; AppState only holds
// Arc references plus immutable startup data, so it is shared as
// `Arc<AppState>` without any lock of its own.
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::broadcast::SubscriberRegistry;
use crate::config::ServiceConfig;
use crate::market_data::FeedConnector;
use crate::store::CandleStore;
use crate::types::ConnectionState;

// =============================================================================
// Status snapshot
// =============================================================================

/// Operational view served by `/status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub feed_state: ConnectionState,
    pub feed_connected: bool,
    /// Last successful connect or probe of the upstream feed.
    pub last_ping: Option<DateTime<Utc>>,
    pub active_clients: usize,
    pub uptime_secs: u64,
    pub server_start_time: DateTime<Utc>,
}

// =============================================================================
// AppState
// =============================================================================

pub struct AppState {
    pub config: ServiceConfig,
    pub store: Arc<dyn CandleStore>,
    pub registry: Arc<SubscriberRegistry>,
    pub feed: Arc<FeedConnector>,

    pub started_at: DateTime<Utc>,
    start_instant: Instant,
}

impl AppState {
    pub fn new(
        config: ServiceConfig,
        store: Arc<dyn CandleStore>,
        registry: Arc<SubscriberRegistry>,
        feed: Arc<FeedConnector>,
    ) -> Self {
        Self {
            config,
            store,
            registry,
            feed,
            started_at: Utc::now(),
            start_instant: Instant::now(),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_instant.elapsed().as_secs()
    }

    pub fn build_status(&self) -> StatusSnapshot {
        StatusSnapshot {
            feed_state: self.feed.state(),
            feed_connected: self.feed.is_connected(),
            last_ping: self.feed.last_probe_at(),
            active_clients: self.registry.len(),
            uptime_secs: self.uptime_secs(),
            server_start_time: self.started_at,
        }
    }
}
