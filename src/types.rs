// =============================================================================
// Shared types used across the candle relay
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single trade reported by the upstream feed.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeTick {
    pub symbol: String,
    pub price: f64,
    pub volume: i64,
    pub occurred_at: DateTime<Utc>,
}

/// A finalized (or snapshotted) OHLCV record for one symbol and one window.
///
/// `timestamp` is the open time of the bucket the candle was built from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
    pub timestamp: DateTime<Utc>,
}

/// Whether a candle event carries an in-progress bucket or a persisted candle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateType {
    Live,
    Closed,
}

impl std::fmt::Display for UpdateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "live"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Event emitted by the aggregator and pushed to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandleEvent {
    pub update_type: UpdateType,
    pub candle: Candle,
}

impl CandleEvent {
    pub fn live(candle: Candle) -> Self {
        Self {
            update_type: UpdateType::Live,
            candle,
        }
    }

    pub fn closed(candle: Candle) -> Self {
        Self {
            update_type: UpdateType::Closed,
            candle,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.candle.symbol
    }

    pub fn is_closed(&self) -> bool {
        self.update_type == UpdateType::Closed
    }
}

/// Lifecycle of the single upstream feed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Subscribing,
    Connected,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Disconnected
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Subscribing => write!(f, "Subscribing"),
            Self::Connected => write!(f, "Connected"),
        }
    }
}
