// =============================================================================
// Service Configuration — JSON file with environment overrides
// =============================================================================
//
// Every tunable lives here. The JSON file is optional; all fields carry
// `#[serde(default)]` so a partial (or empty) file still loads. Environment
// variables are applied last and win over the file.
//
// The bucket duration is a constant: the relay only produces one-minute
// candles.
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Width of every candle bucket.
pub const BUCKET_DURATION: Duration = Duration::from_secs(60);

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbols() -> Vec<String> {
    [
        "AAPL", "AMZN", "TSLA", "GOOGL", "MSFT", "NVDA", "META", "NFLX", "INTC", "CSCO", "ORCL",
        "IBM", "PYPL",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_feed_url() -> String {
    "wss://ws.finnhub.io".to_string()
}

fn default_database_url() -> String {
    "sqlite://candles.db".to_string()
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_flush_interval_ms() -> u64 {
    1_000
}

fn default_max_connect_attempts() -> u32 {
    5
}

fn default_reconnect_base_delay_ms() -> u64 {
    5_000
}

fn default_health_check_interval_secs() -> u64 {
    30
}

fn default_read_cooldown_ms() -> u64 {
    5_000
}

fn default_event_queue_capacity() -> usize {
    100
}

fn default_subscriber_queue_capacity() -> usize {
    64
}

fn default_keepalive_interval_secs() -> u64 {
    600
}

// =============================================================================
// ServiceConfig
// =============================================================================

/// Top-level configuration for the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    // --- Upstream feed -------------------------------------------------------

    /// Symbols subscribed on the upstream feed.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// WebSocket endpoint of the upstream trade feed.
    #[serde(default = "default_feed_url")]
    pub feed_url: String,

    /// Credential appended to the feed URL. Never logged.
    #[serde(default, skip_serializing)]
    pub feed_token: String,

    /// Connection attempts per reconnect cycle before giving up until the
    /// next health check.
    #[serde(default = "default_max_connect_attempts")]
    pub max_connect_attempts: u32,

    /// Linear backoff step: attempt `n` waits `n * base` before retrying.
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,

    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,

    /// How long the read loop idles after a read failure or while no
    /// connection is available.
    #[serde(default = "default_read_cooldown_ms")]
    pub read_cooldown_ms: u64,

    // --- Pipeline ------------------------------------------------------------

    /// Interval at which coalesced live updates are pushed to subscribers.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Capacity of the aggregator → broadcaster queue (backpressure point).
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,

    /// Outbound messages buffered per subscriber before it is evicted.
    #[serde(default = "default_subscriber_queue_capacity")]
    pub subscriber_queue_capacity: usize,

    // --- Storage & HTTP ------------------------------------------------------

    #[serde(default = "default_database_url")]
    pub database_url: String,

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Self-ping period for hosts that idle out quiet instances. 0 disables.
    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            feed_url: default_feed_url(),
            feed_token: String::new(),
            max_connect_attempts: default_max_connect_attempts(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            health_check_interval_secs: default_health_check_interval_secs(),
            read_cooldown_ms: default_read_cooldown_ms(),
            flush_interval_ms: default_flush_interval_ms(),
            event_queue_capacity: default_event_queue_capacity(),
            subscriber_queue_capacity: default_subscriber_queue_capacity(),
            database_url: default_database_url(),
            bind_addr: default_bind_addr(),
            keepalive_interval_secs: default_keepalive_interval_secs(),
        }
    }
}

impl ServiceConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// Returns an error when the file is missing or malformed so the caller
    /// can fall back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        info!(path = %path.display(), symbols = ?config.symbols, "config loaded");
        Ok(config)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary key lookup. Blank values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(token) = get("FINNHUB_API_KEY").or_else(|| get("API_KEY")) {
            self.feed_token = token;
        }
        if let Some(syms) = get("CANDLE_SYMBOLS") {
            self.symbols = parse_symbol_list(&syms);
        }
        if let Some(url) = get("DATABASE_URL") {
            self.database_url = url;
        }
        if let Some(addr) = get("BIND_ADDR") {
            self.bind_addr = addr;
        } else if let Some(port) = get("PORT") {
            self.bind_addr = format!("0.0.0.0:{port}");
        }
    }

    /// Reject configurations the relay cannot start with.
    pub fn validate(&self) -> Result<()> {
        if self.feed_token.is_empty() {
            bail!("feed credential is required (set FINNHUB_API_KEY)");
        }
        if self.symbols.is_empty() {
            bail!("at least one symbol must be configured");
        }
        if self.max_connect_attempts == 0 {
            bail!("max_connect_attempts must be at least 1");
        }
        if self.flush_interval_ms == 0 || self.health_check_interval_secs == 0 {
            bail!("flush and health-check intervals must be non-zero");
        }
        if self.read_cooldown_ms == 0 {
            bail!("read_cooldown_ms must be non-zero");
        }
        if self.event_queue_capacity == 0 || self.subscriber_queue_capacity == 0 {
            bail!("queue capacities must be non-zero");
        }
        Ok(())
    }

    /// Port component of `bind_addr`, used by the keep-alive pinger.
    pub fn port(&self) -> Option<u16> {
        self.bind_addr.rsplit(':').next()?.parse().ok()
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn read_cooldown(&self) -> Duration {
        Duration::from_millis(self.read_cooldown_ms)
    }
}

/// Split a comma-separated symbol list, trimming and upper-casing entries.
pub fn parse_symbol_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}
