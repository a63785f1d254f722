// =============================================================================
// SQLite Candle Store — sqlx-backed persistence for closed candles
// =============================================================================

use std::collections::BTreeMap;
use std::str::FromStr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::DateTime;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::info;

use super::CandleStore;
use crate::types::Candle;

const MAX_FILE_CONNECTIONS: u32 = 5;

#[derive(Clone)]
pub struct SqliteCandleStore {
    pool: SqlitePool,
}

impl SqliteCandleStore {
    /// Open (creating if needed) the database at `url` and run migrations.
    ///
    /// In-memory databases are private to a connection, so they get a pool
    /// of exactly one connection that is never recycled.
    pub async fn open(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("invalid database url {url}"))?
            .create_if_missing(true);

        let pool_options = if url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(MAX_FILE_CONNECTIONS)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open candle database {url}"))?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to migrate candle database")?;

        info!(url = %url, "candle store ready");
        Ok(Self { pool })
    }
}

fn map_candle_row(row: &SqliteRow) -> Result<Candle> {
    let timestamp_ms: i64 = row.try_get("timestamp_ms")?;
    let timestamp = DateTime::from_timestamp_millis(timestamp_ms)
        .with_context(|| format!("stored timestamp out of range: {timestamp_ms}"))?;

    Ok(Candle {
        symbol: row.try_get("symbol")?,
        open: row.try_get("open")?,
        high: row.try_get("high")?,
        low: row.try_get("low")?,
        close: row.try_get("close")?,
        volume: row.try_get("volume")?,
        timestamp,
    })
}

#[async_trait]
impl CandleStore for SqliteCandleStore {
    async fn append(&self, candle: &Candle) -> Result<()> {
        sqlx::query(
            "INSERT INTO candles (symbol, open, high, low, close, volume, timestamp_ms) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&candle.symbol)
        .bind(candle.open)
        .bind(candle.high)
        .bind(candle.low)
        .bind(candle.close)
        .bind(candle.volume)
        .bind(candle.timestamp.timestamp_millis())
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to insert candle for {}", candle.symbol))?;

        Ok(())
    }

    async fn query_by_symbol(&self, symbol: &str) -> Result<Vec<Candle>> {
        let rows = sqlx::query(
            "SELECT symbol, open, high, low, close, volume, timestamp_ms \
             FROM candles WHERE symbol = ? ORDER BY timestamp_ms ASC, id ASC",
        )
        .bind(symbol)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("failed to query candles for {symbol}"))?;

        rows.iter().map(map_candle_row).collect()
    }

    async fn query_all(&self) -> Result<BTreeMap<String, Vec<Candle>>> {
        let rows = sqlx::query(
            "SELECT symbol, open, high, low, close, volume, timestamp_ms \
             FROM candles ORDER BY timestamp_ms ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to query candle history")?;

        let mut grouped: BTreeMap<String, Vec<Candle>> = BTreeMap::new();
        for row in &rows {
            let candle = map_candle_row(row)?;
            grouped.entry(candle.symbol.clone()).or_default().push(candle);
        }
        Ok(grouped)
    }
}
