pub mod sqlite;

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;

use crate::types::Candle;

pub use sqlite::SqliteCandleStore;

/// Durable home of closed candles.
///
/// The aggregator only ever appends; the HTTP layer only ever reads.
#[async_trait]
pub trait CandleStore: Send + Sync {
    /// Persist one closed candle.
    async fn append(&self, candle: &Candle) -> Result<()>;

    /// All candles for `symbol`, oldest first.
    async fn query_by_symbol(&self, symbol: &str) -> Result<Vec<Candle>>;

    /// All candles grouped by symbol, each series oldest first.
    async fn query_all(&self) -> Result<BTreeMap<String, Vec<Candle>>>;
}
