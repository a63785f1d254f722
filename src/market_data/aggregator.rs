// =============================================================================
// Candle Aggregator — turns raw trade ticks into one-minute OHLCV buckets
// =============================================================================
//
// Each symbol owns at most one open bucket. A bucket closes only when a tick
// arrives at or after its close time; quiet symbols never produce empty
// candles. Closing a bucket persists it first and only then emits `Closed`,
// so subscribers never see a close for a candle that is not in the store.
//
// Locking: the symbol map is a parking_lot RwLock touched only to look up (or
// create) a per-symbol slot. Each slot is an async mutex held for the whole
// apply → persist → emit sequence, which keeps events for one symbol in
// order while other symbols proceed independently.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::RwLock;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::store::CandleStore;
use crate::types::{Candle, CandleEvent, TradeTick};

// ---------------------------------------------------------------------------
// Open bucket
// ---------------------------------------------------------------------------

/// The in-progress aggregation window for one symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenBucket {
    pub symbol: String,
    pub open_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
    pub open_price: f64,
    pub high_price: f64,
    pub low_price: f64,
    pub close_price: f64,
    pub volume: i64,
}

impl OpenBucket {
    /// Open a bucket seeded by `tick`. The tick is applied exactly once.
    ///
    /// Fails when the window end is not representable.
    fn open(tick: &TradeTick, duration: TimeDelta) -> Result<Self> {
        let close_time = tick
            .occurred_at
            .checked_add_signed(duration)
            .with_context(|| format!("bucket window overflows at {}", tick.occurred_at))?;
        Ok(Self {
            symbol: tick.symbol.clone(),
            open_time: tick.occurred_at,
            close_time,
            open_price: tick.price,
            high_price: tick.price,
            low_price: tick.price,
            close_price: tick.price,
            volume: tick.volume,
        })
    }

    fn contains(&self, at: DateTime<Utc>) -> bool {
        at < self.close_time
    }

    fn apply(&mut self, tick: &TradeTick) {
        self.close_price = tick.price;
        self.volume += tick.volume;
        if tick.price > self.high_price {
            self.high_price = tick.price;
        }
        if tick.price < self.low_price {
            self.low_price = tick.price;
        }
    }

    pub fn snapshot(&self) -> Candle {
        Candle {
            symbol: self.symbol.clone(),
            open: self.open_price,
            high: self.high_price,
            low: self.low_price,
            close: self.close_price,
            volume: self.volume,
            timestamp: self.open_time,
        }
    }
}

/// Result of applying one tick to a symbol's slot.
#[derive(Debug, Clone, PartialEq)]
pub struct TickOutcome {
    /// The bucket finalized by this tick, if the tick fell past its window.
    pub finalized: Option<Candle>,
    /// Snapshot of the bucket the tick landed in.
    pub live: Candle,
}

/// Apply `tick` to `slot`, rolling the bucket over when the tick falls at or
/// after the current close time. Ticks earlier than the open time (late
/// arrivals) are folded into the current bucket.
///
/// On error the slot is left untouched.
pub fn advance_bucket(
    slot: &mut Option<OpenBucket>,
    tick: &TradeTick,
    duration: TimeDelta,
) -> Result<TickOutcome> {
    if let Some(bucket) = slot.as_mut().filter(|b| b.contains(tick.occurred_at)) {
        bucket.apply(tick);
        return Ok(TickOutcome {
            finalized: None,
            live: bucket.snapshot(),
        });
    }

    let fresh = OpenBucket::open(tick, duration)?;
    let finalized = slot.as_ref().map(OpenBucket::snapshot);
    let live = fresh.snapshot();
    *slot = Some(fresh);
    Ok(TickOutcome { finalized, live })
}

// ---------------------------------------------------------------------------
// CandleAggregator
// ---------------------------------------------------------------------------

type BucketSlot = Arc<Mutex<Option<OpenBucket>>>;

pub struct CandleAggregator {
    bucket_duration: TimeDelta,
    buckets: RwLock<HashMap<String, BucketSlot>>,
    store: Arc<dyn CandleStore>,
    events: mpsc::Sender<CandleEvent>,
}

impl CandleAggregator {
    pub fn new(
        bucket_duration: Duration,
        store: Arc<dyn CandleStore>,
        events: mpsc::Sender<CandleEvent>,
    ) -> Result<Self> {
        let bucket_duration =
            TimeDelta::from_std(bucket_duration).context("bucket duration out of range")?;
        Ok(Self {
            bucket_duration,
            buckets: RwLock::new(HashMap::new()),
            store,
            events,
        })
    }

    fn slot(&self, symbol: &str) -> BucketSlot {
        if let Some(slot) = self.buckets.read().get(symbol) {
            return slot.clone();
        }
        self.buckets
            .write()
            .entry(symbol.to_string())
            .or_default()
            .clone()
    }

    /// Fold one tick into its symbol's bucket and emit the resulting events.
    ///
    /// Blocks when the event queue is full. Errors only when the event
    /// consumer has gone away; persistence failures and unusable ticks are
    /// logged and swallowed.
    pub async fn process_tick(&self, tick: TradeTick) -> Result<()> {
        let slot = self.slot(&tick.symbol);
        let mut bucket = slot.lock().await;

        let outcome = match advance_bucket(&mut bucket, &tick, self.bucket_duration) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(symbol = %tick.symbol, error = %e, "dropping tick");
                return Ok(());
            }
        };

        if let Some(candle) = outcome.finalized {
            match self.store.append(&candle).await {
                Ok(()) => {
                    info!(
                        symbol = %candle.symbol,
                        timestamp = %candle.timestamp,
                        open = candle.open,
                        high = candle.high,
                        low = candle.low,
                        close = candle.close,
                        volume = candle.volume,
                        "candle closed"
                    );
                    self.emit(CandleEvent::closed(candle)).await?;
                }
                Err(e) => {
                    error!(
                        symbol = %candle.symbol,
                        timestamp = %candle.timestamp,
                        error = %e,
                        "failed to persist candle — close event suppressed"
                    );
                }
            }
        }

        debug!(symbol = %tick.symbol, price = tick.price, volume = tick.volume, "tick applied");
        self.emit(CandleEvent::live(outcome.live)).await
    }

    async fn emit(&self, event: CandleEvent) -> Result<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| anyhow!("candle event queue closed"))
    }

    /// Snapshot of the open bucket for `symbol`, if any.
    #[cfg(test)]
    pub async fn open_bucket(&self, symbol: &str) -> Option<OpenBucket> {
        let slot = self.buckets.read().get(symbol).cloned()?;
        let bucket = slot.lock().await;
        bucket.clone()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;

    use crate::types::UpdateType;

    const T0: i64 = 1_700_000_000_000;

    #[derive(Default)]
    struct RecordingStore {
        candles: SyncMutex<Vec<Candle>>,
        fail: bool,
    }

    #[async_trait]
    impl CandleStore for RecordingStore {
        async fn append(&self, candle: &Candle) -> Result<()> {
            if self.fail {
                anyhow::bail!("disk full");
            }
            self.candles.lock().push(candle.clone());
            Ok(())
        }

        async fn query_by_symbol(&self, symbol: &str) -> Result<Vec<Candle>> {
            Ok(self
                .candles
                .lock()
                .iter()
                .filter(|c| c.symbol == symbol)
                .cloned()
                .collect())
        }

        async fn query_all(&self) -> Result<BTreeMap<String, Vec<Candle>>> {
            Ok(BTreeMap::new())
        }
    }

    fn tick(symbol: &str, price: f64, volume: i64, offset_ms: i64) -> TradeTick {
        TradeTick {
            symbol: symbol.into(),
            price,
            volume,
            occurred_at: DateTime::from_timestamp_millis(T0 + offset_ms).unwrap(),
        }
    }

    fn ohlcv(c: &Candle) -> (f64, f64, f64, f64, i64) {
        (c.open, c.high, c.low, c.close, c.volume)
    }

    fn setup(
        store: Arc<RecordingStore>,
    ) -> (CandleAggregator, mpsc::Receiver<CandleEvent>) {
        let (tx, rx) = mpsc::channel(64);
        let agg = CandleAggregator::new(Duration::from_secs(60), store, tx).unwrap();
        (agg, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<CandleEvent>) -> Vec<CandleEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    #[tokio::test]
    async fn worked_example_produces_live_closed_live() {
        let store = Arc::new(RecordingStore::default());
        let (agg, mut rx) = setup(store.clone());

        agg.process_tick(tick("AAPL", 100.0, 10, 0)).await.unwrap();
        agg.process_tick(tick("AAPL", 105.0, 5, 10_000)).await.unwrap();
        agg.process_tick(tick("AAPL", 95.0, 20, 70_000)).await.unwrap();

        let events = drain(&mut rx);
        assert_eq!(events.len(), 4);

        assert_eq!(events[0].update_type, UpdateType::Live);
        assert_eq!(ohlcv(&events[0].candle), (100.0, 100.0, 100.0, 100.0, 10));

        assert_eq!(events[1].update_type, UpdateType::Live);
        assert_eq!(ohlcv(&events[1].candle), (100.0, 105.0, 100.0, 105.0, 15));

        assert_eq!(events[2].update_type, UpdateType::Closed);
        assert_eq!(ohlcv(&events[2].candle), (100.0, 105.0, 100.0, 105.0, 15));
        assert_eq!(events[2].candle.timestamp.timestamp_millis(), T0);

        assert_eq!(events[3].update_type, UpdateType::Live);
        assert_eq!(ohlcv(&events[3].candle), (95.0, 95.0, 95.0, 95.0, 20));
        assert_eq!(events[3].candle.timestamp.timestamp_millis(), T0 + 70_000);

        let persisted = store.candles.lock().clone();
        assert_eq!(persisted, vec![events[2].candle.clone()]);
    }

    #[test]
    fn ticks_within_window_fold_into_one_candle() {
        let prices = [50.0, 52.5, 49.0, 51.0, 53.0, 48.5, 50.5];
        let mut slot = None;
        let duration = TimeDelta::seconds(60);

        for (i, price) in prices.iter().enumerate() {
            let t = tick("MSFT", *price, (i + 1) as i64, i as i64 * 1_000);
            advance_bucket(&mut slot, &t, duration).unwrap();
        }

        let bucket = slot.as_ref().unwrap();
        assert_eq!(bucket.open_price, 50.0);
        assert_eq!(bucket.close_price, 50.5);
        assert_eq!(bucket.high_price, 53.0);
        assert_eq!(bucket.low_price, 48.5);
        assert_eq!(bucket.volume, (1..=7).sum::<i64>());
        assert_eq!(bucket.close_time - bucket.open_time, duration);
    }

    #[test]
    fn new_bucket_applies_seed_tick_once() {
        let mut slot = None;
        let out =
            advance_bucket(&mut slot, &tick("IBM", 10.0, 7, 0), TimeDelta::seconds(60)).unwrap();
        assert!(out.finalized.is_none());
        assert_eq!(out.live.volume, 7);
    }

    #[test]
    fn tick_exactly_at_close_time_rolls_over() {
        let mut slot = None;
        let duration = TimeDelta::seconds(60);
        advance_bucket(&mut slot, &tick("IBM", 10.0, 1, 0), duration).unwrap();

        let inside = advance_bucket(&mut slot, &tick("IBM", 11.0, 1, 59_999), duration).unwrap();
        assert!(inside.finalized.is_none());

        let boundary = advance_bucket(&mut slot, &tick("IBM", 12.0, 1, 60_000), duration).unwrap();
        let closed = boundary.finalized.expect("bucket should close at close time");
        assert_eq!(closed.close, 11.0);
        assert_eq!(closed.volume, 2);
        assert_eq!(boundary.live.open, 12.0);
    }

    #[test]
    fn late_tick_is_folded_into_current_bucket() {
        let mut slot = None;
        let duration = TimeDelta::seconds(60);
        advance_bucket(&mut slot, &tick("NVDA", 400.0, 1, 5_000), duration).unwrap();
        let out = advance_bucket(&mut slot, &tick("NVDA", 390.0, 2, 4_000), duration).unwrap();

        assert!(out.finalized.is_none());
        assert_eq!(out.live.low, 390.0);
        assert_eq!(out.live.volume, 3);
        // Window anchors stay fixed.
        assert_eq!(out.live.timestamp.timestamp_millis(), T0 + 5_000);
    }

    #[tokio::test]
    async fn each_bucket_closes_exactly_once() {
        let store = Arc::new(RecordingStore::default());
        let (agg, mut rx) = setup(store.clone());

        for minute in 0..4 {
            for second in [0, 20, 40] {
                let t = tick("TSLA", 200.0 + minute as f64, 1, minute * 60_000 + second * 1_000);
                agg.process_tick(t).await.unwrap();
            }
        }

        let events = drain(&mut rx);
        let closed: Vec<_> = events.iter().filter(|e| e.is_closed()).collect();
        assert_eq!(closed.len(), 3);

        let mut stamps: Vec<i64> = closed
            .iter()
            .map(|e| e.candle.timestamp.timestamp_millis())
            .collect();
        stamps.dedup();
        assert_eq!(stamps, vec![T0, T0 + 60_000, T0 + 120_000]);
        assert_eq!(store.candles.lock().len(), 3);

        // The final bucket is still open.
        let open = agg.open_bucket("TSLA").await.unwrap();
        assert_eq!(open.open_time.timestamp_millis(), T0 + 180_000);
    }

    #[tokio::test]
    async fn persistence_failure_suppresses_close_but_keeps_streaming() {
        let store = Arc::new(RecordingStore {
            fail: true,
            ..Default::default()
        });
        let (agg, mut rx) = setup(store);

        agg.process_tick(tick("AAPL", 100.0, 1, 0)).await.unwrap();
        agg.process_tick(tick("AAPL", 101.0, 1, 61_000)).await.unwrap();

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| !e.is_closed()));
        assert_eq!(events[1].candle.open, 101.0);
    }

    #[tokio::test]
    async fn symbols_are_bucketed_independently() {
        let store = Arc::new(RecordingStore::default());
        let (agg, mut rx) = setup(store.clone());

        agg.process_tick(tick("AAPL", 100.0, 1, 0)).await.unwrap();
        agg.process_tick(tick("MSFT", 300.0, 1, 30_000)).await.unwrap();
        agg.process_tick(tick("AAPL", 102.0, 1, 65_000)).await.unwrap();

        let events = drain(&mut rx);
        let closed: Vec<_> = events.iter().filter(|e| e.is_closed()).collect();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].symbol(), "AAPL");

        let msft = agg.open_bucket("MSFT").await.unwrap();
        assert_eq!(msft.open_price, 300.0);
        assert!(agg.open_bucket("GOOGL").await.is_none());
    }

    #[test]
    fn unrepresentable_window_leaves_slot_untouched() {
        let duration = TimeDelta::seconds(60);
        let mut slot = None;
        advance_bucket(&mut slot, &tick("IBM", 10.0, 1, 0), duration).unwrap();

        let far = TradeTick {
            occurred_at: DateTime::<Utc>::MAX_UTC,
            ..tick("IBM", 99.0, 5, 0)
        };
        assert!(advance_bucket(&mut slot, &far, duration).is_err());

        let bucket = slot.as_ref().unwrap();
        assert_eq!(bucket.open_time.timestamp_millis(), T0);
        assert_eq!(bucket.close_price, 10.0);
        assert_eq!(bucket.volume, 1);
    }

    #[tokio::test]
    async fn tick_at_end_of_time_is_dropped_without_panicking() {
        let store = Arc::new(RecordingStore::default());
        let (agg, mut rx) = setup(store.clone());

        let far = TradeTick {
            occurred_at: DateTime::<Utc>::MAX_UTC,
            ..tick("AAPL", 100.0, 1, 0)
        };
        agg.process_tick(far).await.unwrap();
        assert!(drain(&mut rx).is_empty());
        assert!(agg.open_bucket("AAPL").await.is_none());

        agg.process_tick(tick("AAPL", 101.0, 2, 0)).await.unwrap();
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(ohlcv(&events[0].candle), (101.0, 101.0, 101.0, 101.0, 2));
        assert!(store.candles.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn full_event_queue_blocks_producer() {
        let (tx, mut rx) = mpsc::channel(1);
        let agg = Arc::new(
            CandleAggregator::new(
                Duration::from_secs(60),
                Arc::new(RecordingStore::default()),
                tx,
            )
            .unwrap(),
        );

        agg.process_tick(tick("AAPL", 100.0, 1, 0)).await.unwrap();

        let blocked = tokio::spawn({
            let agg = agg.clone();
            async move { agg.process_tick(tick("AAPL", 101.0, 1, 1_000)).await }
        });
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!blocked.is_finished(), "producer must wait for queue space");

        let first = rx.recv().await.unwrap();
        assert_eq!(first.candle.volume, 1);
        blocked.await.unwrap().unwrap();

        let second = rx.recv().await.unwrap();
        assert_eq!(ohlcv(&second.candle), (100.0, 101.0, 100.0, 101.0, 2));
    }

    #[tokio::test]
    async fn process_tick_fails_once_consumer_is_gone() {
        let (agg, rx) = setup(Arc::new(RecordingStore::default()));
        drop(rx);
        assert!(agg.process_tick(tick("AAPL", 1.0, 1, 0)).await.is_err());
    }
}
