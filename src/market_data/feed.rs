// =============================================================================
// Upstream Feed Connector — resilient trade-feed WebSocket client
// =============================================================================
//
// One connection multiplexes every tracked symbol. The lifecycle is:
//
//   Disconnected → Connecting → Subscribing → Connected → (Disconnected)
//
// Two long-running tasks share the connector:
//   - the read loop decodes frames and hands ticks to the aggregator;
//   - the health monitor reconnects when not Connected and otherwise sends a
//     liveness Ping, reconnecting if that send fails.
//
// The write half lives behind an async mutex owned by the state machine. Each
// successful connect hands the read half to the read loop tagged with a
// session id, so a late failure on an old socket never knocks a newer session
// back to Disconnected.
// =============================================================================

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::RwLock;
use serde::Deserialize;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ServiceConfig, BUCKET_DURATION};
use crate::market_data::aggregator::CandleAggregator;
use crate::types::{ConnectionState, TradeTick};

pub type FeedSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;
pub type FeedStream = Pin<Box<dyn Stream<Item = Result<Message, WsError>> + Send>>;

/// Read halves waiting to be adopted by the read loop.
const READER_HANDOFF_CAPACITY: usize = 4;

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Opens a fresh transport connection to the feed.
#[async_trait]
pub trait FeedDialer: Send + Sync {
    async fn dial(&self) -> Result<(FeedSink, FeedStream)>;
}

/// Dials the Finnhub trade WebSocket, authenticating with a query token.
pub struct FinnhubDialer {
    url: String,
    token: String,
}

impl FinnhubDialer {
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
        }
    }
}

#[async_trait]
impl FeedDialer for FinnhubDialer {
    async fn dial(&self) -> Result<(FeedSink, FeedStream)> {
        let url = format!("{}?token={}", self.url, self.token);
        let (ws_stream, _response) = connect_async(url.as_str())
            .await
            .context("failed to connect to trade feed WebSocket")?;

        let (write, read) = ws_stream.split();
        Ok((Box::pin(write), Box::pin(read)))
    }
}

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct FeedFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct TradeWire {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "p")]
    price: f64,
    #[serde(rename = "v")]
    volume: i64,
    #[serde(rename = "t")]
    timestamp_ms: i64,
}

/// Decode one feed frame into zero or more ticks.
///
/// Expected shape:
/// ```json
/// { "type": "trade", "data": [{ "s": "AAPL", "p": 187.3, "v": 100, "t": 1700000000000 }] }
/// ```
/// Frames of any other type decode to an empty list.
pub fn decode_frame(text: &str) -> Result<Vec<TradeTick>> {
    let frame: FeedFrame = serde_json::from_str(text).context("failed to parse feed frame")?;
    if frame.kind != "trade" {
        return Ok(Vec::new());
    }

    let trades: Vec<TradeWire> =
        serde_json::from_value(frame.data).context("malformed trade payload")?;

    let horizon = TimeDelta::from_std(BUCKET_DURATION).context("bucket duration out of range")?;

    trades
        .into_iter()
        .map(|t| {
            // The tick must also be able to anchor a bucket window.
            let occurred_at = DateTime::from_timestamp_millis(t.timestamp_ms)
                .filter(|at| at.checked_add_signed(horizon).is_some())
                .with_context(|| format!("trade timestamp out of range: {}", t.timestamp_ms))?;
            Ok(TradeTick {
                symbol: t.symbol,
                price: t.price,
                volume: t.volume,
                occurred_at,
            })
        })
        .collect()
}

fn subscribe_message(symbol: &str) -> Message {
    Message::Text(serde_json::json!({ "type": "subscribe", "symbol": symbol }).to_string())
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct FeedSettings {
    pub symbols: Vec<String>,
    pub max_connect_attempts: u32,
    pub reconnect_base_delay: Duration,
    pub health_check_interval: Duration,
    pub read_cooldown: Duration,
}

impl FeedSettings {
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self {
            symbols: config.symbols.clone(),
            max_connect_attempts: config.max_connect_attempts,
            reconnect_base_delay: config.reconnect_base_delay(),
            health_check_interval: config.health_check_interval(),
            read_cooldown: config.read_cooldown(),
        }
    }
}

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

struct Session {
    id: u64,
    sink: FeedSink,
}

#[derive(Debug, Clone, Copy)]
struct LinkStatus {
    state: ConnectionState,
    session_id: Option<u64>,
}

type ReaderHandoff = (u64, FeedStream);

enum ReadStep {
    Cancelled,
    Handoff(Option<ReaderHandoff>),
    Frame(Option<Result<Message, WsError>>),
}

pub struct FeedConnector {
    settings: FeedSettings,
    dialer: Arc<dyn FeedDialer>,
    aggregator: Arc<CandleAggregator>,
    status: RwLock<LinkStatus>,
    session: Mutex<Option<Session>>,
    next_session_id: AtomicU64,
    readers_tx: mpsc::Sender<ReaderHandoff>,
    readers_rx: parking_lot::Mutex<Option<mpsc::Receiver<ReaderHandoff>>>,
    last_probe_at: RwLock<Option<DateTime<Utc>>>,
}

impl FeedConnector {
    pub fn new(
        settings: FeedSettings,
        dialer: Arc<dyn FeedDialer>,
        aggregator: Arc<CandleAggregator>,
    ) -> Self {
        let (readers_tx, readers_rx) = mpsc::channel(READER_HANDOFF_CAPACITY);
        Self {
            settings,
            dialer,
            aggregator,
            status: RwLock::new(LinkStatus {
                state: ConnectionState::Disconnected,
                session_id: None,
            }),
            session: Mutex::new(None),
            next_session_id: AtomicU64::new(0),
            readers_tx,
            readers_rx: parking_lot::Mutex::new(Some(readers_rx)),
            last_probe_at: RwLock::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.status.read().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Time of the last successful connect or liveness probe.
    pub fn last_probe_at(&self) -> Option<DateTime<Utc>> {
        *self.last_probe_at.read()
    }

    fn set_state(&self, state: ConnectionState) {
        let mut status = self.status.write();
        status.state = state;
        if state != ConnectionState::Connected {
            status.session_id = None;
        }
    }

    /// Mark the link Disconnected, but only if `session_id` is still current.
    fn mark_disconnected(&self, session_id: u64) {
        let mut status = self.status.write();
        if status.session_id == Some(session_id) {
            status.state = ConnectionState::Disconnected;
            status.session_id = None;
            warn!(session = session_id, "feed connection marked disconnected");
        }
    }

    // -------------------------------------------------------------------------
    // Connect / subscribe
    // -------------------------------------------------------------------------

    /// Tear down any existing session and establish a new one.
    ///
    /// Retries up to `max_connect_attempts` times, waiting `attempt * base`
    /// between attempts. Returns `false` when every attempt failed; the
    /// connector then stays Disconnected until the next health check.
    pub async fn connect(&self) -> bool {
        let mut session = self.session.lock().await;

        if let Some(mut old) = session.take() {
            if let Err(e) = old.sink.close().await {
                debug!(session = old.id, error = %e, "error closing previous feed session");
            }
        }
        self.set_state(ConnectionState::Disconnected);

        let max = self.settings.max_connect_attempts;
        for attempt in 1..=max {
            self.set_state(ConnectionState::Connecting);
            info!(attempt, max, "connecting to trade feed");

            match self.dialer.dial().await {
                Ok((mut sink, stream)) => {
                    self.set_state(ConnectionState::Subscribing);
                    match self.subscribe_all(&mut sink).await {
                        Ok(()) => {
                            let id = self.next_session_id.fetch_add(1, Ordering::Relaxed) + 1;
                            *session = Some(Session { id, sink });
                            *self.status.write() = LinkStatus {
                                state: ConnectionState::Connected,
                                session_id: Some(id),
                            };
                            *self.last_probe_at.write() = Some(Utc::now());
                            // Publish the session before the reader can fail it.
                            if self.readers_tx.send((id, stream)).await.is_err() {
                                warn!("feed read loop is not running — frames will not be read");
                            }
                            info!(
                                session = id,
                                symbols = self.settings.symbols.len(),
                                "trade feed connected"
                            );
                            return true;
                        }
                        Err(e) => {
                            warn!(attempt, error = %e, "feed subscription failed — abandoning connection");
                            if let Err(e) = sink.close().await {
                                debug!(error = %e, "error closing abandoned feed connection");
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(attempt, max, error = %e, "feed connection attempt failed");
                }
            }

            self.set_state(ConnectionState::Disconnected);
            if attempt < max {
                sleep(self.settings.reconnect_base_delay * attempt).await;
            }
        }

        error!(attempts = max, "giving up on trade feed until next health check");
        false
    }

    async fn subscribe_all(&self, sink: &mut FeedSink) -> Result<()> {
        for symbol in &self.settings.symbols {
            sink.send(subscribe_message(symbol))
                .await
                .with_context(|| format!("failed to subscribe to {symbol}"))?;
            debug!(symbol = %symbol, "subscribed");
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Health monitor
    // -------------------------------------------------------------------------

    /// One health-check pass: reconnect if not Connected, otherwise probe.
    pub async fn health_check(&self) {
        if !self.is_connected() {
            info!(state = %self.state(), "feed connection unhealthy — reconnecting");
            self.connect().await;
            return;
        }

        if let Err(e) = self.probe().await {
            warn!(error = %e, "feed liveness probe failed — reconnecting");
            self.set_state(ConnectionState::Disconnected);
            self.connect().await;
        }
    }

    async fn probe(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        let current = session.as_mut().context("no active feed session")?;
        current
            .sink
            .send(Message::Ping(Vec::new()))
            .await
            .context("failed to send ping")?;
        *self.last_probe_at.write() = Some(Utc::now());
        debug!(session = current.id, "feed liveness probe sent");
        Ok(())
    }

    /// Periodic health checks until `cancel` fires; the first check runs
    /// immediately and performs the initial connect. Closes the upstream
    /// connection on exit.
    pub async fn run_health_monitor(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = interval(self.settings.health_check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.health_check() => {}
            }
        }

        self.shutdown().await;
    }

    /// Close the upstream connection and mark the link Disconnected.
    pub async fn shutdown(&self) {
        let mut session = self.session.lock().await;
        if let Some(mut current) = session.take() {
            if let Err(e) = current.sink.close().await {
                debug!(error = %e, "error closing feed connection");
            }
        }
        self.set_state(ConnectionState::Disconnected);
        info!("trade feed connection closed");
    }

    // -------------------------------------------------------------------------
    // Read loop
    // -------------------------------------------------------------------------

    /// Read frames from the current session until `cancel` fires.
    ///
    /// Returns an error if started twice or if the aggregator's event
    /// consumer has gone away.
    pub async fn run_read_loop(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let mut readers = self
            .readers_rx
            .lock()
            .take()
            .context("feed read loop already running")?;
        let mut current: Option<ReaderHandoff> = None;

        loop {
            let Some((session_id, stream)) = current.as_mut() else {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    handoff = readers.recv() => match handoff {
                        Some(fresh) => current = Some(fresh),
                        None => break,
                    },
                    _ = sleep(self.settings.read_cooldown) => {
                        debug!("no active feed connection — waiting for reconnection");
                    }
                }
                continue;
            };
            let session_id = *session_id;

            let step = tokio::select! {
                _ = cancel.cancelled() => ReadStep::Cancelled,
                handoff = readers.recv() => ReadStep::Handoff(handoff),
                frame = stream.next() => ReadStep::Frame(frame),
            };

            match step {
                ReadStep::Cancelled => break,
                ReadStep::Handoff(Some(fresh)) => current = Some(fresh),
                ReadStep::Handoff(None) => break,
                ReadStep::Frame(Some(Ok(msg))) => self.handle_message(msg).await?,
                ReadStep::Frame(failure) => {
                    match failure {
                        Some(Err(e)) => {
                            error!(session = session_id, error = %e, "feed read error")
                        }
                        _ => warn!(session = session_id, "feed stream ended"),
                    }
                    self.mark_disconnected(session_id);
                    current = None;

                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = sleep(self.settings.read_cooldown) => {}
                    }
                }
            }
        }

        debug!("feed read loop stopped");
        Ok(())
    }

    async fn handle_message(&self, msg: Message) -> Result<()> {
        match msg {
            Message::Text(text) => match decode_frame(&text) {
                Ok(ticks) => {
                    for tick in ticks {
                        debug!(symbol = %tick.symbol, price = tick.price, volume = tick.volume, "trade received");
                        self.aggregator.process_tick(tick).await?;
                    }
                }
                Err(e) => warn!(error = %e, "skipping undecodable feed frame"),
            },
            // tungstenite queues the Pong reply itself.
            Message::Ping(_) => debug!("ping received from feed"),
            Message::Pong(_) => debug!("pong received from feed"),
            Message::Close(frame) => info!(frame = ?frame, "feed sent close frame"),
            Message::Binary(_) | Message::Frame(_) => debug!("ignoring non-text feed frame"),
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
