// =============================================================================
// Broadcast Coalescer — bounds the rate of live updates sent downstream
// =============================================================================
//
// Live events are parked in a per-symbol slot, each new one overwriting the
// previous (the later snapshot already encloses the earlier high/low/volume).
// Every flush interval all parked events are delivered and the slots cleared.
// Closed events bypass the slots and go out immediately; a parked live event
// for the same symbol belongs to the bucket that just closed and is dropped,
// so a stale live update can never follow its own close.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::registry::SubscriberRegistry;
use crate::types::CandleEvent;

#[derive(Debug, Default)]
pub struct LiveCoalescer {
    pending: BTreeMap<String, CandleEvent>,
}

impl LiveCoalescer {
    /// Accept one event. Returns it back when it must be delivered now.
    pub fn offer(&mut self, event: CandleEvent) -> Option<CandleEvent> {
        if event.is_closed() {
            self.pending.remove(event.symbol());
            return Some(event);
        }
        self.pending.insert(event.symbol().to_string(), event);
        None
    }

    /// Take the latest live event of every symbol, clearing all slots.
    pub fn drain(&mut self) -> Vec<CandleEvent> {
        std::mem::take(&mut self.pending).into_values().collect()
    }

    #[cfg(test)]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Consume aggregator events until `cancel` fires or the queue closes,
/// fanning them out through `registry`.
pub async fn run_broadcaster(
    mut events: mpsc::Receiver<CandleEvent>,
    registry: Arc<SubscriberRegistry>,
    flush_interval: Duration,
    cancel: CancellationToken,
) {
    let mut coalescer = LiveCoalescer::default();
    let mut ticker = interval(flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(flush_ms = flush_interval.as_millis() as u64, "broadcaster started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = events.recv() => match received {
                Some(event) => {
                    if let Some(urgent) = coalescer.offer(event) {
                        registry.deliver(&urgent);
                    }
                }
                None => break,
            },
            _ = ticker.tick() => {
                let batch = coalescer.drain();
                if !batch.is_empty() {
                    debug!(symbols = batch.len(), "flushing live updates");
                }
                for event in &batch {
                    registry.deliver(event);
                }
            }
        }
    }

    info!("broadcaster stopped");
}
