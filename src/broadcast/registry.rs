// =============================================================================
// Subscriber Registry — interest-filtered fan-out to downstream connections
// =============================================================================
//
// Every downstream connection registers here and receives a bounded outbound
// queue; a per-connection writer task drains that queue into the socket.
// Delivery never awaits: a subscriber whose queue is full or closed is treated
// as a failed write and evicted, so one slow client cannot stall the rest.
//
// Locking follows reader/writer discipline: deliveries share a read lock,
// register / set-interest / unregister / eviction take the write lock.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::types::CandleEvent;

pub type SubscriberId = Uuid;

/// One serialized event waiting in a subscriber's queue.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub symbol: String,
    pub payload: String,
}

struct Subscriber {
    /// Declared symbol of interest; `None` until the client sends one.
    interest: Option<String>,
    outbox: mpsc::Sender<Outbound>,
}

pub struct SubscriberRegistry {
    subscribers: RwLock<HashMap<SubscriberId, Subscriber>>,
    queue_capacity: usize,
}

impl SubscriberRegistry {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Add a connection with no declared interest. The receiver yields the
    /// serialized events destined for it and ends once it is evicted.
    pub fn register(&self) -> (SubscriberId, mpsc::Receiver<Outbound>) {
        let id = Uuid::new_v4();
        let (outbox, inbox) = mpsc::channel(self.queue_capacity);
        self.subscribers.write().insert(
            id,
            Subscriber {
                interest: None,
                outbox,
            },
        );
        info!(subscriber = %id, "subscriber registered");
        (id, inbox)
    }

    /// Replace the subscriber's interest with `symbol` (trimmed, upper-cased).
    ///
    /// Returns `false` if the subscriber is gone or `symbol` is blank.
    pub fn set_interest(&self, id: SubscriberId, symbol: &str) -> bool {
        let symbol = symbol.trim().to_uppercase();
        if symbol.is_empty() {
            return false;
        }

        let mut subscribers = self.subscribers.write();
        match subscribers.get_mut(&id) {
            Some(sub) => {
                info!(subscriber = %id, symbol = %symbol, "subscriber interest set");
                sub.interest = Some(symbol);
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub fn interest(&self, id: SubscriberId) -> Option<String> {
        self.subscribers.read().get(&id)?.interest.clone()
    }

    /// Whether `id` is still registered with interest in `symbol`. Writers
    /// call this right before sending a queued event, since interest may
    /// have changed while the event waited.
    pub fn is_interested(&self, id: SubscriberId, symbol: &str) -> bool {
        self.subscribers
            .read()
            .get(&id)
            .is_some_and(|sub| sub.interest.as_deref() == Some(symbol))
    }

    pub fn unregister(&self, id: SubscriberId) -> bool {
        let removed = self.subscribers.write().remove(&id).is_some();
        if removed {
            info!(subscriber = %id, "subscriber unregistered");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Drop every subscriber, closing all outbound queues.
    pub fn clear(&self) {
        let dropped = {
            let mut subscribers = self.subscribers.write();
            let n = subscribers.len();
            subscribers.clear();
            n
        };
        info!(dropped, "subscriber registry cleared");
    }

    /// Push `event` to every subscriber currently interested in its symbol.
    ///
    /// Interest is checked at send time. Returns the number of subscribers
    /// the event was queued for.
    pub fn deliver(&self, event: &CandleEvent) -> usize {
        let payload = match serde_json::to_string(event) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "failed to serialise candle event");
                return 0;
            }
        };

        let mut delivered = 0;
        let mut failed = Vec::new();
        {
            let subscribers = self.subscribers.read();
            for (id, sub) in subscribers.iter() {
                if sub.interest.as_deref() != Some(event.symbol()) {
                    continue;
                }
                let outbound = Outbound {
                    symbol: event.symbol().to_string(),
                    payload: payload.clone(),
                };
                match sub.outbox.try_send(outbound) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        warn!(subscriber = %id, "subscriber queue full — evicting");
                        failed.push(*id);
                    }
                    Err(TrySendError::Closed(_)) => {
                        debug!(subscriber = %id, "subscriber connection gone — evicting");
                        failed.push(*id);
                    }
                }
            }
        }

        if !failed.is_empty() {
            let mut subscribers = self.subscribers.write();
            for id in &failed {
                subscribers.remove(id);
            }
        }

        debug!(
            symbol = %event.symbol(),
            update = %event.update_type,
            delivered,
            evicted = failed.len(),
            "event delivered"
        );
        delivered
    }
}
