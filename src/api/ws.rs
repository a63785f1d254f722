// =============================================================================
// WebSocket Handler — Live candle subscriptions
// =============================================================================
//
// Clients connect to `/ws` and declare the one symbol they want by sending its
// name as a text message (binary frames holding UTF-8 are accepted too). Each
// new declaration replaces the previous one. Until a symbol is declared the
// client receives nothing.
//
// Outbound traffic never touches the socket from the broadcaster: the
// registry fills a bounded per-connection queue and a writer task owned by
// this connection drains it. When the registry drops the queue (eviction or
// shutdown) the writer sends a Close frame and the connection ends.
// =============================================================================

use std::fmt::Display;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::broadcast::registry::Outbound;
use crate::broadcast::{SubscriberId, SubscriberRegistry};

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let registry = state.registry.clone();
    ws.on_upgrade(move |socket| handle_subscriber(socket, registry))
}

// =============================================================================
// Connection handler
// =============================================================================

async fn handle_subscriber(socket: WebSocket, registry: Arc<SubscriberRegistry>) {
    let (id, outbox) = registry.register();
    let (sender, mut receiver) = socket.split();

    // ── Writer: registry queue → socket ─────────────────────────────────
    let mut writer = tokio::spawn(forward_outbound(outbox, sender, registry.clone(), id));

    // ── Reader: interest declarations ───────────────────────────────────
    loop {
        tokio::select! {
            _ = &mut writer => break,
            msg = receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => declare_interest(&registry, id, &text),
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => declare_interest(&registry, id, &text),
                    Err(_) => debug!(subscriber = %id, "non-UTF-8 binary message ignored"),
                },
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) => {
                    info!(subscriber = %id, "WebSocket Close frame received");
                    break;
                }
                Some(Err(e)) => {
                    warn!(subscriber = %id, error = %e, "WebSocket receive error — disconnecting");
                    break;
                }
                None => break,
            },
        }
    }

    registry.unregister(id);
    writer.abort();
}

/// Drain the subscriber's queue into `sender`, skipping events whose symbol
/// is no longer the declared interest. Sends Close once the queue ends.
async fn forward_outbound<S>(
    mut outbox: mpsc::Receiver<Outbound>,
    mut sender: S,
    registry: Arc<SubscriberRegistry>,
    id: SubscriberId,
) where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    while let Some(outbound) = outbox.recv().await {
        if !registry.is_interested(id, &outbound.symbol) {
            debug!(subscriber = %id, symbol = %outbound.symbol, "interest changed — dropping queued event");
            continue;
        }
        if let Err(e) = sender.send(Message::Text(outbound.payload)).await {
            debug!(subscriber = %id, error = %e, "WebSocket send failed — disconnecting");
            return;
        }
    }
    debug!(subscriber = %id, "outbound queue closed — closing socket");
    let _ = sender.send(Message::Close(None)).await;
}

fn declare_interest(registry: &SubscriberRegistry, id: SubscriberId, raw: &str) {
    if !registry.set_interest(id, raw) {
        debug!(subscriber = %id, "empty interest message ignored");
    }
}
