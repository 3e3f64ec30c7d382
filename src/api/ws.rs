// =============================================================================
// WebSocket Handler — Push-based state updates
// =============================================================================
//
// Clients connect to `/api/v1/ws` and receive:
//   1. An immediate full StateSnapshot on connect.
//   2. A fresh snapshot whenever the scheduler publishes a change.
//   3. A fresh snapshot when the API-side version moves (checked every
//      500 ms), e.g. after a row is logged through `/api/logPrice`.
//
// Ping frames are answered with Pong; any text frame is treated as a
// heartbeat and ignored.
// =============================================================================

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

use crate::app_state::AppState;

/// Axum handler for the WebSocket upgrade request.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    info!("WebSocket connection accepted — upgrading");
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
}

/// Manages a single WebSocket connection lifecycle.
async fn handle_ws_connection(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut pipeline_rx = state.scheduler.subscribe();
    let _ = pipeline_rx.borrow_and_update();

    let mut sequence: u64 = 0;
    if let Err(e) = send_snapshot(&mut sender, &state, &mut sequence).await {
        warn!(error = %e, "Failed to send initial WebSocket snapshot");
        return;
    }
    let mut last_api_version = state.state_version.load(Ordering::SeqCst);

    let mut poll = interval(Duration::from_millis(500));

    loop {
        tokio::select! {
            // ── Scheduler published a change ────────────────────────────
            changed = pipeline_rx.changed() => {
                if changed.is_err() {
                    debug!("Scheduler state channel closed — disconnecting");
                    break;
                }
                if let Err(e) = send_snapshot(&mut sender, &state, &mut sequence).await {
                    debug!(error = %e, "WebSocket send failed — disconnecting");
                    break;
                }
            }

            // ── API-side changes ────────────────────────────────────────
            _ = poll.tick() => {
                let current = state.state_version.load(Ordering::SeqCst);
                if current != last_api_version {
                    if let Err(e) = send_snapshot(&mut sender, &state, &mut sequence).await {
                        debug!(error = %e, "WebSocket send failed — disconnecting");
                        break;
                    }
                    last_api_version = current;
                }
            }

            // ── Incoming frames ─────────────────────────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        debug!(msg = %text, "WebSocket text message received (heartbeat)");
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sender.send(Message::Pong(data)).await {
                            debug!(error = %e, "Failed to send Pong — disconnecting");
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Binary(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        info!("WebSocket Close frame received — disconnecting");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket receive error — disconnecting");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    info!(sent = sequence, "WebSocket connection closed");
}

/// Serialize and send the current StateSnapshot.
async fn send_snapshot<S>(
    sender: &mut S,
    state: &Arc<AppState>,
    sequence: &mut u64,
) -> Result<(), axum::Error>
where
    S: futures_util::Sink<Message, Error = axum::Error> + Unpin,
{
    state.ws_sequence_number.fetch_add(1, Ordering::Relaxed);
    *sequence += 1;

    let snapshot = state.build_snapshot();
    match serde_json::to_string(&snapshot) {
        Ok(json) => {
            sender.send(Message::Text(json)).await?;
            debug!(
                version = snapshot.state_version,
                seq = *sequence,
                "WebSocket snapshot sent"
            );
            Ok(())
        }
        Err(e) => {
            // Not a network error; keep the connection.
            warn!(error = %e, "Failed to serialize snapshot");
            Ok(())
        }
    }
}
