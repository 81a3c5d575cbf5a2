//! `/ws/events`: a push-only channel forwarding `JobEvent` snapshots from
//! the job engine's broadcast channel to the client as `job_update`
//! envelopes (§6). No handshake or client->server RPC — subscribers just
//! listen.

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{dto::EventEnvelope, state::AppState};

pub async fn handle_connection(socket: WebSocket, state: AppState) {
    let conn_id = uuid::Uuid::new_v4();
    info!(conn_id = %conn_id, "ws: new connection");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

    let write_conn_id = conn_id;
    let write_handle = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if ws_tx.send(Message::Text(msg.into())).await.is_err() {
                debug!(conn_id = %write_conn_id, "ws: write loop closed");
                break;
            }
        }
    });

    let mut events = state.engine.subscribe();
    let forward_conn_id = conn_id;
    let forward_tx = out_tx.clone();
    let forward_handle = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let envelope = EventEnvelope::job_update(event.job);
                    let Ok(text) = serde_json::to_string(&envelope) else { continue };
                    if forward_tx.send(text).is_err() {
                        break;
                    }
                },
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(conn_id = %forward_conn_id, skipped, "ws: client lagged, some job updates dropped");
                    let envelope = EventEnvelope::notification(format!("missed {skipped} job update(s), reconnect or re-fetch job status"));
                    let Ok(text) = serde_json::to_string(&envelope) else { continue };
                    if forward_tx.send(text).is_err() {
                        break;
                    }
                },
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // Drain inbound frames only to detect the client closing the socket;
    // this channel carries no client->server protocol.
    while let Some(frame) = ws_rx.next().await {
        if frame.is_err() {
            break;
        }
    }

    forward_handle.abort();
    drop(out_tx);
    let _ = write_handle.await;
    info!(conn_id = %conn_id, "ws: connection closed");
}
