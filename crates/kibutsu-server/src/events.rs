//! WebSocket push of change events to dashboard clients.
//!
//! Delivery is best effort: a client that falls behind the broadcast buffer skips the
//! events it missed and is expected to re-read projects.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kibutsu_common::ChangeEvent;

use crate::AppState;

pub async fn events_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    // Subscribe before upgrading so nothing published during the handshake is lost
    let events_rx = state.orchestrator.notifier().subscribe();
    let shutdown = state.shutdown.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, events_rx, shutdown))
}

async fn handle_socket(
    socket: WebSocket,
    mut events_rx: broadcast::Receiver<ChangeEvent>,
    shutdown: CancellationToken,
) {
    info!("Event subscriber connected");
    let (mut ws_tx, mut ws_rx) = socket.split();

    let mut forward_task = tokio::spawn(async move {
        loop {
            let event = match events_rx.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event subscriber lagged, events dropped");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(e) => {
                    warn!("Failed to serialize change event: {}", e);
                    continue;
                }
            };
            if let Err(e) = ws_tx.send(Message::Text(json)).await {
                debug!("WebSocket send error: {}", e);
                break;
            }
        }
    });

    // Clients only listen; incoming frames matter for close detection
    let mut receive_task = tokio::spawn(async move {
        while let Some(msg) = ws_rx.next().await {
            match msg {
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    });

    tokio::select! {
        _ = &mut forward_task => receive_task.abort(),
        _ = &mut receive_task => forward_task.abort(),
        _ = shutdown.cancelled() => {
            forward_task.abort();
            receive_task.abort();
        }
    }
    info!("Event subscriber disconnected");
}
