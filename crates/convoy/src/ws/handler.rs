//! WebSocket handler for client connections.

use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::time::{Instant, Interval};

use crate::api::AppState;
use crate::session::{Inbound, SessionHandle, spawn_session};

/// How long the writer may keep flushing once the session has ended.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// WebSocket upgrade handler.
///
/// GET /ws
pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    debug!("WebSocket upgrade request");
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
}

/// Drive one connection: one session actor per socket.
async fn handle_ws_connection(socket: WebSocket, state: AppState) {
    let handle = spawn_session(
        state.session_config.clone(),
        state.collaborators.clone(),
        state.hub.session_token(),
    );
    state.hub.register(&handle);

    let SessionHandle {
        id,
        inbound,
        mut output,
        task,
        ..
    } = handle;
    info!("WebSocket connection opened for session {}", id);

    let (mut sender, mut receiver) = socket.split();

    let session_send = id.clone();
    let keepalive = state.keepalive;
    let mut send_task = tokio::spawn(async move {
        let mut ping = keepalive.map(ping_interval);

        loop {
            tokio::select! {
                event = output.next() => {
                    let Some(event) = event else {
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    };
                    let json = match serde_json::to_string(&event) {
                        Ok(j) => j,
                        Err(e) => {
                            warn!("Failed to serialize event for session {}: {}", session_send, e);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        debug!("Client for session {} went away mid-send", session_send);
                        break;
                    }
                }

                _ = next_ping(&mut ping) => {
                    if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    while let Some(msg_result) = receiver.next().await {
        let forwarded = match msg_result {
            Ok(Message::Text(text)) => Inbound::Text(text.to_string()),
            Ok(Message::Binary(data)) => Inbound::Binary(data.len()),
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Ok(Message::Close(_)) => {
                info!("Client closed WebSocket for session {}", id);
                break;
            }
            Err(e) => {
                warn!("WebSocket error for session {}: {}", id, e);
                break;
            }
        };
        if inbound.send(forwarded).await.is_err() {
            // Actor already stopped, e.g. on server shutdown.
            break;
        }
    }

    let _ = inbound.send(Inbound::Closed).await;
    if let Err(e) = task.await {
        warn!("Session {} actor ended abnormally: {}", id, e);
    }
    if tokio::time::timeout(DRAIN_TIMEOUT, &mut send_task)
        .await
        .is_err()
    {
        send_task.abort();
    }

    state.hub.unregister(&id);
    info!("WebSocket connection closed for session {}", id);
}

fn ping_interval(period: Duration) -> Interval {
    tokio::time::interval_at(Instant::now() + period, period)
}

async fn next_ping(ping: &mut Option<Interval>) {
    match ping {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
