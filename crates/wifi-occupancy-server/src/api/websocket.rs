//! WebSocket endpoints.
//!
//! ## Device ingest
//!
//! ESP32 nodes connect to `/` or `/ws/device`, optionally with
//! `?device_id=<id>`. See [`crate::session`] for the message protocol.
//!
//! ## Live feed
//!
//! Dashboards connect to `/ws/live` and receive JSON messages tagged with
//! `type`:
//!
//! - `snapshot` - a device snapshot changed
//! - `heartbeat` - keep-alive, every 30s without traffic
//! - `error` - e.g. `MESSAGES_DROPPED` when the client fell behind
//!
//! `?device_id=<id>` limits the feed to one device and `?frames=true`
//! embeds the annotated frame as base64.

use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast;

use super::dto::{DeviceQuery, LiveEvent, LiveMessage, LiveQuery, SnapshotDto};
use super::state::AppState;
use crate::session;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Device connection handler.
#[tracing::instrument(skip(state, ws))]
pub async fn device_ws_handler(
    State(state): State<AppState>,
    Query(query): Query<DeviceQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let device_id = query
        .device_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| state.config().default_device_id.clone());
    ws.on_upgrade(move |socket| session::run_session(socket, state, device_id))
}

/// Live-feed handler.
#[tracing::instrument(skip(state, ws))]
pub async fn live_ws_handler(
    State(state): State<AppState>,
    Query(query): Query<LiveQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_live_socket(socket, state, query))
}

async fn handle_live_socket(socket: WebSocket, state: AppState, query: LiveQuery) {
    let (mut sender, mut receiver) = socket.split();
    let mut broadcast_rx = state.subscribe();

    // Current state first so a new dashboard does not wait for the next update.
    for snapshot in state.cache().list() {
        if !wants(&query, &snapshot.device_id) {
            continue;
        }
        let msg = LiveMessage::Snapshot(SnapshotDto::from_snapshot(&snapshot, query.frames));
        if send_json(&mut sender, &msg).await.is_err() {
            return;
        }
    }

    let forward_task = tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                result = broadcast_rx.recv() => match result {
                    Ok(LiveEvent::Snapshot(snapshot)) => {
                        if !wants(&query, &snapshot.device_id) {
                            continue;
                        }
                        LiveMessage::Snapshot(SnapshotDto::from_snapshot(&snapshot, query.frames))
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(lagged = n, "Live client lagged, messages dropped");
                        LiveMessage::Error {
                            code: "MESSAGES_DROPPED".to_string(),
                            message: format!("{n} messages were dropped due to slow client"),
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = tokio::time::sleep(HEARTBEAT_INTERVAL) => LiveMessage::Heartbeat {
                    timestamp: chrono::Utc::now(),
                },
            };
            if send_json(&mut sender, &msg).await.is_err() {
                break;
            }
        }
    });

    // The feed is one-way; drain client frames until it closes.
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Close(_) => break,
            other => tracing::trace!(?other, "Ignoring live client message"),
        }
    }

    forward_task.abort();
    tracing::debug!("Live client disconnected");
}

fn wants(query: &LiveQuery, device_id: &str) -> bool {
    query.device_id.as_deref().map_or(true, |id| id == device_id)
}

async fn send_json<S>(sender: &mut S, msg: &LiveMessage) -> Result<(), ()>
where
    S: futures_util::Sink<Message> + Unpin,
{
    let json = serde_json::to_string(msg).map_err(|e| {
        tracing::error!(error = %e, "Failed to serialize live message");
    })?;
    sender.send(Message::Text(json.into())).await.map_err(|_| ())
}
