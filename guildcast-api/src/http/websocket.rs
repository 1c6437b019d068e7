//! Signaling channel: one WebSocket per browser tab.
//!
//! Text frames carry JSON [`ClientEvent`]s; binary frames carry
//! [`ChunkFrame`]-enveloped media chunks for the rooms this connection
//! is broadcasting to. Server pushes arrive through the hub and are
//! drained by a writer task, so a slow socket never blocks fan-out.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

use guildcast_core::models::{RoomId, UserId};
use guildcast_live::{ChunkFrame, ClientEvent, ConnectionId, ServerEvent};

use crate::http::{AppError, AppState};

/// Media chunks ride this socket, so the cap is well above signaling
/// needs but still bounded.
const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

/// GET /api/ws?token={token}
pub async fn websocket_handler(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, AppError> {
    let token = query
        .token
        .ok_or_else(|| AppError::unauthorized("Missing token query parameter"))?;
    let user_id = state.token_service.validate(&token)?;

    Ok(ws
        .max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, state, user_id)))
}

async fn handle_socket(socket: WebSocket, state: AppState, user_id: UserId) {
    let connection_id: ConnectionId = nanoid::nanoid!(12);
    let mut events = state.hub.connect(connection_id.clone(), user_id.clone());
    let (mut sink, mut frames) = socket.split();

    // Writer task: hub events out to the socket as JSON text.
    let writer_conn = connection_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    warn!("Failed to encode {} event: {e}", event.event_type());
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                debug!(connection_id = %writer_conn, "Socket writer closed");
                break;
            }
        }
    });

    while let Some(frame) = frames.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                handle_client_event(&state, &connection_id, &user_id, &text).await;
            }
            Ok(Message::Binary(data)) => {
                // Malformed envelopes are dropped, never fatal. The
                // relay only accepts chunks from the connection that
                // started the room's session.
                if let Some(chunk) = ChunkFrame::decode(&data) {
                    state.relay.feed(&connection_id, chunk);
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(connection_id = %connection_id, "Socket read error: {e}");
                break;
            }
        }
    }

    // Disconnect is an implicit stop for every room this connection
    // was feeding, then the connection leaves all fan-out groups.
    for room_id in state.registry.find_by_connection(&connection_id) {
        state.relay.stop(&room_id).await;
    }
    state.hub.disconnect(&connection_id);
    writer.abort();

    info!(
        connection_id = %connection_id,
        user_id = %user_id,
        "Signaling connection closed"
    );
}

async fn handle_client_event(
    state: &AppState,
    connection_id: &ConnectionId,
    user_id: &UserId,
    text: &str,
) {
    let event: ClientEvent = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(e) => {
            debug!(connection_id = %connection_id, "Unparseable client event: {e}");
            return;
        }
    };

    match event {
        ClientEvent::StartBrowserStream { room_id } => {
            match start_broadcast(state, connection_id, user_id, &room_id).await {
                Ok(playback_url) => {
                    state.hub.join(room_id.clone(), connection_id);
                    state.hub.send_to(
                        connection_id,
                        ServerEvent::StreamReady {
                            room_id,
                            playback_url,
                        },
                    );
                }
                Err(message) => {
                    warn!(room_id = %room_id, user_id = %user_id, "Broadcast start refused: {message}");
                    state
                        .hub
                        .send_to(connection_id, ServerEvent::StreamError { room_id, message });
                }
            }
        }
        ClientEvent::StopBrowserStream { room_id } => {
            // Scoped to the broadcaster: stops from any other
            // connection leave the session running.
            state.relay.stop_from(&room_id, connection_id).await;
            state.hub.leave(&room_id, connection_id);
        }
        ClientEvent::JoinStreamRoom { room_id } => {
            state.hub.join(room_id, connection_id);
        }
        ClientEvent::LeaveStreamRoom { room_id } => {
            state.hub.leave(&room_id, connection_id);
        }
    }
}

/// Authorize against the persisted record, then spin up the worker.
/// Only the stream's host may feed its room, and a record must exist
/// for the room id before anything is spawned.
async fn start_broadcast(
    state: &AppState,
    connection_id: &ConnectionId,
    user_id: &UserId,
    room_id: &RoomId,
) -> Result<String, String> {
    let stream = state
        .stream_service
        .get_stream_by_room(room_id)
        .await
        .map_err(|e| e.to_string())?;

    if stream.host_id != *user_id {
        return Err("Only the stream host can broadcast to this room".to_string());
    }

    state
        .relay
        .start(room_id.clone(), connection_id.clone())
        .await
        .map_err(|e| e.to_string())?;

    Ok(state.playback_url(room_id))
}
