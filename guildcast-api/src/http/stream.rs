// Stream lifecycle HTTP handlers

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use guildcast_core::models::{GuildId, Stream, StreamId, StreamVisibility};
use guildcast_core::service::stream::StartStreamRequest;
use guildcast_live::ServerEvent;

use super::{middleware::AuthUser, AppResult, AppState};

/// Create stream request
#[derive(Debug, Deserialize)]
pub struct CreateStreamRequest {
    pub title: String,
    pub description: Option<String>,
    /// "public" (default) or "guild"
    pub visibility: Option<String>,
    pub guild_id: Option<String>,
    pub category: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<i64>,
}

/// Stream response
#[derive(Debug, Serialize)]
pub struct StreamResponse {
    pub id: String,
    pub host_id: String,
    pub title: String,
    pub description: Option<String>,
    pub visibility: String,
    pub guild_id: Option<String>,
    pub category: Option<String>,
    pub room_id: String,
    pub playback_url: String,
    pub live: bool,
    pub created_at: String,
}

#[derive(Debug, Serialize)]
pub struct ViewerCountResponse {
    pub stream: StreamResponse,
    pub viewer_count: i64,
}

#[derive(Debug, Serialize)]
pub struct ViewerResponse {
    pub user_id: String,
    pub joined_at: String,
}

#[derive(Debug, Serialize)]
pub struct ChatMessageResponse {
    pub id: i64,
    pub user_id: String,
    pub message: String,
    pub created_at: String,
}

#[derive(Debug, Serialize)]
pub struct StreamDetailResponse {
    pub stream: StreamResponse,
    pub viewer_count: i64,
    pub viewers: Vec<ViewerResponse>,
    pub chat: Vec<ChatMessageResponse>,
}

impl StreamResponse {
    fn build(stream: Stream, state: &AppState) -> Self {
        Self {
            playback_url: state.playback_url(&stream.room_id),
            live: state.relay.is_live(&stream.room_id),
            id: stream.id.as_str().to_string(),
            host_id: stream.host_id.as_str().to_string(),
            title: stream.title,
            description: stream.description,
            visibility: stream.visibility.as_str().to_string(),
            guild_id: stream.guild_id.map(|g| g.as_str().to_string()),
            category: stream.category,
            room_id: stream.room_id.as_str().to_string(),
            created_at: stream.created_at.to_rfc3339(),
        }
    }
}

/// POST /api/streams
///
/// Persists the stream record and announces it. The transcoding
/// worker is not started here; that happens when the host's signaling
/// connection sends `start-browser-stream` for the returned room id.
pub async fn create_stream(
    State(state): State<AppState>,
    AuthUser { user_id }: AuthUser,
    Json(req): Json<CreateStreamRequest>,
) -> AppResult<(StatusCode, Json<StreamResponse>)> {
    let visibility = match req.visibility.as_deref() {
        None => StreamVisibility::default(),
        Some(v) => StreamVisibility::from_str(v)?,
    };

    let stream = state
        .stream_service
        .start_stream(
            user_id,
            StartStreamRequest {
                title: req.title,
                description: req.description,
                visibility,
                guild_id: req.guild_id.map(GuildId::from_string),
                category: req.category,
            },
        )
        .await?;

    state.hub.broadcast_all(&ServerEvent::NewStream {
        stream_id: stream.id.clone(),
        room_id: stream.room_id.clone(),
        host_id: stream.host_id.clone(),
        title: stream.title.clone(),
    });

    Ok((
        StatusCode::CREATED,
        Json(StreamResponse::build(stream, &state)),
    ))
}

/// DELETE /api/streams/{stream_id}
///
/// Host-only. Removes the record; any live worker for the room is
/// torn down through the signaling channel, not here.
pub async fn delete_stream(
    State(state): State<AppState>,
    AuthUser { user_id }: AuthUser,
    Path(stream_id): Path<String>,
) -> AppResult<StatusCode> {
    let stream_id = StreamId::from_string(stream_id);
    state.stream_service.stop_stream(&stream_id, &user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/streams/{stream_id}/join
pub async fn join_stream(
    State(state): State<AppState>,
    AuthUser { user_id }: AuthUser,
    Path(stream_id): Path<String>,
) -> AppResult<Json<ViewerCountResponse>> {
    let stream_id = StreamId::from_string(stream_id);
    let (stream, viewer_count) = state
        .stream_service
        .join_stream(&stream_id, &user_id)
        .await?;

    state.hub.broadcast(
        &stream.room_id,
        &ServerEvent::ViewerJoined {
            room_id: stream.room_id.clone(),
            user_id,
            viewer_count,
        },
    );

    Ok(Json(ViewerCountResponse {
        stream: StreamResponse::build(stream, &state),
        viewer_count,
    }))
}

/// POST /api/streams/{stream_id}/leave
pub async fn leave_stream(
    State(state): State<AppState>,
    AuthUser { user_id }: AuthUser,
    Path(stream_id): Path<String>,
) -> AppResult<Json<ViewerCountResponse>> {
    let stream_id = StreamId::from_string(stream_id);
    let (stream, viewer_count) = state
        .stream_service
        .leave_stream(&stream_id, &user_id)
        .await?;

    state.hub.broadcast(
        &stream.room_id,
        &ServerEvent::ViewerLeft {
            room_id: stream.room_id.clone(),
            user_id,
            viewer_count,
        },
    );

    Ok(Json(ViewerCountResponse {
        stream: StreamResponse::build(stream, &state),
        viewer_count,
    }))
}

/// POST /api/streams/{stream_id}/chat
pub async fn send_chat(
    State(state): State<AppState>,
    AuthUser { user_id }: AuthUser,
    Path(stream_id): Path<String>,
    Json(req): Json<ChatRequest>,
) -> AppResult<Json<ChatMessageResponse>> {
    let stream_id = StreamId::from_string(stream_id);
    let (stream, chat) = state
        .stream_service
        .send_chat(&stream_id, &user_id, &req.message)
        .await?;

    state.hub.broadcast(
        &stream.room_id,
        &ServerEvent::NewStreamChat {
            room_id: stream.room_id.clone(),
            user_id,
            message: chat.message.clone(),
            timestamp: chat.created_at,
        },
    );

    Ok(Json(ChatMessageResponse {
        id: chat.id,
        user_id: chat.user_id.as_str().to_string(),
        message: chat.message,
        created_at: chat.created_at.to_rfc3339(),
    }))
}

/// GET /api/streams/{stream_id}
pub async fn get_stream(
    State(state): State<AppState>,
    AuthUser { .. }: AuthUser,
    Path(stream_id): Path<String>,
) -> AppResult<Json<StreamDetailResponse>> {
    let stream_id = StreamId::from_string(stream_id);
    let stream = state.stream_service.get_stream(&stream_id).await?;
    let viewers = state.stream_service.list_viewers(&stream_id).await?;
    let chat = state.stream_service.recent_chat(&stream_id, 50).await?;

    Ok(Json(StreamDetailResponse {
        viewer_count: viewers.len() as i64,
        viewers: viewers
            .into_iter()
            .map(|v| ViewerResponse {
                user_id: v.user_id.as_str().to_string(),
                joined_at: v.joined_at.to_rfc3339(),
            })
            .collect(),
        chat: chat
            .into_iter()
            .map(|c| ChatMessageResponse {
                id: c.id,
                user_id: c.user_id.as_str().to_string(),
                message: c.message,
                created_at: c.created_at.to_rfc3339(),
            })
            .collect(),
        stream: StreamResponse::build(stream, &state),
    }))
}

/// GET /api/streams — public stream discovery
pub async fn list_streams(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> AppResult<Json<Vec<StreamResponse>>> {
    let limit = query.limit.unwrap_or(50);
    let streams = state.stream_service.list_public(limit).await?;
    Ok(Json(
        streams
            .into_iter()
            .map(|s| StreamResponse::build(s, &state))
            .collect(),
    ))
}
