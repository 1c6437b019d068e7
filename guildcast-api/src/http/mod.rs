// Module: http
// HTTP/JSON REST API plus the WebSocket signaling channel

pub mod error;
pub mod health;
pub mod live;
pub mod middleware;
pub mod stream;
pub mod websocket;

use axum::{
    routing::{delete, get, post},
    Router,
};
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use guildcast_core::models::RoomId;
use guildcast_core::service::{StreamService, TokenService};
use guildcast_live::{SessionRegistry, StreamHub, StreamRelay};

pub use error::{AppError, AppResult};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub stream_service: Arc<StreamService>,
    pub token_service: Arc<TokenService>,
    pub hub: Arc<StreamHub>,
    pub relay: Arc<StreamRelay>,
    pub registry: Arc<SessionRegistry>,
    /// Externally visible base; playback URLs are built from it.
    pub playback_base: String,
}

impl AppState {
    /// Playback URL for a room's rolling playlist
    #[must_use]
    pub fn playback_url(&self, room_id: &RoomId) -> String {
        format!(
            "{}/live/{}/index.m3u8",
            self.playback_base.trim_end_matches('/'),
            room_id
        )
    }
}

/// Create the HTTP router with all routes
pub fn create_router(state: AppState, live_root: PathBuf) -> Router {
    let api = Router::new()
        .merge(health::create_health_router())
        // Stream lifecycle
        .route("/api/streams", post(stream::create_stream))
        .route("/api/streams", get(stream::list_streams))
        .route("/api/streams/{stream_id}", get(stream::get_stream))
        .route("/api/streams/{stream_id}", delete(stream::delete_stream))
        .route("/api/streams/{stream_id}/join", post(stream::join_stream))
        .route("/api/streams/{stream_id}/leave", post(stream::leave_stream))
        .route("/api/streams/{stream_id}/chat", post(stream::send_chat))
        // Signaling channel
        .route("/api/ws", get(websocket::websocket_handler))
        .with_state(state);

    Router::new()
        .merge(api)
        .merge(live::create_live_router(live_root))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}
