//! Read-only publisher for transcoder output.
//!
//! Serves `GET /live/{room_id}/{file}` straight off the segment
//! directory the workers write into. No authentication and no
//! directory listing; the room id in the URL is the only capability a
//! viewer needs, and path components are validated so requests can
//! never escape the live root.

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tracing::debug;

const PLAYLIST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";
const SEGMENT_CONTENT_TYPE: &str = "video/mp2t";

#[derive(Clone)]
struct LiveFiles {
    root: Arc<PathBuf>,
}

pub fn create_live_router(root: PathBuf) -> Router {
    Router::new()
        .route("/live/{room_id}/{file}", get(serve_file))
        .with_state(LiveFiles {
            root: Arc::new(root),
        })
}

async fn serve_file(
    Path((room_id, file)): Path<(String, String)>,
    State(state): State<LiveFiles>,
) -> Response {
    if !is_safe_component(&room_id) || !is_safe_component(&file) {
        return StatusCode::NOT_FOUND.into_response();
    }

    // Playlists must not be cached: they are rewritten every segment.
    // Segments are immutable once written, but live only minutes, so
    // the max-age stays short.
    let (content_type, cache_control) = if file.ends_with(".m3u8") {
        (PLAYLIST_CONTENT_TYPE, "no-cache")
    } else if file.ends_with(".ts") {
        (SEGMENT_CONTENT_TYPE, "public, max-age=60")
    } else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let path = state.root.join(&room_id).join(&file);
    match tokio::fs::read(&path).await {
        Ok(bytes) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, content_type),
                (header::CACHE_CONTROL, cache_control),
            ],
            bytes,
        )
            .into_response(),
        Err(e) => {
            debug!(path = %path.display(), "Live file not served: {e}");
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

/// One path component: non-empty, bounded, conservative charset. `..`
/// never passes because consecutive dots are rejected outright.
fn is_safe_component(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 128
        && !s.contains("..")
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
}
