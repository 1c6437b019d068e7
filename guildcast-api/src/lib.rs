//! HTTP and WebSocket surface: stream lifecycle REST endpoints, the
//! signaling channel, and the read-only segment publisher.

pub mod http;

pub use http::{create_router, AppError, AppResult, AppState};
