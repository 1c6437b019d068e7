//! Streaming core for Guildcast: the in-memory session registry, the
//! per-room transcoding worker adapter, and the signaling fan-out hub.
//!
//! One broadcast room maps to at most one external ffmpeg worker. The
//! broadcaster's browser pushes raw media chunks over the signaling
//! channel; the worker turns them into a rolling HLS window on disk,
//! which the HTTP layer serves to viewers.

pub mod error;
pub mod events;
pub mod hub;
pub mod registry;
pub mod relay;
pub mod worker;

pub use error::LiveError;
pub use events::{ChunkFrame, ClientEvent, ServerEvent};
pub use hub::StreamHub;
pub use registry::{ConnectionId, SessionHandle, SessionRegistry};
pub use relay::StreamRelay;
pub use worker::{FfmpegSpawner, SpawnedWorker, WorkerSpawner};
