//! Signaling channel event types and the binary chunk envelope.
//!
//! Control events travel as JSON text frames; raw media chunks travel
//! as binary frames framed by [`ChunkFrame`] so one connection can feed
//! more than one room.

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use guildcast_core::models::{RoomId, StreamId, UserId};
use serde::{Deserialize, Serialize};

/// Events a browser sends to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientEvent {
    /// Broadcaster asks the relay to start transcoding for its room.
    StartBrowserStream { room_id: RoomId },
    /// Broadcaster is done; tear the worker down.
    StopBrowserStream { room_id: RoomId },
    /// Join a room's fan-out group (broadcaster or viewer).
    JoinStreamRoom { room_id: RoomId },
    /// Leave a room's fan-out group.
    LeaveStreamRoom { room_id: RoomId },
}

/// Events the server pushes to connected browsers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// The worker is up; playback can start at `playback_url`.
    StreamReady { room_id: RoomId, playback_url: String },
    /// Starting the worker failed.
    StreamError { room_id: RoomId, message: String },
    /// The worker exited (for any reason); the stream is over.
    StreamEnded { room_id: RoomId },
    /// Global notification: a new stream was created.
    NewStream {
        stream_id: StreamId,
        room_id: RoomId,
        host_id: UserId,
        title: String,
    },
    ViewerJoined {
        room_id: RoomId,
        user_id: UserId,
        viewer_count: i64,
    },
    ViewerLeft {
        room_id: RoomId,
        user_id: UserId,
        viewer_count: i64,
    },
    NewStreamChat {
        room_id: RoomId,
        user_id: UserId,
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl ServerEvent {
    /// Event name as it appears on the wire, for logging
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::StreamReady { .. } => "stream-ready",
            Self::StreamError { .. } => "stream-error",
            Self::StreamEnded { .. } => "stream-ended",
            Self::NewStream { .. } => "new-stream",
            Self::ViewerJoined { .. } => "viewer-joined",
            Self::ViewerLeft { .. } => "viewer-left",
            Self::NewStreamChat { .. } => "new-stream-chat",
        }
    }
}

/// A raw media chunk addressed to a room: `[len: u8][room id][payload]`.
///
/// Chunks are loss tolerant; anything malformed is dropped by the
/// caller rather than erroring the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFrame {
    pub room_id: RoomId,
    pub payload: Bytes,
}

impl ChunkFrame {
    /// Room ids are 12-char nanoids today; the length prefix leaves
    /// headroom without admitting absurd values.
    const MAX_ROOM_ID_LEN: usize = 64;

    #[must_use]
    pub fn new(room_id: RoomId, payload: Bytes) -> Self {
        Self { room_id, payload }
    }

    /// Encode for the wire; `None` when the room id exceeds the frame
    /// bound, which the length prefix could not represent faithfully.
    #[must_use]
    pub fn encode(&self) -> Option<Bytes> {
        let id = self.room_id.as_str().as_bytes();
        if id.is_empty() || id.len() > Self::MAX_ROOM_ID_LEN {
            return None;
        }
        let mut buf = BytesMut::with_capacity(1 + id.len() + self.payload.len());
        buf.put_u8(id.len() as u8);
        buf.put_slice(id);
        buf.put_slice(&self.payload);
        Some(buf.freeze())
    }

    /// Decode a binary signaling frame; `None` means the frame is
    /// malformed and should be dropped.
    #[must_use]
    pub fn decode(data: &[u8]) -> Option<Self> {
        let (&len, rest) = data.split_first()?;
        let len = len as usize;
        if len == 0 || len > Self::MAX_ROOM_ID_LEN || rest.len() < len {
            return None;
        }
        let room_id = std::str::from_utf8(&rest[..len]).ok()?;
        Some(Self {
            room_id: RoomId::from_string(room_id.to_string()),
            payload: Bytes::copy_from_slice(&rest[len..]),
        })
    }
}
