use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::id::{GuildId, RoomId, StreamId, UserId};
use crate::Error;

/// Who can discover and watch a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StreamVisibility {
    /// Discoverable by anyone on the platform
    #[default]
    Public,
    /// Scoped to members of the owning guild
    Guild,
}

impl StreamVisibility {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Guild => "guild",
        }
    }
}

impl std::str::FromStr for StreamVisibility {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "public" => Ok(Self::Public),
            "guild" => Ok(Self::Guild),
            other => Err(Error::InvalidInput(format!(
                "Unknown stream visibility: {other}"
            ))),
        }
    }
}

/// Persisted stream record. Created when a broadcast is initiated,
/// deleted when the host stops it. `room_id` is the join key with the
/// in-memory relay session; the two must agree for the stream to be
/// joinable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stream {
    pub id: StreamId,
    pub host_id: UserId,
    pub title: String,
    pub description: Option<String>,
    pub visibility: StreamVisibility,
    pub guild_id: Option<GuildId>,
    pub category: Option<String>,
    pub room_id: RoomId,
    pub thumbnail_url: Option<String>,
    pub producer_track_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Stream {
    #[must_use]
    pub fn new(
        host_id: UserId,
        title: String,
        description: Option<String>,
        visibility: StreamVisibility,
        guild_id: Option<GuildId>,
        category: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: StreamId::new(),
            host_id,
            title,
            description,
            visibility,
            guild_id,
            category,
            room_id: RoomId::new(),
            thumbnail_url: None,
            producer_track_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A viewer entry: identity plus join timestamp. One row per identity
/// per stream; the viewer count is always the number of these rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamViewer {
    pub user_id: UserId,
    pub joined_at: DateTime<Utc>,
}

/// One message in a stream's rolling chat log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChatMessage {
    pub id: i64,
    pub stream_id: StreamId,
    pub user_id: UserId,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visibility_round_trip() {
        assert_eq!(
            "public".parse::<StreamVisibility>().unwrap(),
            StreamVisibility::Public
        );
        assert_eq!(
            "guild".parse::<StreamVisibility>().unwrap(),
            StreamVisibility::Guild
        );
        assert!("friends".parse::<StreamVisibility>().is_err());
    }

    #[test]
    fn test_new_stream_gets_fresh_room_id() {
        let host = UserId::new();
        let a = Stream::new(host.clone(), "a".into(), None, StreamVisibility::Public, None, None);
        let b = Stream::new(host, "b".into(), None, StreamVisibility::Public, None, None);
        assert_ne!(a.room_id, b.room_id);
    }
}
