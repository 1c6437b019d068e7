use async_trait::async_trait;
use chrono::Utc;
use sqlx::{postgres::PgRow, PgPool, Row};
use std::str::FromStr;

use crate::{
    models::{RoomId, Stream, StreamChatMessage, StreamId, StreamViewer, StreamVisibility, UserId},
    Result,
};

/// Number of chat messages retained per stream; older rows are trimmed
/// on insert.
const CHAT_LOG_LIMIT: i64 = 200;

/// Persistence boundary for stream records, viewer lists, and the
/// rolling chat log. The service layer talks to this trait only, so
/// its authorization paths can be exercised against an in-memory
/// store.
#[async_trait]
pub trait StreamStore: Send + Sync {
    async fn create(&self, stream: &Stream) -> Result<Stream>;
    async fn get_by_id(&self, stream_id: &StreamId) -> Result<Option<Stream>>;
    async fn get_by_room(&self, room_id: &RoomId) -> Result<Option<Stream>>;
    async fn list(&self, visibility: Option<StreamVisibility>, limit: i64) -> Result<Vec<Stream>>;
    async fn delete(&self, stream_id: &StreamId) -> Result<bool>;
    async fn add_viewer(&self, stream_id: &StreamId, user_id: &UserId) -> Result<()>;
    async fn remove_viewer(&self, stream_id: &StreamId, user_id: &UserId) -> Result<()>;
    async fn count_viewers(&self, stream_id: &StreamId) -> Result<i64>;
    async fn list_viewers(&self, stream_id: &StreamId) -> Result<Vec<StreamViewer>>;
    async fn add_chat_message(
        &self,
        stream_id: &StreamId,
        user_id: &UserId,
        message: &str,
    ) -> Result<StreamChatMessage>;
    async fn recent_chat(&self, stream_id: &StreamId, limit: i64)
        -> Result<Vec<StreamChatMessage>>;
}

/// Stream record repository for database operations
#[derive(Clone)]
pub struct StreamRepository {
    pool: PgPool,
}

impl StreamRepository {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_stream(row: &PgRow) -> Result<Stream> {
        let visibility: String = row.try_get("visibility").map_err(crate::Error::from)?;
        let guild_id: Option<String> = row.try_get("guild_id").map_err(crate::Error::from)?;

        Ok(Stream {
            id: StreamId::from_string(row.try_get("id").map_err(crate::Error::from)?),
            host_id: UserId::from_string(row.try_get("host_id").map_err(crate::Error::from)?),
            title: row.try_get("title").map_err(crate::Error::from)?,
            description: row.try_get("description").map_err(crate::Error::from)?,
            visibility: StreamVisibility::from_str(&visibility)?,
            guild_id: guild_id.map(crate::models::GuildId::from_string),
            category: row.try_get("category").map_err(crate::Error::from)?,
            room_id: RoomId::from_string(row.try_get("room_id").map_err(crate::Error::from)?),
            thumbnail_url: row.try_get("thumbnail_url").map_err(crate::Error::from)?,
            producer_track_id: row
                .try_get("producer_track_id")
                .map_err(crate::Error::from)?,
            created_at: row.try_get("created_at").map_err(crate::Error::from)?,
            updated_at: row.try_get("updated_at").map_err(crate::Error::from)?,
        })
    }

    fn row_to_chat_message(row: &PgRow) -> Result<StreamChatMessage> {
        Ok(StreamChatMessage {
            id: row.try_get("id").map_err(crate::Error::from)?,
            stream_id: StreamId::from_string(
                row.try_get("stream_id").map_err(crate::Error::from)?,
            ),
            user_id: UserId::from_string(row.try_get("user_id").map_err(crate::Error::from)?),
            message: row.try_get("message").map_err(crate::Error::from)?,
            created_at: row.try_get("created_at").map_err(crate::Error::from)?,
        })
    }
}

#[async_trait]
impl StreamStore for StreamRepository {
    /// Create a new stream record
    async fn create(&self, stream: &Stream) -> Result<Stream> {
        let row = sqlx::query(
            "INSERT INTO streams (id, host_id, title, description, visibility, guild_id,
                                  category, room_id, thumbnail_url, producer_track_id,
                                  created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
             RETURNING id, host_id, title, description, visibility, guild_id, category,
                       room_id, thumbnail_url, producer_track_id, created_at, updated_at",
        )
        .bind(stream.id.as_str())
        .bind(stream.host_id.as_str())
        .bind(&stream.title)
        .bind(&stream.description)
        .bind(stream.visibility.as_str())
        .bind(stream.guild_id.as_ref().map(crate::models::GuildId::as_str))
        .bind(&stream.category)
        .bind(stream.room_id.as_str())
        .bind(&stream.thumbnail_url)
        .bind(&stream.producer_track_id)
        .bind(stream.created_at)
        .bind(stream.updated_at)
        .fetch_one(&self.pool)
        .await?;

        Self::row_to_stream(&row)
    }

    /// Get a stream by ID
    async fn get_by_id(&self, stream_id: &StreamId) -> Result<Option<Stream>> {
        let row = sqlx::query(
            "SELECT id, host_id, title, description, visibility, guild_id, category,
                    room_id, thumbnail_url, producer_track_id, created_at, updated_at
             FROM streams
             WHERE id = $1",
        )
        .bind(stream_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_stream).transpose()
    }

    /// Get a stream by its broadcast room identifier
    async fn get_by_room(&self, room_id: &RoomId) -> Result<Option<Stream>> {
        let row = sqlx::query(
            "SELECT id, host_id, title, description, visibility, guild_id, category,
                    room_id, thumbnail_url, producer_track_id, created_at, updated_at
             FROM streams
             WHERE room_id = $1",
        )
        .bind(room_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_stream).transpose()
    }

    /// List streams, newest first. A `visibility` filter of `None`
    /// returns everything (the public discovery endpoint passes
    /// `Public`).
    async fn list(
        &self,
        visibility: Option<StreamVisibility>,
        limit: i64,
    ) -> Result<Vec<Stream>> {
        let limit = limit.clamp(1, 100);

        let rows = if let Some(vis) = visibility {
            sqlx::query(
                "SELECT id, host_id, title, description, visibility, guild_id, category,
                        room_id, thumbnail_url, producer_track_id, created_at, updated_at
                 FROM streams
                 WHERE visibility = $1
                 ORDER BY created_at DESC
                 LIMIT $2",
            )
            .bind(vis.as_str())
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(
                "SELECT id, host_id, title, description, visibility, guild_id, category,
                        room_id, thumbnail_url, producer_track_id, created_at, updated_at
                 FROM streams
                 ORDER BY created_at DESC
                 LIMIT $1",
            )
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        };

        rows.iter().map(Self::row_to_stream).collect()
    }

    /// Delete a stream record; viewer and chat rows cascade
    async fn delete(&self, stream_id: &StreamId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM streams WHERE id = $1")
            .bind(stream_id.as_str())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Add a viewer; a repeated join by the same identity is a no-op so
    /// the viewer list stays deduplicated.
    async fn add_viewer(&self, stream_id: &StreamId, user_id: &UserId) -> Result<()> {
        sqlx::query(
            "INSERT INTO stream_viewers (stream_id, user_id, joined_at)
             VALUES ($1, $2, $3)
             ON CONFLICT (stream_id, user_id) DO NOTHING",
        )
        .bind(stream_id.as_str())
        .bind(user_id.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Remove a viewer; removing an absent identity is a no-op
    async fn remove_viewer(&self, stream_id: &StreamId, user_id: &UserId) -> Result<()> {
        sqlx::query("DELETE FROM stream_viewers WHERE stream_id = $1 AND user_id = $2")
            .bind(stream_id.as_str())
            .bind(user_id.as_str())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// The viewer count is always the size of the viewer list
    async fn count_viewers(&self, stream_id: &StreamId) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM stream_viewers WHERE stream_id = $1")
                .bind(stream_id.as_str())
                .fetch_one(&self.pool)
                .await?;

        Ok(count)
    }

    /// List viewers with their join timestamps
    async fn list_viewers(&self, stream_id: &StreamId) -> Result<Vec<StreamViewer>> {
        let rows = sqlx::query(
            "SELECT user_id, joined_at
             FROM stream_viewers
             WHERE stream_id = $1
             ORDER BY joined_at",
        )
        .bind(stream_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(StreamViewer {
                    user_id: UserId::from_string(row.try_get("user_id")?),
                    joined_at: row.try_get("joined_at")?,
                })
            })
            .collect()
    }

    /// Append a chat message, trimming the rolling log to the most
    /// recent `CHAT_LOG_LIMIT` rows for the stream.
    async fn add_chat_message(
        &self,
        stream_id: &StreamId,
        user_id: &UserId,
        message: &str,
    ) -> Result<StreamChatMessage> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "INSERT INTO stream_chat (stream_id, user_id, message, created_at)
             VALUES ($1, $2, $3, $4)
             RETURNING id, stream_id, user_id, message, created_at",
        )
        .bind(stream_id.as_str())
        .bind(user_id.as_str())
        .bind(message)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            "DELETE FROM stream_chat
             WHERE stream_id = $1
               AND id NOT IN (
                   SELECT id FROM stream_chat
                   WHERE stream_id = $1
                   ORDER BY id DESC
                   LIMIT $2
               )",
        )
        .bind(stream_id.as_str())
        .bind(CHAT_LOG_LIMIT)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Self::row_to_chat_message(&row)
    }

    /// Recent chat messages, oldest first
    async fn recent_chat(
        &self,
        stream_id: &StreamId,
        limit: i64,
    ) -> Result<Vec<StreamChatMessage>> {
        let limit = limit.min(CHAT_LOG_LIMIT);

        let rows = sqlx::query(
            "SELECT id, stream_id, user_id, message, created_at
             FROM (
                 SELECT id, stream_id, user_id, message, created_at
                 FROM stream_chat
                 WHERE stream_id = $1
                 ORDER BY id DESC
                 LIMIT $2
             ) recent
             ORDER BY id",
        )
        .bind(stream_id.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_chat_message).collect()
    }
}
