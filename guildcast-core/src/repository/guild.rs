use async_trait::async_trait;
use sqlx::PgPool;

use crate::{
    models::{GuildId, StreamId, UserId},
    Result,
};

/// Read/link boundary against the guild tables owned by the external
/// guild subsystem. The streaming core only checks existence and
/// membership and maintains the guild → stream linkage.
#[async_trait]
pub trait GuildStore: Send + Sync {
    async fn exists(&self, guild_id: &GuildId) -> Result<bool>;
    async fn is_member(&self, guild_id: &GuildId, user_id: &UserId) -> Result<bool>;
    async fn link_stream(&self, guild_id: &GuildId, stream_id: &StreamId) -> Result<()>;
    async fn unlink_stream(&self, guild_id: &GuildId, stream_id: &StreamId) -> Result<()>;
}

#[derive(Clone)]
pub struct GuildRepository {
    pool: PgPool,
}

impl GuildRepository {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl GuildStore for GuildRepository {
    /// Whether the guild exists at all
    async fn exists(&self, guild_id: &GuildId) -> Result<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM guilds WHERE id = $1")
            .bind(guild_id.as_str())
            .fetch_one(&self.pool)
            .await?;

        Ok(count > 0)
    }

    /// Whether the user is a member of the guild
    async fn is_member(&self, guild_id: &GuildId, user_id: &UserId) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM guild_members WHERE guild_id = $1 AND user_id = $2",
        )
        .bind(guild_id.as_str())
        .bind(user_id.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(count > 0)
    }

    /// Link a stream into the guild's stream list
    async fn link_stream(&self, guild_id: &GuildId, stream_id: &StreamId) -> Result<()> {
        sqlx::query(
            "INSERT INTO guild_streams (guild_id, stream_id)
             VALUES ($1, $2)
             ON CONFLICT (guild_id, stream_id) DO NOTHING",
        )
        .bind(guild_id.as_str())
        .bind(stream_id.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Remove a stream from the guild's stream list; absent links are a
    /// no-op
    async fn unlink_stream(&self, guild_id: &GuildId, stream_id: &StreamId) -> Result<()> {
        sqlx::query("DELETE FROM guild_streams WHERE guild_id = $1 AND stream_id = $2")
            .bind(guild_id.as_str())
            .bind(stream_id.as_str())
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
