//! Stream lifecycle service.
//!
//! The boundary between the CRUD layer and the streaming core: validates
//! and authorizes start/stop/join/leave/chat against the persisted
//! stream record. It never touches the relay or the session registry --
//! transcoding starts only when the broadcaster's browser sends
//! `start-browser-stream` over the signaling channel for the room id
//! created here.

use sqlx::PgPool;
use tracing::info;

use crate::{
    models::{Stream, StreamChatMessage, StreamId, StreamViewer, StreamVisibility, UserId},
    repository::{GuildRepository, GuildStore, StreamRepository, StreamStore},
    Error, Result,
};

const MAX_TITLE_LEN: usize = 120;
const MAX_DESCRIPTION_LEN: usize = 1000;
const MAX_CHAT_LEN: usize = 500;
const MAX_LIST_LIMIT: i64 = 100;

/// Parameters for initiating a broadcast
#[derive(Debug, Clone)]
pub struct StartStreamRequest {
    pub title: String,
    pub description: Option<String>,
    pub visibility: StreamVisibility,
    pub guild_id: Option<crate::models::GuildId>,
    pub category: Option<String>,
}

/// Stream lifecycle service. Generic over its stores so the
/// authorization paths run against in-memory doubles in tests; the
/// defaults are the Postgres repositories.
#[derive(Clone)]
pub struct StreamService<S = StreamRepository, G = GuildRepository> {
    stream_repo: S,
    guild_repo: G,
}

impl<S, G> std::fmt::Debug for StreamService<S, G> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamService").finish()
    }
}

impl StreamService {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self {
            stream_repo: StreamRepository::new(pool.clone()),
            guild_repo: GuildRepository::new(pool),
        }
    }
}

impl<S: StreamStore, G: GuildStore> StreamService<S, G> {
    pub fn with_stores(stream_repo: S, guild_repo: G) -> Self {
        Self {
            stream_repo,
            guild_repo,
        }
    }

    /// Initiate a broadcast: validate, authorize, persist.
    ///
    /// All checks run before any write. A guild-scoped stream requires
    /// an existing guild and the host to be a member of it.
    pub async fn start_stream(&self, host_id: UserId, req: StartStreamRequest) -> Result<Stream> {
        if req.title.trim().is_empty() {
            return Err(Error::InvalidInput("Title cannot be empty".to_string()));
        }
        if req.title.len() > MAX_TITLE_LEN {
            return Err(Error::InvalidInput("Title too long".to_string()));
        }
        if let Some(desc) = &req.description {
            if desc.len() > MAX_DESCRIPTION_LEN {
                return Err(Error::InvalidInput("Description too long".to_string()));
            }
        }

        let guild_id = match req.visibility {
            StreamVisibility::Guild => {
                let guild_id = req.guild_id.ok_or_else(|| {
                    Error::InvalidInput(
                        "Guild id is required for a guild-scoped stream".to_string(),
                    )
                })?;
                if !self.guild_repo.exists(&guild_id).await? {
                    return Err(Error::NotFound("Guild not found".to_string()));
                }
                if !self.guild_repo.is_member(&guild_id, &host_id).await? {
                    return Err(Error::Authorization(
                        "Not a member of the target guild".to_string(),
                    ));
                }
                Some(guild_id)
            }
            StreamVisibility::Public => None,
        };

        let stream = Stream::new(
            host_id,
            req.title,
            req.description,
            req.visibility,
            guild_id,
            req.category,
        );
        let created = self.stream_repo.create(&stream).await?;

        if let Some(guild_id) = &created.guild_id {
            self.guild_repo.link_stream(guild_id, &created.id).await?;
        }

        info!(
            stream_id = %created.id,
            room_id = %created.room_id,
            host_id = %created.host_id,
            visibility = created.visibility.as_str(),
            "Stream created"
        );

        Ok(created)
    }

    /// Stop a broadcast: host-only. Unlinks the guild and deletes the
    /// record. Tearing down the worker is the signaling channel's job;
    /// the shared room id is the join key between the two.
    pub async fn stop_stream(&self, stream_id: &StreamId, caller: &UserId) -> Result<Stream> {
        let stream = self.get_stream(stream_id).await?;

        if stream.host_id != *caller {
            return Err(Error::Authorization(
                "Only the host can stop the stream".to_string(),
            ));
        }

        if let Some(guild_id) = &stream.guild_id {
            self.guild_repo.unlink_stream(guild_id, &stream.id).await?;
        }
        self.stream_repo.delete(&stream.id).await?;

        info!(stream_id = %stream.id, room_id = %stream.room_id, "Stream deleted");

        Ok(stream)
    }

    /// Join a stream as a viewer. The host cannot view their own
    /// stream; a repeated join by the same identity leaves the viewer
    /// list unchanged. Returns the stream and the derived viewer count.
    pub async fn join_stream(
        &self,
        stream_id: &StreamId,
        viewer: &UserId,
    ) -> Result<(Stream, i64)> {
        let stream = self.get_stream(stream_id).await?;

        if stream.host_id == *viewer {
            return Err(Error::Authorization(
                "Host cannot join their own stream as a viewer".to_string(),
            ));
        }

        self.stream_repo.add_viewer(&stream.id, viewer).await?;
        let count = self.stream_repo.count_viewers(&stream.id).await?;

        Ok((stream, count))
    }

    /// Leave a stream. Removing an identity that never joined is a
    /// no-op. Returns the stream and the derived viewer count.
    pub async fn leave_stream(
        &self,
        stream_id: &StreamId,
        viewer: &UserId,
    ) -> Result<(Stream, i64)> {
        let stream = self.get_stream(stream_id).await?;

        self.stream_repo.remove_viewer(&stream.id, viewer).await?;
        let count = self.stream_repo.count_viewers(&stream.id).await?;

        Ok((stream, count))
    }

    /// Append a chat message to the stream's rolling log
    pub async fn send_chat(
        &self,
        stream_id: &StreamId,
        user_id: &UserId,
        message: &str,
    ) -> Result<(Stream, StreamChatMessage)> {
        if message.trim().is_empty() {
            return Err(Error::InvalidInput("Message cannot be empty".to_string()));
        }
        if message.len() > MAX_CHAT_LEN {
            return Err(Error::InvalidInput("Message too long".to_string()));
        }

        let stream = self.get_stream(stream_id).await?;
        let chat = self
            .stream_repo
            .add_chat_message(&stream.id, user_id, message)
            .await?;

        Ok((stream, chat))
    }

    /// Fetch a stream record by id
    pub async fn get_stream(&self, stream_id: &StreamId) -> Result<Stream> {
        self.stream_repo
            .get_by_id(stream_id)
            .await?
            .ok_or_else(|| Error::NotFound("Stream not found".to_string()))
    }

    /// Fetch a stream record by its broadcast room id. Used by the
    /// signaling channel to authorize `start-browser-stream`: the
    /// persisted record and the in-memory session must agree on the
    /// room id.
    pub async fn get_stream_by_room(&self, room_id: &crate::models::RoomId) -> Result<Stream> {
        self.stream_repo
            .get_by_room(room_id)
            .await?
            .ok_or_else(|| Error::NotFound("No stream for this room".to_string()))
    }

    /// Viewer list with join timestamps
    pub async fn list_viewers(&self, stream_id: &StreamId) -> Result<Vec<StreamViewer>> {
        self.stream_repo.list_viewers(stream_id).await
    }

    /// Recent chat, oldest first
    pub async fn recent_chat(
        &self,
        stream_id: &StreamId,
        limit: i64,
    ) -> Result<Vec<StreamChatMessage>> {
        self.stream_repo.recent_chat(stream_id, limit).await
    }

    /// Public stream discovery listing. The caller-supplied limit is
    /// clamped so it can neither reach SQL negative nor page the whole
    /// table.
    pub async fn list_public(&self, limit: i64) -> Result<Vec<Stream>> {
        self.stream_repo
            .list(Some(StreamVisibility::Public), limit.clamp(1, MAX_LIST_LIMIT))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::GuildId;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// In-memory stream store that counts writes, so a test can assert
    /// a rejection happened before any state changed.
    #[derive(Default)]
    struct MemoryStreams {
        streams: Mutex<Vec<Stream>>,
        viewers: Mutex<Vec<(StreamId, UserId)>>,
        chat: Mutex<Vec<StreamChatMessage>>,
        chat_seq: AtomicI64,
        writes: AtomicUsize,
        list_limits: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl StreamStore for MemoryStreams {
        async fn create(&self, stream: &Stream) -> Result<Stream> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.streams.lock().unwrap().push(stream.clone());
            Ok(stream.clone())
        }

        async fn get_by_id(&self, stream_id: &StreamId) -> Result<Option<Stream>> {
            Ok(self
                .streams
                .lock()
                .unwrap()
                .iter()
                .find(|s| s.id == *stream_id)
                .cloned())
        }

        async fn get_by_room(&self, room_id: &crate::models::RoomId) -> Result<Option<Stream>> {
            Ok(self
                .streams
                .lock()
                .unwrap()
                .iter()
                .find(|s| s.room_id == *room_id)
                .cloned())
        }

        async fn list(
            &self,
            visibility: Option<StreamVisibility>,
            limit: i64,
        ) -> Result<Vec<Stream>> {
            self.list_limits.lock().unwrap().push(limit);
            let streams = self.streams.lock().unwrap();
            Ok(streams
                .iter()
                .filter(|s| visibility.is_none_or(|v| s.visibility == v))
                .take(usize::try_from(limit).unwrap_or(0))
                .cloned()
                .collect())
        }

        async fn delete(&self, stream_id: &StreamId) -> Result<bool> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            let mut streams = self.streams.lock().unwrap();
            let before = streams.len();
            streams.retain(|s| s.id != *stream_id);
            Ok(streams.len() < before)
        }

        async fn add_viewer(&self, stream_id: &StreamId, user_id: &UserId) -> Result<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            let mut viewers = self.viewers.lock().unwrap();
            let entry = (stream_id.clone(), user_id.clone());
            if !viewers.contains(&entry) {
                viewers.push(entry);
            }
            Ok(())
        }

        async fn remove_viewer(&self, stream_id: &StreamId, user_id: &UserId) -> Result<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.viewers
                .lock()
                .unwrap()
                .retain(|(s, u)| s != stream_id || u != user_id);
            Ok(())
        }

        async fn count_viewers(&self, stream_id: &StreamId) -> Result<i64> {
            Ok(self
                .viewers
                .lock()
                .unwrap()
                .iter()
                .filter(|(s, _)| s == stream_id)
                .count() as i64)
        }

        async fn list_viewers(&self, stream_id: &StreamId) -> Result<Vec<StreamViewer>> {
            Ok(self
                .viewers
                .lock()
                .unwrap()
                .iter()
                .filter(|(s, _)| s == stream_id)
                .map(|(_, u)| StreamViewer {
                    user_id: u.clone(),
                    joined_at: Utc::now(),
                })
                .collect())
        }

        async fn add_chat_message(
            &self,
            stream_id: &StreamId,
            user_id: &UserId,
            message: &str,
        ) -> Result<StreamChatMessage> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            let chat = StreamChatMessage {
                id: self.chat_seq.fetch_add(1, Ordering::SeqCst),
                stream_id: stream_id.clone(),
                user_id: user_id.clone(),
                message: message.to_string(),
                created_at: Utc::now(),
            };
            self.chat.lock().unwrap().push(chat.clone());
            Ok(chat)
        }

        async fn recent_chat(
            &self,
            stream_id: &StreamId,
            _limit: i64,
        ) -> Result<Vec<StreamChatMessage>> {
            Ok(self
                .chat
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.stream_id == *stream_id)
                .cloned()
                .collect())
        }
    }

    struct MemoryGuilds {
        exists: bool,
        member: bool,
        links: Mutex<Vec<(GuildId, StreamId)>>,
    }

    impl MemoryGuilds {
        fn with(exists: bool, member: bool) -> Self {
            Self {
                exists,
                member,
                links: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl GuildStore for MemoryGuilds {
        async fn exists(&self, _guild_id: &GuildId) -> Result<bool> {
            Ok(self.exists)
        }

        async fn is_member(&self, _guild_id: &GuildId, _user_id: &UserId) -> Result<bool> {
            Ok(self.member)
        }

        async fn link_stream(&self, guild_id: &GuildId, stream_id: &StreamId) -> Result<()> {
            self.links
                .lock()
                .unwrap()
                .push((guild_id.clone(), stream_id.clone()));
            Ok(())
        }

        async fn unlink_stream(&self, guild_id: &GuildId, stream_id: &StreamId) -> Result<()> {
            self.links
                .lock()
                .unwrap()
                .retain(|(g, s)| g != guild_id || s != stream_id);
            Ok(())
        }
    }

    type TestService = StreamService<MemoryStreams, MemoryGuilds>;

    fn service() -> TestService {
        StreamService::with_stores(MemoryStreams::default(), MemoryGuilds::with(true, true))
    }

    fn request(title: &str) -> StartStreamRequest {
        StartStreamRequest {
            title: title.to_string(),
            description: None,
            visibility: StreamVisibility::Public,
            guild_id: None,
            category: None,
        }
    }

    fn guild_request() -> StartStreamRequest {
        let mut req = request("guild stream");
        req.visibility = StreamVisibility::Guild;
        req.guild_id = Some(GuildId::new());
        req
    }

    fn writes(svc: &TestService) -> usize {
        svc.stream_repo.writes.load(Ordering::SeqCst)
    }

    #[tokio::test]
    async fn test_start_rejects_empty_title() {
        let svc = service();
        let err = svc
            .start_stream(UserId::new(), request("  "))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert_eq!(writes(&svc), 0);
    }

    #[tokio::test]
    async fn test_start_rejects_oversized_title() {
        let err = service()
            .start_stream(UserId::new(), request(&"x".repeat(MAX_TITLE_LEN + 1)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_start_rejects_oversized_description() {
        let mut req = request("ok");
        req.description = Some("d".repeat(MAX_DESCRIPTION_LEN + 1));
        let err = service()
            .start_stream(UserId::new(), req)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_guild_visibility_requires_guild_id() {
        let mut req = request("ok");
        req.visibility = StreamVisibility::Guild;
        let err = service()
            .start_stream(UserId::new(), req)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_guild_start_requires_existing_guild() {
        let svc =
            StreamService::with_stores(MemoryStreams::default(), MemoryGuilds::with(false, false));
        let err = svc
            .start_stream(UserId::new(), guild_request())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert_eq!(writes(&svc), 0);
    }

    #[tokio::test]
    async fn test_guild_start_by_non_member_rejected_before_any_write() {
        let svc =
            StreamService::with_stores(MemoryStreams::default(), MemoryGuilds::with(true, false));
        let err = svc
            .start_stream(UserId::new(), guild_request())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Authorization(_)));
        assert_eq!(writes(&svc), 0);
        assert!(svc.guild_repo.links.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_guild_start_by_member_links_stream() {
        let svc = service();
        let created = svc
            .start_stream(UserId::new(), guild_request())
            .await
            .unwrap();
        let links = svc.guild_repo.links.lock().unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].1, created.id);
    }

    #[tokio::test]
    async fn test_host_cannot_join_own_stream() {
        let svc = service();
        let host = UserId::new();
        let created = svc
            .start_stream(host.clone(), request("my stream"))
            .await
            .unwrap();
        let writes_after_start = writes(&svc);

        let err = svc.join_stream(&created.id, &host).await.unwrap_err();
        assert!(matches!(err, Error::Authorization(_)));
        assert_eq!(writes(&svc), writes_after_start);
        assert!(svc.stream_repo.viewers.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_repeated_join_leaves_viewer_count_unchanged() {
        let svc = service();
        let created = svc
            .start_stream(UserId::new(), request("s"))
            .await
            .unwrap();
        let viewer = UserId::new();

        let (_, first) = svc.join_stream(&created.id, &viewer).await.unwrap();
        let (_, second) = svc.join_stream(&created.id, &viewer).await.unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 1);
    }

    #[tokio::test]
    async fn test_only_host_can_stop_stream() {
        let svc = service();
        let created = svc
            .start_stream(UserId::new(), request("s"))
            .await
            .unwrap();

        let err = svc
            .stop_stream(&created.id, &UserId::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Authorization(_)));
        assert!(svc.get_stream(&created.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_chat_rejects_empty_and_oversized_messages() {
        let svc = service();
        let stream_id = StreamId::new();
        let user_id = UserId::new();

        let err = svc.send_chat(&stream_id, &user_id, "   ").await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        let long = "m".repeat(MAX_CHAT_LEN + 1);
        let err = svc.send_chat(&stream_id, &user_id, &long).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert_eq!(writes(&svc), 0);
    }

    #[tokio::test]
    async fn test_list_limit_is_clamped() {
        let svc = service();
        svc.list_public(-1).await.unwrap();
        svc.list_public(10_000).await.unwrap();

        let limits = svc.stream_repo.list_limits.lock().unwrap();
        assert_eq!(&limits[..], &[1, MAX_LIST_LIMIT][..]);
    }
}
