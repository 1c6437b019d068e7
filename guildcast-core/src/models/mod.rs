pub mod id;
pub mod stream;

pub use id::{generate_id, GuildId, RoomId, StreamId, UserId};
pub use stream::{Stream, StreamChatMessage, StreamViewer, StreamVisibility};
