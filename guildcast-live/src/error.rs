use guildcast_core::models::RoomId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LiveError {
    #[error("A live session is already active for room {0}")]
    AlreadyActive(RoomId),

    #[error("Failed to spawn transcoding worker: {0}")]
    WorkerSpawn(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, LiveError>;
