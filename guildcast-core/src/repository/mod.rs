pub mod guild;
pub mod stream;

pub use guild::{GuildRepository, GuildStore};
pub use stream::{StreamRepository, StreamStore};
