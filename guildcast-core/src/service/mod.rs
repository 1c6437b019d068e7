pub mod auth;
pub mod stream;

pub use auth::TokenService;
pub use stream::{StartStreamRequest, StreamService};
