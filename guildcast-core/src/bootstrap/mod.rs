//! Bootstrap helpers for the Guildcast binary: configuration discovery
//! and database pool initialization.

pub mod config;
pub mod database;

pub use config::load_config;
pub use database::init_database;
