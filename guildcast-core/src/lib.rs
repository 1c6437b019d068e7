//! Core domain layer for the Guildcast live-streaming service.
//!
//! Owns configuration, the error taxonomy, structured logging setup, the
//! persisted stream/guild models and repositories, and the stream
//! lifecycle service that sits between the HTTP layer and the streaming
//! relay.

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod repository;
pub mod service;

pub use config::Config;
pub use error::{Error, Result};
