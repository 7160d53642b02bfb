//! Client synchronization engine for the voice multiplexer relay.
//!
//! Keeps one control channel to the relay and mirrors its session registry,
//! agent status, and transcripts into local state, coordinating voice-room
//! tokens and audio cues along the way.

pub mod api;
pub mod audio;
pub mod auth;
pub mod config;
pub mod connection;
pub mod db;
pub mod engine;
pub mod error;
pub mod models;
pub mod notify;
pub mod persistence;
pub mod protocol;
pub mod registry;
pub mod status;
pub mod token;
pub mod transcript;
pub mod voice;

pub use api::RelayApi;
pub use config::VmuxConfig;
pub use db::PersistenceStore;
pub use engine::{EngineCommand, EngineConfig, EngineEvent, EngineHandle, EngineState, SyncEngine};
pub use error::ClientError;
