//! Realtime augmentative-communication voice backend: STT/LLM/TTS turn
//! orchestration over WebSocket (spec.md).
//!
//! The session pipeline, leaves-first: [`stt`] and [`llm`] are the upstream
//! clients, [`broker`] resolves and connects to them, [`quest`] is the
//! per-session activity registry they run inside, [`turn_controller`] drives
//! pause/flush/generation sequencing on top of all three, and
//! [`server::gateway`] is the WebSocket session handler that ties it to a
//! client.

pub mod broker;
pub mod config;
pub mod error;
pub mod events;
pub mod framing;
pub mod llm;
pub mod metrics;
pub mod quest;
pub mod server;
pub mod storage;
pub mod stt;
pub mod tts;
pub mod turn_controller;
pub mod types;

pub use config::Config;
pub use error::OrchestratorError;
pub use server::{start as start_server, ServerState};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name.
pub const NAME: &str = env!("CARGO_PKG_NAME");
