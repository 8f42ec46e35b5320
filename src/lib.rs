//! Lipcast: real-time lip-synchronized talking-avatar renderer.
//!
//! Each viewer session runs its own pipeline of OS threads:
//! Text → TTS → Featurizer → Render loop ⇄ Lip-sync worker → Emitter → Transport
//!
//! # Architecture
//!
//! Stages are connected by bounded `crossbeam` channels:
//! - **TTS**: synthesizes queued utterances into 20 ms audio chunks
//! - **Featurizer**: turns audio into mel windows, drop-oldest under load
//! - **Render loop**: pulls one window per batch, replays the avatar frame
//!   on silence or runs the lip-sync model on speech
//! - **Worker**: hosts the model on an isolated thread (or child process)
//! - **Emitter**: composites patches, converts audio to PCM and throttles
//!   on transport backpressure
//!
//! The [`session::SessionManager`] admits sessions, drives their lifecycle
//! and hot-swaps avatars; the [`control::ControlBus`] carries commands and
//! capture audio into it.

pub mod assets;
pub mod audio;
pub mod config;
pub mod control;
pub mod error;
pub mod pipeline;
pub mod render;
pub mod session;
pub mod transport;
pub mod tts;
pub mod worker;

#[cfg(test)]
pub mod test_utils;

pub use config::LipcastConfig;
pub use error::{RenderError, Result};
pub use session::{SessionInfo, SessionManager, SessionState};
