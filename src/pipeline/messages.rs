//! Message types passed between render stages.

use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque session identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Allocate a fresh random identifier.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for SessionId {
    fn from(raw: &str) -> Self {
        Self(raw.to_owned())
    }
}

impl From<String> for SessionId {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A block of mono PCM samples at the pipeline rate (20 ms nominal).
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    /// Normalized f32 samples in \[-1, 1\].
    pub samples: Vec<f32>,
    /// Whether this chunk carries no speech (filler or trailing silence).
    pub silence: bool,
}

impl AudioChunk {
    /// A chunk of real speech/capture audio.
    pub fn speech(samples: Vec<f32>) -> Self {
        Self {
            samples,
            silence: false,
        }
    }

    /// A zero-filled filler chunk.
    pub fn silent(len: usize) -> Self {
        Self {
            samples: vec![0.0; len],
            silence: true,
        }
    }
}

/// One mel-spectrogram window aligned with a single video frame.
///
/// Stored row-major: `rows` mel bands by `cols` mel frames.
#[derive(Debug, Clone, PartialEq)]
pub struct MelChunk {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<f32>,
}

impl MelChunk {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    pub fn get(&self, row: usize, col: usize) -> f32 {
        self.data[row * self.cols + col]
    }
}

/// Acoustic features for `batch_size` consecutive video frames.
#[derive(Debug, Clone)]
pub struct FeatureWindow {
    /// One mel window per output video frame, in order.
    pub mels: Vec<MelChunk>,
    /// Interrupt epoch the window was produced in. Stale epochs are discarded.
    pub epoch: u64,
}

/// What the emitter should draw for one frame.
#[derive(Debug, Clone)]
pub enum FrameContent {
    /// Composite the predicted face region into the full frame at its box.
    Composite(RgbImage),
    /// Replay the full frame verbatim (paired audio was silent).
    Replay,
}

/// A frame ready for compositing, paired with its audio.
#[derive(Debug, Clone)]
pub struct RenderedFrame {
    /// Monotonic sequence number within the session.
    pub seq: u64,
    /// Position in the asset's image cycle (already mirror-mapped).
    pub cycle_index: usize,
    /// Asset generation the frame was indexed against.
    pub generation: u64,
    /// Interrupt epoch of the feature window the frame came from.
    pub epoch: u64,
    pub content: FrameContent,
    /// The audio chunks this frame is time-aligned with (two per frame).
    pub audio: Vec<AudioChunk>,
}

impl RenderedFrame {
    pub fn is_replay(&self) -> bool {
        matches!(self.content, FrameContent::Replay)
    }
}

/// Session-scoped control command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ControlCommand {
    /// Synthesize and speak the text.
    Speak { text: String },
    /// Stop speaking and flush pending audio.
    Interrupt,
    /// Hot-swap the avatar identity.
    SwitchAvatar { avatar_id: String },
    /// Tear the session down.
    Shutdown,
}

impl ControlCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Speak { .. } => "speak",
            Self::Interrupt => "interrupt",
            Self::SwitchAvatar { .. } => "switch_avatar",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Pixel layout of outbound video frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Packed 8-bit RGB.
    Rgb24,
}

/// Transport-ready video frame.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub seq: u64,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: Vec<u8>,
}

/// Transport-ready audio frame: mono signed 16-bit PCM.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub sample_rate: u32,
    pub samples: Vec<i16>,
}

/// Events pipeline stages report to the session manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    /// The outbound sink failed too many times in a row.
    TransportFailed { session: SessionId },
}
