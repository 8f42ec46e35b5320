//! How an avatar's image cycle is walked and what it plays while idle.

use crate::pipeline::messages::AudioChunk;
use serde::{Deserialize, Serialize};

/// Playback mode as written in an avatar's `playback.json`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackMode {
    #[default]
    Cyclic,
    PingPong,
    CustomAudio,
}

/// On-disk playback descriptor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackManifest {
    pub mode: PlaybackMode,
    /// Idle clip, relative to the avatar directory. Used by `custom_audio`.
    pub audio: Option<String>,
}

/// Asset playback strategy, selected when the asset is loaded.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackStrategy {
    /// Wrap back to frame 0 after the last frame.
    Cyclic,
    /// Walk forward then backward so the loop has no jump cut.
    PingPong,
    /// Ping-pong motion driven by a pre-recorded idle clip while silent.
    CustomAudio { clip: IdleClip },
}

impl PlaybackStrategy {
    /// Map the monotonic frame counter `i` onto a cycle of `len` frames.
    pub fn mirror_index(&self, i: usize, len: usize) -> usize {
        match self {
            Self::Cyclic => cyclic_index(i, len),
            Self::PingPong | Self::CustomAudio { .. } => ping_pong_index(i, len),
        }
    }

    pub fn idle_clip(&self) -> Option<&IdleClip> {
        match self {
            Self::CustomAudio { clip } => Some(clip),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Cyclic => "cyclic",
            Self::PingPong => "ping_pong",
            Self::CustomAudio { .. } => "custom_audio",
        }
    }
}

/// `i mod len`; `len == 0` maps everything to 0.
pub fn cyclic_index(i: usize, len: usize) -> usize {
    if len == 0 { 0 } else { i % len }
}

/// Bounce between 0 and `len - 1`, visiting each end once per turn.
pub fn ping_pong_index(i: usize, len: usize) -> usize {
    if len == 0 {
        return 0;
    }
    let turn = i / len;
    let r = i % len;
    if turn % 2 == 0 { r } else { len - 1 - r }
}

/// Pre-recorded idle audio, already resampled to the pipeline rate.
#[derive(Debug, Clone, PartialEq)]
pub struct IdleClip {
    samples: Vec<f32>,
}

impl IdleClip {
    pub fn new(samples: Vec<f32>) -> Self {
        Self { samples }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Read position into an [`IdleClip`]. Owned by the render loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClipCursor {
    position: usize,
}

impl ClipCursor {
    pub fn rewind(&mut self) {
        self.position = 0;
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// Next `len` samples of the clip as a chunk, or plain silence once the
    /// clip is exhausted. The tail is zero-padded.
    pub fn next_chunk(&mut self, clip: &IdleClip, len: usize) -> AudioChunk {
        if self.position >= clip.samples.len() {
            return AudioChunk::silent(len);
        }
        let end = (self.position + len).min(clip.samples.len());
        let mut samples = clip.samples[self.position..end].to_vec();
        samples.resize(len, 0.0);
        self.position = end;
        // The clip is not speech: the frame it rides with still replays.
        AudioChunk {
            samples,
            silence: true,
        }
    }
}
