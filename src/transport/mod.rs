//! Outbound media sinks.
//!
//! The emitter runs on a plain thread and pushes one frame at a time; the
//! transport side (WebRTC tracks, recorders) is usually async, so the stock
//! [`TrackSink`] bridges through bounded tokio channels whose fill level is
//! the backpressure signal.

use crate::error::{RenderError, Result};
use crate::pipeline::messages::{AudioFrame, VideoFrame};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

/// Destination for one session's audio and video.
pub trait TransportSink: Send + Sync {
    /// Hand one video frame to the transport.
    ///
    /// # Errors
    ///
    /// Returns `RenderError::Transport` if the frame could not be queued.
    fn push_video(&self, frame: VideoFrame) -> Result<()>;

    /// Hand one audio frame to the transport.
    ///
    /// # Errors
    ///
    /// Returns `RenderError::Transport` if the frame could not be queued.
    fn push_audio(&self, frame: AudioFrame) -> Result<()>;

    /// Video frames queued but not yet sent.
    fn video_queue_depth(&self) -> usize;
}

/// Receiving ends of a [`TrackSink`], owned by the transport.
pub struct TrackReceivers {
    pub video: mpsc::Receiver<VideoFrame>,
    pub audio: mpsc::Receiver<AudioFrame>,
}

/// Sink backed by bounded tokio channels.
pub struct TrackSink {
    video: mpsc::Sender<VideoFrame>,
    audio: mpsc::Sender<AudioFrame>,
}

impl TrackSink {
    pub fn new(video_capacity: usize, audio_capacity: usize) -> (Self, TrackReceivers) {
        let (video_tx, video_rx) = mpsc::channel(video_capacity.max(1));
        let (audio_tx, audio_rx) = mpsc::channel(audio_capacity.max(1));
        (
            Self {
                video: video_tx,
                audio: audio_tx,
            },
            TrackReceivers {
                video: video_rx,
                audio: audio_rx,
            },
        )
    }
}

fn map_send_error<T>(track: &str, e: TrySendError<T>) -> RenderError {
    match e {
        TrySendError::Full(_) => RenderError::Transport(format!("{track} track full")),
        TrySendError::Closed(_) => RenderError::Transport(format!("{track} track closed")),
    }
}

impl TransportSink for TrackSink {
    fn push_video(&self, frame: VideoFrame) -> Result<()> {
        self.video
            .try_send(frame)
            .map_err(|e| map_send_error("video", e))
    }

    fn push_audio(&self, frame: AudioFrame) -> Result<()> {
        self.audio
            .try_send(frame)
            .map_err(|e| map_send_error("audio", e))
    }

    fn video_queue_depth(&self) -> usize {
        self.video.max_capacity() - self.video.capacity()
    }
}

/// Sink that drops everything and logs a heartbeat. Used by the host binary
/// when no real transport is attached.
#[derive(Debug, Default)]
pub struct NullSink {
    video_frames: AtomicU64,
    audio_frames: AtomicU64,
}

impl NullSink {
    pub fn video_frames(&self) -> u64 {
        self.video_frames.load(Ordering::Relaxed)
    }

    pub fn audio_frames(&self) -> u64 {
        self.audio_frames.load(Ordering::Relaxed)
    }
}

impl TransportSink for NullSink {
    fn push_video(&self, frame: VideoFrame) -> Result<()> {
        let n = self.video_frames.fetch_add(1, Ordering::Relaxed) + 1;
        if n % 250 == 0 {
            debug!(seq = frame.seq, "null sink: {n} video frames");
        }
        Ok(())
    }

    fn push_audio(&self, _frame: AudioFrame) -> Result<()> {
        self.audio_frames.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn video_queue_depth(&self) -> usize {
        0
    }
}
