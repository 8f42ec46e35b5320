//! Per-session render loop.
//!
//! Each iteration takes one feature window and exactly `2 * batch_size` paired
//! audio chunks. An all-silent batch replays the source frames without
//! touching the model; anything else becomes a single inference call. The
//! frame counter advances by `batch_size` per window on every path, so cycle
//! positions and sequence numbers never skip or repeat.

use crate::assets::{AssetSnapshot, FrameAssetLibrary};
use crate::assets::playback::ClipCursor;
use crate::config::LipcastConfig;
use crate::error::{RenderError, Result};
use crate::pipeline::messages::{
    AudioChunk, FeatureWindow, FrameContent, RenderedFrame, SessionId,
};
use crate::pipeline::{SessionSignals, send_until};
use crate::worker::{InferenceWorker, ReloadCell};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Result of one loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// No window arrived within the poll timeout.
    Idle,
    /// Window dropped because the session is paused or it predates an interrupt.
    Discarded,
    /// Silent batch replayed without inference.
    Replayed(usize),
    /// Batch rendered through the model.
    Rendered(usize),
    /// Inference failed; the batch produced no frames.
    Dropped,
    /// Upstream or downstream hung up, or cancellation was observed.
    Stopped,
}

pub struct RenderScheduler {
    session: SessionId,
    batch_size: usize,
    chunks_per_frame: usize,
    chunk_samples: usize,
    poll_timeout: Duration,
    features: Receiver<FeatureWindow>,
    audio: Receiver<AudioChunk>,
    frames: Sender<RenderedFrame>,
    worker: InferenceWorker,
    library: Arc<FrameAssetLibrary>,
    reload: Arc<ReloadCell>,
    signals: Arc<SessionSignals>,
    asset: AssetSnapshot,
    clip: ClipCursor,
    /// Cycle counter fed to the mirror index. Resets on reload.
    index: usize,
    /// Monotonic frame sequence number. Never resets.
    seq: u64,
    seen_epoch: u64,
}

/// Channels the scheduler sits between.
pub struct SchedulerIo {
    pub features: Receiver<FeatureWindow>,
    pub audio: Receiver<AudioChunk>,
    pub frames: Sender<RenderedFrame>,
}

impl RenderScheduler {
    pub fn new(
        session: SessionId,
        config: &LipcastConfig,
        io: SchedulerIo,
        worker: InferenceWorker,
        library: Arc<FrameAssetLibrary>,
        signals: Arc<SessionSignals>,
    ) -> Self {
        let asset = library.snapshot();
        let reload = Arc::clone(library.reload_cell());
        let seen_epoch = signals.epoch();
        Self {
            session,
            batch_size: config.render.batch_size,
            chunks_per_frame: config.render.chunks_per_frame(),
            chunk_samples: config.audio.chunk_samples,
            poll_timeout: config.render.poll_timeout(),
            features: io.features,
            audio: io.audio,
            frames: io.frames,
            worker,
            library,
            reload,
            signals,
            asset,
            clip: ClipCursor::default(),
            index: 0,
            seq: 0,
            seen_epoch,
        }
    }

    /// Loop until cancelled, then shut the inference context down.
    pub fn run(mut self, cancel: CancellationToken, join_timeout: Duration) {
        info!(session = %self.session, "render loop started");
        while !cancel.is_cancelled() {
            if self.step(&cancel) == StepOutcome::Stopped {
                break;
            }
        }
        if !self.worker.shutdown(join_timeout) {
            warn!(session = %self.session, "inference context did not stop cleanly");
        }
        info!(session = %self.session, frames = self.seq, "render loop stopped");
    }

    /// One iteration: reload check, wait for a window, render, forward.
    pub fn step(&mut self, cancel: &CancellationToken) -> StepOutcome {
        self.poll_reload();

        let window = match self.features.recv_timeout(self.poll_timeout) {
            Ok(window) => window,
            Err(RecvTimeoutError::Timeout) => return StepOutcome::Idle,
            Err(RecvTimeoutError::Disconnected) => return StepOutcome::Stopped,
        };
        let Some(audio) = self.drain_audio(cancel) else {
            return StepOutcome::Stopped;
        };

        let epoch = self.signals.epoch();
        if epoch != self.seen_epoch {
            self.seen_epoch = epoch;
            self.clip.rewind();
        }
        if self.signals.is_paused() || window.epoch != epoch {
            return StepOutcome::Discarded;
        }

        let (outcome, frames) = match self.process_window(window, audio) {
            Ok(frames) if frames.first().is_some_and(RenderedFrame::is_replay) => {
                (StepOutcome::Replayed(frames.len()), frames)
            }
            Ok(frames) => (StepOutcome::Rendered(frames.len()), frames),
            Err(e) => {
                warn!(session = %self.session, "dropping batch: {e}");
                (StepOutcome::Dropped, Vec::new())
            }
        };

        for frame in frames {
            if !send_until(&self.frames, frame, cancel) {
                return StepOutcome::Stopped;
            }
        }
        outcome
    }

    /// Apply a pending reload: new model weights, fresh asset snapshot,
    /// cycle position back to 0.
    pub fn poll_reload(&mut self) {
        let Some(request) = self.reload.take() else {
            return;
        };
        if request.model_path != self.worker.model_path()
            && let Err(e) = self.worker.reload(&request.model_path)
        {
            warn!(session = %self.session, "model reload failed: {e}");
        }
        self.asset = self.library.snapshot();
        self.index = 0;
        self.clip.rewind();
        info!(
            session = %self.session,
            generation = self.asset.generation,
            "render loop reloaded {}",
            self.asset.asset.dir().display()
        );
    }

    /// Render one window and its paired audio.
    ///
    /// # Errors
    ///
    /// Returns the inference error if the model call fails. Counters advance
    /// by `batch_size` either way.
    pub fn process_window(
        &mut self,
        window: FeatureWindow,
        audio: Vec<AudioChunk>,
    ) -> Result<Vec<RenderedFrame>> {
        let b = self.batch_size;
        let asset = Arc::clone(&self.asset.asset);
        let generation = self.asset.generation;
        let indices: Vec<usize> = (0..b).map(|k| asset.mirror_index(self.index + k)).collect();
        let first_seq = self.seq;
        self.index += b;
        self.seq += b as u64;

        let silent = audio.iter().all(|c| c.silence);
        let audio = if silent {
            self.with_idle_audio(audio)
        } else {
            audio
        };
        let mut pairs = audio.chunks(self.chunks_per_frame).map(<[AudioChunk]>::to_vec);

        let contents: Vec<FrameContent> = if silent {
            vec![FrameContent::Replay; b]
        } else {
            if window.mels.len() != b {
                return Err(RenderError::Inference(format!(
                    "feature window has {} frames, expected {b}",
                    window.mels.len()
                )));
            }
            let faces = indices.iter().map(|&i| asset.face(i).clone()).collect();
            self.worker
                .infer(faces, window.mels)?
                .into_iter()
                .map(FrameContent::Composite)
                .collect()
        };

        Ok(indices
            .into_iter()
            .zip(contents)
            .enumerate()
            .map(|(k, (cycle_index, content))| RenderedFrame {
                seq: first_seq + k as u64,
                cycle_index,
                generation,
                epoch: window.epoch,
                content,
                audio: pairs.next().unwrap_or_default(),
            })
            .collect())
    }

    /// Swap silent filler for the avatar's idle clip, if it has one.
    fn with_idle_audio(&mut self, audio: Vec<AudioChunk>) -> Vec<AudioChunk> {
        let Some(clip) = self.asset.asset.strategy().idle_clip() else {
            return audio;
        };
        let mut out = Vec::with_capacity(audio.len());
        for _ in 0..audio.len() {
            out.push(self.clip.next_chunk(clip, self.chunk_samples));
        }
        out
    }

    /// Take the `2 * batch_size` chunks paired with the window just received.
    fn drain_audio(&self, cancel: &CancellationToken) -> Option<Vec<AudioChunk>> {
        let wanted = self.batch_size * self.chunks_per_frame;
        let mut audio = Vec::with_capacity(wanted);
        while audio.len() < wanted {
            if cancel.is_cancelled() {
                return None;
            }
            match self.audio.recv_timeout(self.poll_timeout) {
                Ok(chunk) => audio.push(chunk),
                Err(RecvTimeoutError::Timeout) => {
                    debug!(session = %self.session, "paired audio late, padding with silence");
                    audio.push(AudioChunk::silent(self.chunk_samples));
                }
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
        Some(audio)
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn cycle_counter(&self) -> usize {
        self.index
    }
}
