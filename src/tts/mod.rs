//! Text-to-speech boundary and the per-session synthesis stage.
//!
//! The synthesizer itself is external; [`TtsStage`] owns the queue of
//! utterances for one session, resamples whatever the engine produces to the
//! pipeline rate and feeds the result into the audio featurizer.

use crate::audio::AudioFeaturizer;
use crate::audio::ingest::{resample, slice_utterance};
use crate::error::Result;
use crate::pipeline::SessionSignals;
use crate::pipeline::messages::SessionId;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Synthesized utterance at the engine's native rate.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesizedSpeech {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

/// A text-to-speech engine.
pub trait SpeechSynthesizer: Send {
    /// Synthesize one utterance.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine fails; the utterance is skipped.
    fn synthesize(&mut self, text: &str) -> Result<SynthesizedSpeech>;
}

/// Builds one synthesizer per session.
pub type SynthesizerFactory = Arc<dyn Fn() -> Box<dyn SpeechSynthesizer> + Send + Sync>;

/// Stand-in engine: produces silent speech-tagged audio sized to the text,
/// so the render path still runs the lip-sync model while no engine is wired.
#[derive(Debug, Clone)]
pub struct NullSynthesizer {
    sample_rate: u32,
    per_char: Duration,
}

impl Default for NullSynthesizer {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            per_char: Duration::from_millis(60),
        }
    }
}

impl SpeechSynthesizer for NullSynthesizer {
    fn synthesize(&mut self, text: &str) -> Result<SynthesizedSpeech> {
        let chars = text.chars().filter(|c| !c.is_whitespace()).count();
        let len = self.per_char.as_millis() as usize * chars * self.sample_rate as usize / 1_000;
        Ok(SynthesizedSpeech {
            samples: vec![0.0; len],
            sample_rate: self.sample_rate,
        })
    }
}

/// Cloneable handle for queueing and cancelling utterances.
#[derive(Clone)]
pub struct TtsHandle {
    tx: Sender<String>,
    rx: Receiver<String>,
}

impl TtsHandle {
    /// Queue text for synthesis. Returns `false` if the queue is full or gone.
    pub fn speak(&self, text: impl Into<String>) -> bool {
        self.tx.try_send(text.into()).is_ok()
    }

    /// Drop every queued utterance. Returns how many were dropped.
    pub fn clear(&self) -> usize {
        self.rx.try_iter().count()
    }

    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

/// Per-session synthesis thread body.
pub struct TtsStage {
    session: SessionId,
    synthesizer: Box<dyn SpeechSynthesizer>,
    featurizer: AudioFeaturizer,
    signals: Arc<SessionSignals>,
    texts: Receiver<String>,
    sample_rate: u32,
    chunk_samples: usize,
}

impl TtsStage {
    pub fn new(
        session: SessionId,
        synthesizer: Box<dyn SpeechSynthesizer>,
        featurizer: AudioFeaturizer,
        signals: Arc<SessionSignals>,
        sample_rate: u32,
        chunk_samples: usize,
        queue_capacity: usize,
    ) -> (Self, TtsHandle) {
        let (tx, rx) = crossbeam_channel::bounded(queue_capacity.max(1));
        let stage = Self {
            session,
            synthesizer,
            featurizer,
            signals,
            texts: rx.clone(),
            sample_rate,
            chunk_samples,
        };
        (stage, TtsHandle { tx, rx })
    }

    pub fn run(mut self, cancel: CancellationToken, poll: Duration) {
        debug!(session = %self.session, "tts stage started");
        while !cancel.is_cancelled() {
            match self.texts.recv_timeout(poll) {
                Ok(text) => {
                    self.speak(&text);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!(session = %self.session, "tts stage stopped");
    }

    /// Synthesize one utterance and feed it to the featurizer.
    /// Returns the number of chunks queued.
    pub fn speak(&mut self, text: &str) -> usize {
        let epoch = self.signals.epoch();
        let speech = match self.synthesizer.synthesize(text) {
            Ok(speech) => speech,
            Err(e) => {
                error!(session = %self.session, "synthesis failed: {e}");
                return 0;
            }
        };
        if !self.signals.is_current(epoch) {
            debug!(session = %self.session, "utterance interrupted during synthesis");
            return 0;
        }

        let samples = resample(&speech.samples, speech.sample_rate, self.sample_rate);
        let chunks = slice_utterance(&samples, self.chunk_samples);
        let count = chunks.len();
        for chunk in chunks {
            if !self.signals.is_current(epoch) {
                return 0;
            }
            self.featurizer.put_audio_chunk(chunk);
        }
        info!(session = %self.session, chunks = count, "queued utterance");
        count
    }
}
