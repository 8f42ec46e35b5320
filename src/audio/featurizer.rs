//! Raw audio ring and feature-window producer.
//!
//! Producers (TTS stage, capture ingest) push chunks through
//! [`AudioFeaturizer::put_audio_chunk`], which never blocks: once the ring is
//! full the oldest chunk is discarded. A [`FeaturePump`] running on its own
//! thread drains `2 * batch_size` chunks at a time (topping up with silence
//! when the ring runs dry), forwards them to the paired raw-audio queue and
//! then publishes one epoch-stamped [`FeatureWindow`].

use crate::audio::mel::MelExtractor;
use crate::config::LipcastConfig;
use crate::pipeline::messages::{AudioChunk, FeatureWindow};
use crate::pipeline::{SessionSignals, send_until};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Producer handle for the raw-audio ring. Cheap to clone.
#[derive(Clone)]
pub struct AudioFeaturizer {
    tx: Sender<AudioChunk>,
    rx: Receiver<AudioChunk>,
    dropped: Arc<AtomicU64>,
    speaking: Arc<AtomicBool>,
}

/// Consumer ends handed to the render loop.
pub struct FeatureStreams {
    /// Paired raw audio, `2 * batch_size` chunks per window, in order.
    pub audio: Receiver<AudioChunk>,
    /// Feature windows, one per batch.
    pub features: Receiver<FeatureWindow>,
}

impl AudioFeaturizer {
    /// Build the ring, its pump and the downstream queues.
    pub fn new(
        config: &LipcastConfig,
        signals: Arc<SessionSignals>,
    ) -> (Self, FeaturePump, FeatureStreams) {
        let (tx, rx) = crossbeam_channel::bounded(config.audio.ring_capacity.max(1));
        let batch_chunks = config.render.batch_size * config.render.chunks_per_frame();
        let feature_capacity = config.audio.feature_queue_capacity.max(1);
        let (audio_tx, audio_rx) =
            crossbeam_channel::bounded(batch_chunks * (feature_capacity + 2));
        let (feature_tx, feature_rx) = crossbeam_channel::bounded(feature_capacity);

        let speaking = Arc::new(AtomicBool::new(false));
        let featurizer = Self {
            tx,
            rx: rx.clone(),
            dropped: Arc::new(AtomicU64::new(0)),
            speaking: Arc::clone(&speaking),
        };
        let pump = FeaturePump {
            ring: rx,
            extractor: MelExtractor::new(&config.features, config.audio.sample_rate),
            history: VecDeque::new(),
            history_len: config.features.left_context_chunks * config.audio.chunk_samples,
            batch_size: config.render.batch_size,
            chunk_samples: config.audio.chunk_samples,
            chunks_per_frame: config.render.chunks_per_frame(),
            take_timeout: config.audio.chunk_duration() / 2,
            signals,
            last_epoch: 0,
            speaking,
            audio_tx,
            feature_tx,
        };
        let streams = FeatureStreams {
            audio: audio_rx,
            features: feature_rx,
        };
        (featurizer, pump, streams)
    }

    /// Enqueue one chunk without blocking, evicting the oldest when full.
    pub fn put_audio_chunk(&self, chunk: AudioChunk) {
        let mut chunk = chunk;
        loop {
            match self.tx.try_send(chunk) {
                Ok(()) => return,
                Err(TrySendError::Full(back)) => {
                    if self.rx.try_recv().is_ok() {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    chunk = back;
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }

    /// Discard everything not yet consumed. Returns the number of chunks dropped.
    pub fn flush(&self) -> usize {
        self.rx.try_iter().count()
    }

    /// Chunks currently waiting in the ring.
    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    /// Chunks evicted because the ring was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Speech is waiting in the ring or made it into the latest window.
    pub fn is_speaking(&self) -> bool {
        self.pending() > 0 || self.speaking.load(Ordering::Relaxed)
    }
}

/// Consumer side of the ring: turns raw chunks into feature windows.
pub struct FeaturePump {
    ring: Receiver<AudioChunk>,
    extractor: MelExtractor,
    history: VecDeque<f32>,
    history_len: usize,
    batch_size: usize,
    chunk_samples: usize,
    chunks_per_frame: usize,
    take_timeout: Duration,
    signals: Arc<SessionSignals>,
    last_epoch: u64,
    speaking: Arc<AtomicBool>,
    audio_tx: Sender<AudioChunk>,
    feature_tx: Sender<FeatureWindow>,
}

impl FeaturePump {
    /// Run until cancelled or the render loop goes away.
    pub fn run(mut self, cancel: CancellationToken) {
        debug!("feature pump started");
        while !cancel.is_cancelled() {
            if !self.step(&cancel) {
                break;
            }
        }
        debug!("feature pump stopped");
    }

    /// Produce one feature window. Returns `false` once the pump should stop.
    ///
    /// The window is stamped with the epoch current when its last chunk was
    /// taken. If the epoch moves while chunks are being collected, whatever
    /// was gathered before the change is discarded and collection restarts,
    /// so audio queued after an interrupt never ships under a stale epoch.
    pub fn step(&mut self, cancel: &CancellationToken) -> bool {
        let mut epoch = self.signals.epoch();
        if epoch != self.last_epoch {
            self.history.clear();
            self.last_epoch = epoch;
        }

        let wanted = self.batch_size * self.chunks_per_frame;
        let mut batch = Vec::with_capacity(wanted);
        while batch.len() < wanted {
            if cancel.is_cancelled() {
                return false;
            }
            let chunk = match self.ring.recv_timeout(self.take_timeout) {
                Ok(chunk) => chunk,
                Err(_) => AudioChunk::silent(self.chunk_samples),
            };
            let now = self.signals.epoch();
            if now != epoch {
                debug!(from = epoch, to = now, stale = batch.len(), "epoch moved mid-window");
                batch.clear();
                self.history.clear();
                self.last_epoch = now;
                epoch = now;
            }
            batch.push(chunk);
        }

        let window = self.featurize(&batch, epoch);
        trace!(epoch, frames = window.mels.len(), "feature window ready");
        self.speaking
            .store(batch.iter().any(|c| !c.silence), Ordering::Relaxed);

        for chunk in batch {
            if !send_until(&self.audio_tx, chunk, cancel) {
                return false;
            }
        }
        send_until(&self.feature_tx, window, cancel)
    }

    fn featurize(&mut self, batch: &[AudioChunk], epoch: u64) -> FeatureWindow {
        let mut samples = Vec::with_capacity(self.history_len + batch.len() * self.chunk_samples);
        samples.resize(self.history_len - self.history.len().min(self.history_len), 0.0);
        samples.extend(self.history.iter().copied());
        for chunk in batch {
            samples.extend_from_slice(&chunk.samples);
        }

        let spectrogram = self.extractor.spectrogram(&samples);
        let frame_samples = self.chunk_samples * self.chunks_per_frame;
        let hop = self.extractor.hop().max(1);
        let mels = (0..self.batch_size)
            .map(|k| {
                let center = (self.history_len + k * frame_samples + frame_samples / 2) / hop;
                self.extractor.window_at(&spectrogram, center)
            })
            .collect();

        let keep_from = samples.len().saturating_sub(self.history_len);
        self.history = samples[keep_from..].iter().copied().collect();

        FeatureWindow { mels, epoch }
    }
}
