//! One session's running pipeline: the threads and the handles into them.
//!
//! ```text
//! TtsStage ─┐
//!           ├─► AudioFeaturizer ring ─► FeaturePump ─► RenderScheduler ─► FrameEmitter ─► sink
//! capture ──┘                                             ⇅
//!                                                   InferenceWorker
//! ```
//!
//! Every stage runs on its own OS thread and checks the shared
//! [`CancellationToken`] between blocking operations.

use crate::assets::{FrameAsset, FrameAssetLibrary};
use crate::audio::AudioFeaturizer;
use crate::config::LipcastConfig;
use crate::error::Result;
use crate::pipeline::SessionSignals;
use crate::pipeline::messages::{AudioChunk, PipelineEvent, SessionId};
use crate::render::{FrameEmitter, RenderScheduler, SchedulerIo, Sleeper};
use crate::transport::TransportSink;
use crate::tts::{SpeechSynthesizer, TtsHandle, TtsStage};
use crate::worker::{InferenceWorker, ModelFactory, ReloadCell};
use crossbeam_channel::Sender;
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Utterances that may wait for synthesis.
const TTS_QUEUE_CAPACITY: usize = 32;

/// Collaborators a pipeline is built from.
pub struct PipelineDeps {
    pub config: Arc<LipcastConfig>,
    pub factory: ModelFactory,
    pub synthesizer: Box<dyn SpeechSynthesizer>,
    pub sleeper: Arc<dyn Sleeper>,
    pub events: Sender<PipelineEvent>,
}

pub struct SessionPipeline {
    session: SessionId,
    cancel: CancellationToken,
    signals: Arc<SessionSignals>,
    library: Arc<FrameAssetLibrary>,
    featurizer: AudioFeaturizer,
    tts: TtsHandle,
    threads: Vec<(&'static str, JoinHandle<()>)>,
    stop_timeout: Duration,
}

impl SessionPipeline {
    /// Build every stage and start its thread. The pipeline starts paused so
    /// nothing reaches the sink before the session is activated.
    ///
    /// # Errors
    ///
    /// Returns an error if a thread cannot be spawned; any stages already
    /// started are stopped again.
    pub fn start(
        session: SessionId,
        asset: FrameAsset,
        sink: Arc<dyn TransportSink>,
        deps: PipelineDeps,
    ) -> Result<Self> {
        let config = deps.config;
        let cancel = CancellationToken::new();
        let signals = Arc::new(SessionSignals::new());
        signals.set_paused(true);

        let reload = Arc::new(ReloadCell::new(config.worker.model_path.clone()));
        let library = Arc::new(FrameAssetLibrary::new(asset, reload));

        let (featurizer, pump, streams) = AudioFeaturizer::new(&config, Arc::clone(&signals));
        let (tts_stage, tts) = TtsStage::new(
            session.clone(),
            deps.synthesizer,
            featurizer.clone(),
            Arc::clone(&signals),
            config.audio.sample_rate,
            config.audio.chunk_samples,
            TTS_QUEUE_CAPACITY,
        );

        let worker = InferenceWorker::spawn(
            format!("lipcast-{}", short(&session)),
            deps.factory,
            config.worker.model_path.clone(),
            config.render.inference_timeout(),
        )?;

        let (frames_tx, frames_rx) =
            crossbeam_channel::bounded(config.render.batch_size * config.render.chunks_per_frame());
        let scheduler = RenderScheduler::new(
            session.clone(),
            &config,
            SchedulerIo {
                features: streams.features,
                audio: streams.audio,
                frames: frames_tx,
            },
            worker,
            Arc::clone(&library),
            Arc::clone(&signals),
        );
        let emitter = FrameEmitter::new(
            session.clone(),
            sink,
            Arc::clone(&library),
            Arc::clone(&signals),
            config.emitter.clone(),
            config.audio.sample_rate,
        )
        .with_sleeper(deps.sleeper)
        .with_events(deps.events);

        let poll = config.render.poll_timeout();
        let join_timeout = config.session.join_timeout();
        let mut pipeline = Self {
            session,
            cancel,
            signals,
            library,
            featurizer,
            tts,
            threads: Vec::with_capacity(4),
            // The render thread needs one poll interval to notice cancellation
            // and then up to `join_timeout` for the inference context.
            stop_timeout: join_timeout + poll * 2,
        };

        let spawned = (|| -> Result<()> {
            let c = pipeline.cancel.clone();
            pipeline.spawn("pump", move || pump.run(c))?;
            let c = pipeline.cancel.clone();
            pipeline.spawn("render", move || scheduler.run(c, join_timeout))?;
            let c = pipeline.cancel.clone();
            pipeline.spawn("emit", move || emitter.run(frames_rx, c, poll))?;
            let c = pipeline.cancel.clone();
            pipeline.spawn("tts", move || tts_stage.run(c, poll))?;
            Ok(())
        })();
        if let Err(e) = spawned {
            pipeline.stop();
            return Err(e);
        }

        info!(session = %pipeline.session, "pipeline started");
        Ok(pipeline)
    }

    fn spawn<F>(&mut self, stage: &'static str, body: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = std::thread::Builder::new()
            .name(format!("lipcast-{stage}-{}", short(&self.session)))
            .spawn(body)?;
        self.threads.push((stage, handle));
        Ok(())
    }

    /// Let frames through to the sink.
    pub fn resume(&self) {
        self.signals.set_paused(false);
    }

    /// Halt emission and throw away everything queued: pending text, raw
    /// audio, and (via the epoch) windows and frames already in flight.
    pub fn interrupt(&self) {
        self.signals.set_paused(true);
        let epoch = self.signals.bump_epoch();
        let texts = self.tts.clear();
        let chunks = self.featurizer.flush();
        info!(session = %self.session, epoch, texts, chunks, "pipeline interrupted");
    }

    /// Queue text for synthesis. Returns `false` if the queue is full.
    pub fn speak(&self, text: &str) -> bool {
        self.tts.speak(text)
    }

    /// Feed captured audio straight into the featurizer.
    pub fn push_audio(&self, chunk: AudioChunk) {
        self.featurizer.put_audio_chunk(chunk);
    }

    /// Install a new avatar; the render loop picks it up on its next iteration.
    pub fn swap_asset(&self, asset: FrameAsset) -> u64 {
        self.library.swap(asset)
    }

    /// Point the inference context at new weights.
    pub fn reload_model(&self, model_path: &Path) {
        self.library.reload_cell().request_model(model_path);
    }

    /// Speech is queued for synthesis, waiting in the ring or in the window
    /// most recently handed to the render loop.
    pub fn is_speaking(&self) -> bool {
        self.tts.pending() > 0 || self.featurizer.is_speaking()
    }

    /// Cancel every stage and join the threads, abandoning any that outlive
    /// the stop timeout. Returns `true` if all threads exited in time.
    pub fn stop(&mut self) -> bool {
        self.cancel.cancel();
        let deadline = Instant::now() + self.stop_timeout;
        let mut clean = true;
        for (stage, handle) in self.threads.drain(..) {
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(5));
            }
            if handle.is_finished() {
                if handle.join().is_err() {
                    warn!(session = %self.session, stage, "stage thread panicked");
                    clean = false;
                }
            } else {
                warn!(session = %self.session, stage, "stage thread did not stop, abandoning");
                clean = false;
            }
        }
        info!(session = %self.session, clean, "pipeline stopped");
        clean
    }
}

impl Drop for SessionPipeline {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn short(session: &SessionId) -> &str {
    let id = session.as_str();
    id.get(..8).unwrap_or(id)
}
