//! Turns rendered frames into transport frames.

use crate::assets::FrameAssetLibrary;
use crate::audio::ingest::to_pcm16;
use crate::config::EmitterConfig;
use crate::pipeline::SessionSignals;
use crate::pipeline::messages::{
    AudioFrame, FrameContent, PipelineEvent, PixelFormat, RenderedFrame, SessionId, VideoFrame,
};
use crate::transport::TransportSink;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use image::RgbImage;
use image::imageops::{self, FilterType};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

/// Sleep hook used for backpressure, swappable in tests.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

/// Real thread sleep.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// What happened to one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitOutcome {
    Sent,
    /// Session paused or frame from a stale epoch.
    Skipped,
    /// At least one push to the sink failed.
    Failed,
}

pub struct FrameEmitter {
    session: SessionId,
    sink: Arc<dyn TransportSink>,
    library: Arc<FrameAssetLibrary>,
    signals: Arc<SessionSignals>,
    sleeper: Arc<dyn Sleeper>,
    events: Option<Sender<PipelineEvent>>,
    config: EmitterConfig,
    sample_rate: u32,
    consecutive_failures: u32,
    failure_reported: bool,
}

impl FrameEmitter {
    pub fn new(
        session: SessionId,
        sink: Arc<dyn TransportSink>,
        library: Arc<FrameAssetLibrary>,
        signals: Arc<SessionSignals>,
        config: EmitterConfig,
        sample_rate: u32,
    ) -> Self {
        Self {
            session,
            sink,
            library,
            signals,
            sleeper: Arc::new(ThreadSleeper),
            events: None,
            config,
            sample_rate,
            consecutive_failures: 0,
            failure_reported: false,
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Where to report sustained transport failure.
    pub fn with_events(mut self, events: Sender<PipelineEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Drain `frames` until cancelled or the render loop hangs up.
    pub fn run(mut self, frames: Receiver<RenderedFrame>, cancel: CancellationToken, poll: Duration) {
        debug!(session = %self.session, "emitter started");
        while !cancel.is_cancelled() {
            match frames.recv_timeout(poll) {
                Ok(frame) => {
                    self.emit(frame);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!(session = %self.session, "emitter stopped");
    }

    /// Sleep owed for a given outbound video depth, if any.
    pub fn backpressure_delay(&self, depth: usize) -> Option<Duration> {
        if depth < self.config.backpressure_threshold {
            return None;
        }
        Some(Duration::from_secs_f64(
            self.config.frame_interval_secs * depth as f64 * self.config.backpressure_factor,
        ))
    }

    /// Composite, package and push one frame with its audio.
    pub fn emit(&mut self, frame: RenderedFrame) -> EmitOutcome {
        if self.signals.is_paused() || !self.signals.is_current(frame.epoch) {
            trace!(session = %self.session, seq = frame.seq, "dropping frame while paused");
            return EmitOutcome::Skipped;
        }

        let depth = self.sink.video_queue_depth();
        if let Some(delay) = self.backpressure_delay(depth) {
            trace!(session = %self.session, depth, "outbound backpressure, sleeping {delay:?}");
            self.sleeper.sleep(delay);
        }

        let image = self.compose(&frame);
        let video = VideoFrame {
            seq: frame.seq,
            width: image.width(),
            height: image.height(),
            format: PixelFormat::Rgb24,
            data: image.into_raw(),
        };

        let mut ok = self.record(self.sink.push_video(video));
        for chunk in &frame.audio {
            let audio = AudioFrame {
                sample_rate: self.sample_rate,
                samples: to_pcm16(&chunk.samples),
            };
            ok &= self.record(self.sink.push_audio(audio));
        }

        if ok {
            self.consecutive_failures = 0;
            self.failure_reported = false;
            EmitOutcome::Sent
        } else {
            self.note_failure();
            EmitOutcome::Failed
        }
    }

    /// Build the outgoing image against the asset that is current right now.
    fn compose(&self, frame: &RenderedFrame) -> RgbImage {
        let snapshot = self.library.snapshot();
        let asset = &snapshot.asset;
        let mut base = asset.frame(frame.cycle_index).clone();

        let FrameContent::Composite(patch) = &frame.content else {
            return base;
        };
        if snapshot.generation != frame.generation {
            debug!(
                session = %self.session,
                seq = frame.seq,
                "patch from asset generation {} dropped, current is {}",
                frame.generation,
                snapshot.generation
            );
            return base;
        }

        let bbox = asset.bbox(frame.cycle_index);
        let (w, h) = (bbox.width(), bbox.height());
        if patch.dimensions() == (w, h) {
            imageops::replace(&mut base, patch, i64::from(bbox.x1), i64::from(bbox.y1));
        } else {
            let resized = imageops::resize(patch, w, h, FilterType::Triangle);
            imageops::replace(&mut base, &resized, i64::from(bbox.x1), i64::from(bbox.y1));
        }
        base
    }

    fn record(&self, result: crate::error::Result<()>) -> bool {
        match result {
            Ok(()) => true,
            Err(e) => {
                if self.consecutive_failures == 0 {
                    warn!(session = %self.session, "transport push failed: {e}");
                } else {
                    trace!(session = %self.session, "transport push failed: {e}");
                }
                false
            }
        }
    }

    fn note_failure(&mut self) {
        self.consecutive_failures += 1;
        if self.consecutive_failures < self.config.transport_failure_limit || self.failure_reported {
            return;
        }
        error!(
            session = %self.session,
            failures = self.consecutive_failures,
            "transport failing persistently"
        );
        self.failure_reported = true;
        if let Some(events) = &self.events {
            let _ = events.try_send(PipelineEvent::TransportFailed {
                session: self.session.clone(),
            });
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::assets::{BoundingBox, FrameAsset, PlaybackStrategy};
    use crate::pipeline::messages::AudioChunk;
    use crate::test_utils::{RecordingSink, RecordingSleeper, solid_frames};
    use crate::worker::ReloadCell;
    use image::Rgb;
    use std::path::PathBuf;

    fn asset(name: &str, shade: u8) -> FrameAsset {
        let frames = vec![RgbImage::from_pixel(8, 8, Rgb([shade, shade, shade])); 4];
        FrameAsset::from_parts(
            PathBuf::from(name),
            frames.clone(),
            solid_frames(4, 4, 4),
            vec![BoundingBox::from([2, 6, 2, 6]); 4],
            PlaybackStrategy::Cyclic,
        )
        .unwrap()
    }

    struct Fixture {
        emitter: FrameEmitter,
        sink: Arc<RecordingSink>,
        sleeper: Arc<RecordingSleeper>,
        library: Arc<FrameAssetLibrary>,
        signals: Arc<SessionSignals>,
    }

    fn fixture(config: EmitterConfig) -> Fixture {
        let sink = Arc::new(RecordingSink::default());
        let sleeper = Arc::new(RecordingSleeper::default());
        let library = Arc::new(FrameAssetLibrary::new(
            asset("a", 10),
            Arc::new(ReloadCell::new(PathBuf::from("m"))),
        ));
        let signals = Arc::new(SessionSignals::new());
        let emitter = FrameEmitter::new(
            SessionId::from("s1"),
            Arc::clone(&sink) as Arc<dyn TransportSink>,
            Arc::clone(&library),
            Arc::clone(&signals),
            config,
            16_000,
        )
        .with_sleeper(Arc::clone(&sleeper) as Arc<dyn Sleeper>);
        Fixture {
            emitter,
            sink,
            sleeper,
            library,
            signals,
        }
    }

    fn frame(seq: u64, content: FrameContent, generation: u64) -> RenderedFrame {
        RenderedFrame {
            seq,
            cycle_index: 1,
            generation,
            epoch: 0,
            content,
            audio: vec![AudioChunk::speech(vec![0.5; 320]), AudioChunk::silent(320)],
        }
    }

    fn red_patch() -> FrameContent {
        FrameContent::Composite(RgbImage::from_pixel(2, 2, Rgb([255, 0, 0])))
    }

    #[test]
    fn composite_writes_patch_into_box() {
        let mut fx = fixture(EmitterConfig::default());
        assert_eq!(fx.emitter.emit(frame(0, red_patch(), 0)), EmitOutcome::Sent);

        let video = fx.sink.video();
        assert_eq!(video.len(), 1);
        let img = RgbImage::from_raw(8, 8, video[0].data.clone()).unwrap();
        assert_eq!(img.get_pixel(3, 3).0, [255, 0, 0]);
        assert_eq!(img.get_pixel(0, 0).0, [10, 10, 10]);
        assert_eq!(img.get_pixel(6, 6).0, [10, 10, 10]);
    }

    #[test]
    fn replay_passes_frame_through() {
        let mut fx = fixture(EmitterConfig::default());
        fx.emitter.emit(frame(0, FrameContent::Replay, 0));
        let video = fx.sink.video();
        assert!(video[0].data.iter().all(|b| *b == 10));
        assert_eq!(video[0].format, PixelFormat::Rgb24);
    }

    #[test]
    fn each_chunk_becomes_an_audio_frame() {
        let mut fx = fixture(EmitterConfig::default());
        fx.emitter.emit(frame(0, FrameContent::Replay, 0));
        let audio = fx.sink.audio();
        assert_eq!(audio.len(), 2);
        assert_eq!(audio[0].samples[0], 16_383);
        assert!(audio[1].samples.iter().all(|s| *s == 0));
        assert_eq!(audio[0].sample_rate, 16_000);
    }

    #[test]
    fn stale_generation_drops_patch_and_uses_new_asset() {
        let mut fx = fixture(EmitterConfig::default());
        fx.library.swap(asset("b", 200));
        fx.emitter.emit(frame(0, red_patch(), 0));
        let video = fx.sink.video();
        assert!(video[0].data.iter().all(|b| *b == 200));
    }

    #[test]
    fn backpressure_sleeps_proportionally() {
        let mut fx = fixture(EmitterConfig::default());
        fx.sink.set_depth(6);
        fx.emitter.emit(frame(0, FrameContent::Replay, 0));
        let sleeps = fx.sleeper.sleeps();
        assert_eq!(sleeps.len(), 1);
        assert!((sleeps[0].as_secs_f64() - 0.192).abs() < 1e-9);
    }

    #[test]
    fn no_sleep_below_threshold() {
        let mut fx = fixture(EmitterConfig::default());
        fx.sink.set_depth(4);
        fx.emitter.emit(frame(0, FrameContent::Replay, 0));
        assert!(fx.sleeper.sleeps().is_empty());
        assert!(fx.emitter.backpressure_delay(5).is_some());
    }

    #[test]
    fn paused_or_stale_frames_are_skipped() {
        let mut fx = fixture(EmitterConfig::default());
        fx.signals.set_paused(true);
        assert_eq!(fx.emitter.emit(frame(0, FrameContent::Replay, 0)), EmitOutcome::Skipped);
        fx.signals.set_paused(false);
        fx.signals.bump_epoch();
        assert_eq!(fx.emitter.emit(frame(1, FrameContent::Replay, 0)), EmitOutcome::Skipped);
        assert!(fx.sink.video().is_empty());
    }

    #[test]
    fn sustained_failure_is_reported_once() {
        let config = EmitterConfig {
            transport_failure_limit: 3,
            ..EmitterConfig::default()
        };
        let mut fx = fixture(config);
        let (tx, rx) = crossbeam_channel::unbounded();
        fx.emitter = fx.emitter.with_events(tx);
        fx.sink.set_failing(true);

        for seq in 0..5 {
            assert_eq!(
                fx.emitter.emit(frame(seq, FrameContent::Replay, 0)),
                EmitOutcome::Failed
            );
        }
        assert_eq!(
            rx.try_iter().collect::<Vec<_>>(),
            vec![PipelineEvent::TransportFailed {
                session: SessionId::from("s1")
            }]
        );

        fx.sink.set_failing(false);
        fx.emitter.emit(frame(5, FrameContent::Replay, 0));
        assert_eq!(fx.emitter.consecutive_failures(), 0);
    }
}
