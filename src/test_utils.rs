//! Shared test fixtures: avatar directories on disk, a scripted lip-sync
//! model and recording fakes for the transport and the backpressure clock.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use crate::error::{RenderError, Result};
use crate::pipeline::messages::{AudioFrame, MelChunk, VideoFrame};
use crate::render::Sleeper;
use crate::transport::TransportSink;
use crate::worker::{LipSyncModel, ModelFactory};
use image::{Rgb, RgbImage};
use std::collections::VecDeque;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// `n` distinct `w`×`h` frames; frame `i` is filled with `[i, i, i]`.
pub fn solid_frames(n: usize, w: u32, h: u32) -> Vec<RgbImage> {
    (0..n)
        .map(|i| RgbImage::from_pixel(w, h, Rgb([i as u8; 3])))
        .collect()
}

/// Write an avatar directory `root/name` with `count` 8×8 frames and a
/// `[2, 6, 2, 6]` box per frame. Frame `i` is `[i, rgb[1], rgb[2]]`, so the
/// red channel identifies the frame.
pub fn write_avatar(root: &Path, name: &str, count: usize, rgb: [u8; 3]) -> PathBuf {
    let dir = root.join(name);
    let full = dir.join("full_imgs");
    std::fs::create_dir_all(&full).expect("create full_imgs");
    for i in 0..count {
        RgbImage::from_pixel(8, 8, Rgb([i as u8, rgb[1], rgb[2]]))
            .save(full.join(format!("{i}.png")))
            .expect("write frame");
    }
    let coords = vec![[2u32, 6, 2, 6]; count];
    std::fs::write(
        dir.join("coords.json"),
        serde_json::to_string(&coords).expect("encode coords"),
    )
    .expect("write coords");
    dir
}

/// Encode 16-bit integer samples as an in-memory WAV file.
pub fn wav_bytes(rate: u32, channels: u16, samples: &[i16]) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels,
        sample_rate: rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).expect("wav writer");
        for s in samples {
            writer.write_sample(*s).expect("write sample");
        }
        writer.finalize().expect("finalize wav");
    }
    cursor.into_inner()
}

/// What the scripted model does on its next `infer` call.
#[derive(Debug, Clone)]
pub enum Step {
    Echo,
    Fail,
    Panic,
    Sleep(Duration),
}

/// Shared record of what every model built by one factory saw.
#[derive(Debug, Default)]
pub struct ScriptLog {
    pub builds: AtomicUsize,
    pub calls: AtomicUsize,
    steps: Mutex<VecDeque<Step>>,
    batches: Mutex<Vec<usize>>,
    reloaded: Mutex<Vec<PathBuf>>,
}

impl ScriptLog {
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().expect("batches").clone()
    }

    pub fn reloads(&self) -> Vec<PathBuf> {
        self.reloaded.lock().expect("reloads").clone()
    }

    fn next_step(&self) -> Step {
        self.steps.lock().expect("steps").pop_front().unwrap_or(Step::Echo)
    }
}

/// Model that follows a script, then echoes once the script runs out.
pub struct ScriptedModel {
    log: Arc<ScriptLog>,
}

impl LipSyncModel for ScriptedModel {
    fn infer(&mut self, faces: &[RgbImage], _mels: &[MelChunk]) -> Result<Vec<RgbImage>> {
        self.log.calls.fetch_add(1, Ordering::SeqCst);
        self.log.batches.lock().expect("batches").push(faces.len());
        match self.log.next_step() {
            Step::Echo => Ok(faces.to_vec()),
            Step::Fail => Err(RenderError::Inference("scripted failure".to_owned())),
            Step::Panic => panic!("scripted panic"),
            Step::Sleep(d) => {
                std::thread::sleep(d);
                Ok(faces.to_vec())
            }
        }
    }

    fn reload(&mut self, model_path: &Path) -> Result<()> {
        self.log
            .reloaded
            .lock()
            .expect("reloads")
            .push(model_path.to_path_buf());
        Ok(())
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Factory whose models share one script and one log.
pub fn scripted_factory(steps: Vec<Step>) -> (ModelFactory, Arc<ScriptLog>) {
    let log = Arc::new(ScriptLog {
        steps: Mutex::new(steps.into()),
        ..ScriptLog::default()
    });
    let shared = Arc::clone(&log);
    let factory: ModelFactory = Arc::new(move |_: &Path| -> Result<Box<dyn LipSyncModel>> {
        shared.builds.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedModel {
            log: Arc::clone(&shared),
        }))
    });
    (factory, log)
}

/// Sink that keeps every frame and can be told to fail or report a depth.
#[derive(Default)]
pub struct RecordingSink {
    video: Mutex<Vec<VideoFrame>>,
    audio: Mutex<Vec<AudioFrame>>,
    depth: AtomicUsize,
    failing: AtomicBool,
}

impl RecordingSink {
    pub fn video(&self) -> Vec<VideoFrame> {
        self.video.lock().expect("video").clone()
    }

    pub fn audio(&self) -> Vec<AudioFrame> {
        self.audio.lock().expect("audio").clone()
    }

    pub fn set_depth(&self, depth: usize) {
        self.depth.store(depth, Ordering::SeqCst);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(RenderError::Transport("sink down".to_owned()))
        } else {
            Ok(())
        }
    }
}

impl TransportSink for RecordingSink {
    fn push_video(&self, frame: VideoFrame) -> Result<()> {
        self.check()?;
        self.video.lock().expect("video").push(frame);
        Ok(())
    }

    fn push_audio(&self, frame: AudioFrame) -> Result<()> {
        self.check()?;
        self.audio.lock().expect("audio").push(frame);
        Ok(())
    }

    fn video_queue_depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }
}

/// Sleeper that records requested delays instead of sleeping.
#[derive(Default)]
pub struct RecordingSleeper {
    sleeps: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().expect("sleeps").clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        self.sleeps.lock().expect("sleeps").push(duration);
    }
}
