//! Configuration types for the avatar render pipeline.

use crate::error::{RenderError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration for lipcast.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LipcastConfig {
    /// Raw audio framing and queue bounds.
    pub audio: AudioConfig,
    /// Acoustic feature extraction.
    pub features: FeatureConfig,
    /// Render loop settings.
    pub render: RenderConfig,
    /// Frame emitter and backpressure settings.
    pub emitter: EmitterConfig,
    /// Session admission and teardown.
    pub session: SessionConfig,
    /// Avatar asset store.
    pub avatar: AvatarConfig,
    /// Lip-sync inference backend.
    pub worker: WorkerConfig,
    /// Log output.
    pub logging: LoggingConfig,
}

/// Raw audio configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Pipeline sample rate in Hz (mono).
    pub sample_rate: u32,
    /// Samples per audio chunk (20 ms at 16 kHz).
    pub chunk_samples: usize,
    /// Capacity of the raw-audio ring. The oldest chunk is dropped when full.
    pub ring_capacity: usize,
    /// Capacity of the feature-window queue between featurizer and render loop.
    pub feature_queue_capacity: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            chunk_samples: 320,
            ring_capacity: 1_500, // 30 s of speech
            feature_queue_capacity: 2,
        }
    }
}

impl AudioConfig {
    /// Duration of one chunk.
    pub fn chunk_duration(&self) -> Duration {
        Duration::from_secs_f64(self.chunk_samples as f64 / self.sample_rate as f64)
    }
}

/// Mel-spectrogram feature configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    /// Number of mel bands.
    pub mel_bins: usize,
    /// Mel frames per video frame window.
    pub mel_window: usize,
    /// FFT size (and analysis window length) in samples.
    pub n_fft: usize,
    /// Hop length in samples.
    pub hop: usize,
    /// Lowest mel filter frequency in Hz.
    pub fmin: f32,
    /// Highest mel filter frequency in Hz.
    pub fmax: f32,
    /// Chunks of history kept in front of each batch for window context.
    pub left_context_chunks: usize,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            mel_bins: 80,
            mel_window: 16,
            n_fft: 800,
            hop: 200,
            fmin: 55.0,
            fmax: 7_600.0,
            left_context_chunks: 10,
        }
    }
}

/// Render loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Frames per feature window and per inference call.
    pub batch_size: usize,
    /// Output video frame rate.
    pub fps: u32,
    /// Poll timeout while waiting for a feature window (shutdown check cadence).
    pub poll_timeout_ms: u64,
    /// Upper bound for one inference call before the batch is dropped.
    pub inference_timeout_ms: u64,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            batch_size: 16,
            fps: 25,
            poll_timeout_ms: 1_000,
            inference_timeout_ms: 5_000,
        }
    }
}

impl RenderConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn inference_timeout(&self) -> Duration {
        Duration::from_millis(self.inference_timeout_ms)
    }

    /// Audio chunks paired with one video frame.
    pub fn chunks_per_frame(&self) -> usize {
        2
    }
}

/// Frame emitter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmitterConfig {
    /// Outbound video queue depth at which the emitter starts sleeping.
    pub backpressure_threshold: usize,
    /// Nominal video frame interval in seconds.
    pub frame_interval_secs: f64,
    /// Fraction of the queued playout time to sleep for.
    pub backpressure_factor: f64,
    /// Consecutive sink failures before the session is reported as failed.
    pub transport_failure_limit: u32,
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            backpressure_threshold: 5,
            frame_interval_secs: 0.04,
            backpressure_factor: 0.8,
            transport_failure_limit: 50,
        }
    }
}

/// Session admission configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum number of sessions that are not `Closed`.
    pub max_sessions: usize,
    /// How long teardown waits for pipeline threads before abandoning them.
    pub worker_join_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: 1,
            worker_join_timeout_ms: 2_000,
        }
    }
}

impl SessionConfig {
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_join_timeout_ms)
    }
}

/// Avatar asset store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AvatarConfig {
    /// Directory holding one subdirectory per avatar.
    pub avatars_root: PathBuf,
    /// JSON file mapping avatar id to directory (None = `<avatars_root>/avatar_map.json`).
    pub catalog_path: Option<PathBuf>,
    /// Avatar used for new sessions.
    pub default_avatar_id: String,
}

impl Default for AvatarConfig {
    fn default() -> Self {
        let avatars_root = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("lipcast")
            .join("avatars");
        Self {
            avatars_root,
            catalog_path: None,
            default_avatar_id: "default".to_owned(),
        }
    }
}

impl AvatarConfig {
    /// Resolved catalog file path.
    pub fn effective_catalog_path(&self) -> PathBuf {
        self.catalog_path
            .clone()
            .unwrap_or_else(|| self.avatars_root.join("avatar_map.json"))
    }
}

/// Which lip-sync inference backend to run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerBackend {
    /// Return face crops unchanged. Useful for dry runs and wiring checks.
    #[default]
    Echo,
    /// Host the model in a child process over stdin/stdout.
    Subprocess,
}

/// Lip-sync inference configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Backend selection.
    pub backend: WorkerBackend,
    /// Model weights handed to the backend on start and on every reload.
    pub model_path: PathBuf,
    /// Executable for the subprocess backend.
    pub command: Option<PathBuf>,
    /// Extra arguments for the subprocess backend.
    pub args: Vec<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            backend: WorkerBackend::Echo,
            model_path: PathBuf::from("models/wav2lip.pth"),
            command: None,
            args: Vec::new(),
        }
    }
}

/// Log output configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Directory for daily-rolling log files (None = stderr only).
    pub directory: Option<PathBuf>,
}

impl LipcastConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| RenderError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| RenderError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `~/.config/lipcast/config.toml`.
    pub fn default_config_path() -> PathBuf {
        if let Some(config) = std::env::var_os("XDG_CONFIG_HOME") {
            PathBuf::from(config).join("lipcast").join("config.toml")
        } else if let Some(home) = std::env::var_os("HOME") {
            PathBuf::from(home)
                .join(".config")
                .join("lipcast")
                .join("config.toml")
        } else {
            PathBuf::from("/tmp/lipcast-config/config.toml")
        }
    }

    /// Check the invariants the pipeline relies on.
    ///
    /// # Errors
    ///
    /// Returns `RenderError::Config` describing the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(RenderError::Config(msg));

        if self.render.batch_size == 0 {
            return fail("render.batch_size must be > 0".to_owned());
        }
        if self.render.fps == 0 {
            return fail("render.fps must be > 0".to_owned());
        }
        if self.audio.chunk_samples == 0 || self.audio.sample_rate == 0 {
            return fail("audio.sample_rate and audio.chunk_samples must be > 0".to_owned());
        }
        let per_second =
            self.audio.chunk_samples * self.render.chunks_per_frame() * self.render.fps as usize;
        if per_second != self.audio.sample_rate as usize {
            return fail(format!(
                "audio.chunk_samples ({}) x {} chunks x {} fps must equal audio.sample_rate ({})",
                self.audio.chunk_samples,
                self.render.chunks_per_frame(),
                self.render.fps,
                self.audio.sample_rate
            ));
        }
        if self.audio.ring_capacity == 0 || self.audio.feature_queue_capacity == 0 {
            return fail("audio queue capacities must be > 0".to_owned());
        }
        if self.features.mel_bins == 0 || self.features.mel_window == 0 {
            return fail("features.mel_bins and features.mel_window must be > 0".to_owned());
        }
        if self.features.hop == 0 || self.features.n_fft < self.features.hop {
            return fail("features.n_fft must be >= features.hop > 0".to_owned());
        }
        if self.features.fmin >= self.features.fmax {
            return fail("features.fmin must be below features.fmax".to_owned());
        }
        if self.session.max_sessions == 0 {
            return fail("session.max_sessions must be > 0".to_owned());
        }
        if self.worker.backend == WorkerBackend::Subprocess && self.worker.command.is_none() {
            return fail("worker.command is required for the subprocess backend".to_owned());
        }
        Ok(())
    }
}
