//! Advisory inference throughput accounting.

use std::time::Duration;
use tracing::info;

/// Frames per reporting window.
pub const REPORT_EVERY_FRAMES: u64 = 100;

/// Rolling average inference speed, reported every [`REPORT_EVERY_FRAMES`].
#[derive(Debug, Default, Clone)]
pub struct InferenceStats {
    window_frames: u64,
    window_elapsed: Duration,
}

impl InferenceStats {
    /// Record one completed batch. Returns the average fps when a window closes.
    pub fn record(&mut self, frames: usize, elapsed: Duration) -> Option<f64> {
        self.window_frames += frames as u64;
        self.window_elapsed += elapsed;

        if self.window_frames < REPORT_EVERY_FRAMES {
            return None;
        }
        let secs = self.window_elapsed.as_secs_f64();
        let fps = if secs > 0.0 {
            self.window_frames as f64 / secs
        } else {
            f64::INFINITY
        };
        info!(frames = self.window_frames, "inference average {fps:.2} fps");
        self.window_frames = 0;
        self.window_elapsed = Duration::ZERO;
        Some(fps)
    }
}
