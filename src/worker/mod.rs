//! Lip-sync inference: the model boundary and the isolated worker that hosts it.

pub mod echo;
pub mod inference;
pub mod reload;
pub mod stats;
pub mod subprocess;

pub use echo::EchoModel;
pub use inference::InferenceWorker;
pub use reload::{ReloadCell, ReloadRequest};
pub use stats::InferenceStats;
pub use subprocess::{KillSwitch, SubprocessModel};

use crate::config::{WorkerBackend, WorkerConfig};
use crate::error::{RenderError, Result};
use crate::pipeline::messages::MelChunk;
use image::RgbImage;
use std::path::Path;
use std::sync::Arc;

/// A batch lip-sync model.
///
/// `infer` takes `B` face crops and `B` mel windows in frame order and must
/// return `B` predicted face patches in the same order.
pub trait LipSyncModel: Send {
    /// Run one forward pass over a batch.
    ///
    /// # Errors
    ///
    /// Returns `RenderError::Inference` when the batch cannot be processed.
    fn infer(&mut self, faces: &[RgbImage], mels: &[MelChunk]) -> Result<Vec<RgbImage>>;

    /// Swap model weights in place.
    ///
    /// # Errors
    ///
    /// Returns an error if the weights cannot be loaded; the previous weights
    /// stay active.
    fn reload(&mut self, model_path: &Path) -> Result<()>;

    /// Short backend name for logs.
    fn name(&self) -> &str;

    /// `false` once the backend can no longer serve requests and must be rebuilt.
    fn is_healthy(&self) -> bool {
        true
    }

    /// Handle for force-terminating an out-of-process backend.
    fn kill_switch(&self) -> Option<KillSwitch> {
        None
    }
}

/// Builds a fresh model instance for the given weights.
///
/// Called on the inference thread, so construction failures and panics stay
/// contained there.
pub type ModelFactory = Arc<dyn Fn(&Path) -> Result<Box<dyn LipSyncModel>> + Send + Sync>;

/// Factory for the configured backend.
pub fn model_factory(config: &WorkerConfig) -> Result<ModelFactory> {
    let factory: ModelFactory = match config.backend {
        WorkerBackend::Echo => Arc::new(|_: &Path| -> Result<Box<dyn LipSyncModel>> {
            Ok(Box::new(EchoModel))
        }),
        WorkerBackend::Subprocess => {
            let command = config.command.clone().ok_or_else(|| {
                RenderError::Config("worker.command is required for the subprocess backend".to_owned())
            })?;
            let args = config.args.clone();
            Arc::new(move |model_path: &Path| -> Result<Box<dyn LipSyncModel>> {
                Ok(Box::new(SubprocessModel::spawn(&command, &args, model_path)?))
            })
        }
    };
    Ok(factory)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn echo_factory_builds_echo_model() {
        let factory = model_factory(&WorkerConfig::default()).unwrap();
        let model = factory(Path::new("unused")).unwrap();
        assert_eq!(model.name(), "echo");
        assert!(model.kill_switch().is_none());
    }

    #[test]
    fn subprocess_factory_requires_command() {
        let config = WorkerConfig {
            backend: WorkerBackend::Subprocess,
            ..WorkerConfig::default()
        };
        assert!(matches!(model_factory(&config), Err(RenderError::Config(_))));
    }

    #[test]
    fn echo_returns_faces_unchanged() {
        let mut model = EchoModel;
        let faces = vec![RgbImage::from_pixel(2, 2, image::Rgb([9, 8, 7]))];
        let out = model.infer(&faces, &[MelChunk::zeros(80, 16)]).unwrap();
        assert_eq!(out, faces);
        assert!(model.infer(&faces, &[]).is_err());
    }
}
