//! Passthrough backend.

use crate::error::{RenderError, Result};
use crate::pipeline::messages::MelChunk;
use crate::worker::LipSyncModel;
use image::RgbImage;
use std::path::Path;
use tracing::debug;

/// Returns every face crop unchanged. Exercises the full pipeline without a model.
#[derive(Debug, Default)]
pub struct EchoModel;

impl LipSyncModel for EchoModel {
    fn infer(&mut self, faces: &[RgbImage], mels: &[MelChunk]) -> Result<Vec<RgbImage>> {
        if faces.len() != mels.len() {
            return Err(RenderError::Inference(format!(
                "{} faces but {} feature windows",
                faces.len(),
                mels.len()
            )));
        }
        Ok(faces.to_vec())
    }

    fn reload(&mut self, model_path: &Path) -> Result<()> {
        debug!("echo backend ignoring reload of {}", model_path.display());
        Ok(())
    }

    fn name(&self) -> &str {
        "echo"
    }
}
