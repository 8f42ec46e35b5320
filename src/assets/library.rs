//! Avatar frame assets and the per-session hot-swappable library.
//!
//! An avatar directory looks like:
//!
//! ```text
//! <avatar>/
//!   full_imgs/0.png 1.png ...   full frames, ordered by numeric stem
//!   face_imgs/0.png 1.png ...   optional model-input crops (same count)
//!   coords.json                 [[y1, y2, x1, x2], ...] one box per frame
//!   playback.json               optional {"mode": ..., "audio": ...}
//! ```
//!
//! A loaded [`FrameAsset`] is immutable. Swapping avatars publishes a new
//! `Arc<FrameAsset>` under a bumped generation and raises the reload cell;
//! render loops holding the old `Arc` keep it alive until they let go.

use crate::assets::playback::{IdleClip, PlaybackManifest, PlaybackMode, PlaybackStrategy};
use crate::audio::ingest::decode_wav;
use crate::error::{RenderError, Result};
use crate::worker::reload::ReloadCell;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

const FULL_DIR: &str = "full_imgs";
const FACE_DIR: &str = "face_imgs";
const COORDS_FILE: &str = "coords.json";
const PLAYBACK_FILE: &str = "playback.json";

/// Region of a full frame the predicted face patch is written into.
///
/// Serialized as `[y1, y2, x1, x2]`, half-open on the far edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "[u32; 4]", into = "[u32; 4]")]
pub struct BoundingBox {
    pub y1: u32,
    pub y2: u32,
    pub x1: u32,
    pub x2: u32,
}

impl BoundingBox {
    pub fn width(&self) -> u32 {
        self.x2.saturating_sub(self.x1)
    }

    pub fn height(&self) -> u32 {
        self.y2.saturating_sub(self.y1)
    }

    /// Whether the box is non-empty and lies inside a `width x height` frame.
    pub fn fits(&self, width: u32, height: u32) -> bool {
        self.x1 < self.x2 && self.y1 < self.y2 && self.x2 <= width && self.y2 <= height
    }
}

impl From<[u32; 4]> for BoundingBox {
    fn from([y1, y2, x1, x2]: [u32; 4]) -> Self {
        Self { y1, y2, x1, x2 }
    }
}

impl From<BoundingBox> for [u32; 4] {
    fn from(b: BoundingBox) -> Self {
        [b.y1, b.y2, b.x1, b.x2]
    }
}

/// One avatar identity: image cycle, face crops, boxes and playback strategy.
#[derive(Debug)]
pub struct FrameAsset {
    dir: PathBuf,
    frames: Vec<RgbImage>,
    faces: Vec<RgbImage>,
    boxes: Vec<BoundingBox>,
    strategy: PlaybackStrategy,
}

impl FrameAsset {
    /// Assemble an asset from parts, checking the cycle invariants.
    ///
    /// # Errors
    ///
    /// Returns `RenderError::AssetLoad` if the cycle is empty, the sequences
    /// differ in length, or a box falls outside its frame.
    pub fn from_parts(
        dir: PathBuf,
        frames: Vec<RgbImage>,
        faces: Vec<RgbImage>,
        boxes: Vec<BoundingBox>,
        strategy: PlaybackStrategy,
    ) -> Result<Self> {
        if frames.is_empty() {
            return Err(RenderError::AssetLoad(format!(
                "{}: image cycle is empty",
                dir.display()
            )));
        }
        if frames.len() != boxes.len() || frames.len() != faces.len() {
            return Err(RenderError::AssetLoad(format!(
                "{}: {} frames, {} face crops, {} boxes",
                dir.display(),
                frames.len(),
                faces.len(),
                boxes.len()
            )));
        }
        for (i, (frame, bbox)) in frames.iter().zip(&boxes).enumerate() {
            if !bbox.fits(frame.width(), frame.height()) {
                return Err(RenderError::AssetLoad(format!(
                    "{}: box {i} {:?} outside {}x{} frame",
                    dir.display(),
                    <[u32; 4]>::from(*bbox),
                    frame.width(),
                    frame.height()
                )));
            }
        }
        Ok(Self {
            dir,
            frames,
            faces,
            boxes,
            strategy,
        })
    }

    /// Load an avatar directory.
    ///
    /// # Errors
    ///
    /// Returns `RenderError::AssetLoad` for a missing directory, unreadable
    /// images or metadata, or a cycle that fails validation.
    pub fn load(dir: &Path, sample_rate: u32) -> Result<Self> {
        if !dir.is_dir() {
            return Err(RenderError::AssetLoad(format!(
                "avatar directory not found: {}",
                dir.display()
            )));
        }

        let frames = read_image_dir(&dir.join(FULL_DIR))?;
        let boxes: Vec<BoundingBox> = read_json(&dir.join(COORDS_FILE))?;

        let face_dir = dir.join(FACE_DIR);
        let faces = if face_dir.is_dir() {
            read_image_dir(&face_dir)?
        } else {
            frames
                .iter()
                .zip(&boxes)
                .map(|(frame, b)| crop(frame, b))
                .collect()
        };

        let strategy = read_strategy(dir, sample_rate)?;
        let asset = Self::from_parts(dir.to_path_buf(), frames, faces, boxes, strategy)?;
        info!(
            "loaded avatar {} ({} frames, {})",
            dir.display(),
            asset.len(),
            asset.strategy.name()
        );
        Ok(asset)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Length of the image cycle. Always > 0.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn strategy(&self) -> &PlaybackStrategy {
        &self.strategy
    }

    /// Map a frame counter onto a cycle position.
    pub fn mirror_index(&self, i: usize) -> usize {
        self.strategy.mirror_index(i, self.len())
    }

    pub fn frame(&self, index: usize) -> &RgbImage {
        &self.frames[index % self.frames.len()]
    }

    pub fn face(&self, index: usize) -> &RgbImage {
        &self.faces[index % self.faces.len()]
    }

    pub fn bbox(&self, index: usize) -> BoundingBox {
        self.boxes[index % self.boxes.len()]
    }
}

fn crop(frame: &RgbImage, b: &BoundingBox) -> RgbImage {
    image::imageops::crop_imm(frame, b.x1, b.y1, b.width(), b.height()).to_image()
}

/// Read every image in `dir`, ordered by numeric file stem.
fn read_image_dir(dir: &Path) -> Result<Vec<RgbImage>> {
    let entries = std::fs::read_dir(dir).map_err(|e| {
        RenderError::AssetLoad(format!("cannot read {}: {e}", dir.display()))
    })?;

    let mut numbered: Vec<(u64, PathBuf)> = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let is_image = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| matches!(e.to_ascii_lowercase().as_str(), "png" | "jpg" | "jpeg"));
        if !is_image {
            continue;
        }
        match path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u64>().ok())
        {
            Some(n) => numbered.push((n, path)),
            None => warn!("skipping non-numeric frame {}", path.display()),
        }
    }
    numbered.sort_by_key(|(n, _)| *n);

    numbered
        .iter()
        .map(|(_, path)| {
            image::open(path)
                .map(|img| img.to_rgb8())
                .map_err(|e| RenderError::AssetLoad(format!("failed to open {}: {e}", path.display())))
        })
        .collect()
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| RenderError::AssetLoad(format!("cannot read {}: {e}", path.display())))?;
    serde_json::from_str(&raw)
        .map_err(|e| RenderError::AssetLoad(format!("malformed {}: {e}", path.display())))
}

fn read_strategy(dir: &Path, sample_rate: u32) -> Result<PlaybackStrategy> {
    let path = dir.join(PLAYBACK_FILE);
    let manifest: PlaybackManifest = if path.is_file() {
        read_json(&path)?
    } else {
        PlaybackManifest::default()
    };

    Ok(match manifest.mode {
        PlaybackMode::Cyclic => PlaybackStrategy::Cyclic,
        PlaybackMode::PingPong => PlaybackStrategy::PingPong,
        PlaybackMode::CustomAudio => {
            let name = manifest.audio.ok_or_else(|| {
                RenderError::AssetLoad(format!(
                    "{}: custom_audio playback needs an \"audio\" clip",
                    path.display()
                ))
            })?;
            let clip_path = dir.join(name);
            let bytes = std::fs::read(&clip_path).map_err(|e| {
                RenderError::AssetLoad(format!("cannot read {}: {e}", clip_path.display()))
            })?;
            PlaybackStrategy::CustomAudio {
                clip: IdleClip::new(decode_wav(&bytes, sample_rate)?),
            }
        }
    })
}

/// A published asset together with the generation it was installed under.
#[derive(Debug, Clone)]
pub struct AssetSnapshot {
    pub asset: Arc<FrameAsset>,
    pub generation: u64,
}

/// The current avatar asset of one session.
///
/// Readers take cheap snapshots; [`swap`](Self::swap) replaces the whole
/// asset and never blocks a render loop beyond the pointer exchange.
pub struct FrameAssetLibrary {
    current: RwLock<AssetSnapshot>,
    reload: Arc<ReloadCell>,
}

impl FrameAssetLibrary {
    pub fn new(asset: FrameAsset, reload: Arc<ReloadCell>) -> Self {
        Self {
            current: RwLock::new(AssetSnapshot {
                asset: Arc::new(asset),
                generation: 0,
            }),
            reload,
        }
    }

    /// Load an asset from `dir` without installing it.
    ///
    /// # Errors
    ///
    /// See [`FrameAsset::load`].
    pub fn load(dir: &Path, sample_rate: u32) -> Result<FrameAsset> {
        FrameAsset::load(dir, sample_rate)
    }

    /// The asset currently installed.
    pub fn snapshot(&self) -> AssetSnapshot {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn generation(&self) -> u64 {
        self.snapshot().generation
    }

    /// Install `asset` and signal the render loop to reload. Returns the new generation.
    pub fn swap(&self, asset: FrameAsset) -> u64 {
        let dir = asset.dir().to_path_buf();
        let generation = {
            let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
            let generation = current.generation + 1;
            *current = AssetSnapshot {
                asset: Arc::new(asset),
                generation,
            };
            generation
        };
        self.reload.request_asset(dir, generation);
        generation
    }

    pub fn reload_cell(&self) -> &Arc<ReloadCell> {
        &self.reload
    }
}
