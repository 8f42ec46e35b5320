//! Shared reload signal between the session control plane and its render loop.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// What the render loop should pick up on its next iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReloadRequest {
    /// Model weights to (re)load.
    pub model_path: PathBuf,
    /// Avatar directory that was just installed, if the reload came from a swap.
    pub asset_dir: Option<PathBuf>,
    /// Asset generation installed with it.
    pub asset_generation: Option<u64>,
}

#[derive(Debug)]
struct Target {
    model_path: PathBuf,
    asset_dir: Option<PathBuf>,
    asset_generation: Option<u64>,
}

/// Reload flag plus the paths it refers to.
///
/// Writers update the target under the mutex and then raise the flag; the
/// single reader clears the flag before reading the target, so a request
/// raised while a reload is being handled is never lost.
#[derive(Debug)]
pub struct ReloadCell {
    requested: AtomicBool,
    target: Mutex<Target>,
}

impl ReloadCell {
    pub fn new(model_path: PathBuf) -> Self {
        Self {
            requested: AtomicBool::new(false),
            target: Mutex::new(Target {
                model_path,
                asset_dir: None,
                asset_generation: None,
            }),
        }
    }

    /// Request a reload of the current model and asset without changing either.
    pub fn request(&self) {
        self.requested.store(true, Ordering::Release);
    }

    /// Point at new model weights and request a reload.
    pub fn request_model(&self, model_path: &Path) {
        self.lock().model_path = model_path.to_path_buf();
        self.request();
    }

    /// Record a freshly installed avatar asset and request a reload.
    pub fn request_asset(&self, dir: PathBuf, generation: u64) {
        {
            let mut target = self.lock();
            target.asset_dir = Some(dir);
            target.asset_generation = Some(generation);
        }
        self.request();
    }

    /// Clear the flag and return what to reload, if it was set.
    pub fn take(&self) -> Option<ReloadRequest> {
        if !self.requested.swap(false, Ordering::AcqRel) {
            return None;
        }
        let mut target = self.lock();
        Some(ReloadRequest {
            model_path: target.model_path.clone(),
            asset_dir: target.asset_dir.take(),
            asset_generation: target.asset_generation.take(),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Target> {
        self.target.lock().unwrap_or_else(|e| e.into_inner())
    }
}
