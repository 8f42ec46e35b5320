//! Shared helpers for integration tests.

use image::{Rgb, RgbImage};
use lipcast::assets::AvatarCatalog;
use lipcast::config::LipcastConfig;
use lipcast::error::Result;
use lipcast::pipeline::messages::{AudioFrame, MelChunk, VideoFrame};
use lipcast::session::SessionManager;
use lipcast::transport::TransportSink;
use lipcast::worker::{LipSyncModel, ModelFactory};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Write `root/name` with `count` 8×8 frames. Frame `i` is `[i, green, 0]`
/// and every frame has the box `[2, 6, 2, 6]`.
pub(crate) fn write_avatar(root: &Path, name: &str, count: usize, green: u8) -> PathBuf {
    let dir = root.join(name);
    let full = dir.join("full_imgs");
    std::fs::create_dir_all(&full).expect("create full_imgs");
    for i in 0..count {
        RgbImage::from_pixel(8, 8, Rgb([i as u8, green, 0]))
            .save(full.join(format!("{i}.png")))
            .expect("write frame");
    }
    std::fs::write(
        dir.join("coords.json"),
        serde_json::to_string(&vec![[2u32, 6, 2, 6]; count]).expect("encode coords"),
    )
    .expect("write coords");
    dir
}

/// Small, fast config rooted at `root` with `anna` (green 50) and `bob`
/// (green 150) registered.
pub(crate) fn test_config(root: &Path, max_sessions: usize) -> (LipcastConfig, AvatarCatalog) {
    let mut config = LipcastConfig::default();
    config.session.max_sessions = max_sessions;
    config.session.worker_join_timeout_ms = 500;
    config.render.batch_size = 2;
    config.render.poll_timeout_ms = 20;
    config.avatar.avatars_root = root.to_path_buf();
    config.avatar.catalog_path = Some(root.join("avatar_map.json"));
    config.avatar.default_avatar_id = "anna".to_owned();

    write_avatar(root, "anna", 4, 50);
    write_avatar(root, "bob", 6, 150);
    let mut catalog = AvatarCatalog::in_memory(root);
    catalog.insert("anna", "anna");
    catalog.insert("bob", "bob");
    (config, catalog)
}

pub(crate) fn start_manager(root: &Path, max_sessions: usize) -> Arc<SessionManager> {
    let (config, catalog) = test_config(root, max_sessions);
    SessionManager::new(config)
        .expect("manager")
        .with_catalog(catalog)
        .start()
        .expect("start manager")
}

/// Sink that keeps every frame it receives.
#[derive(Default)]
pub(crate) struct CollectingSink {
    video: Mutex<Vec<VideoFrame>>,
    audio: AtomicUsize,
}

impl CollectingSink {
    pub(crate) fn video(&self) -> Vec<VideoFrame> {
        self.video.lock().expect("video").clone()
    }

    pub(crate) fn video_len(&self) -> usize {
        self.video.lock().expect("video").len()
    }

    pub(crate) fn audio_len(&self) -> usize {
        self.audio.load(Ordering::SeqCst)
    }
}

impl TransportSink for CollectingSink {
    fn push_video(&self, frame: VideoFrame) -> Result<()> {
        self.video.lock().expect("video").push(frame);
        Ok(())
    }

    fn push_audio(&self, _frame: AudioFrame) -> Result<()> {
        self.audio.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn video_queue_depth(&self) -> usize {
        0
    }
}

/// Model that paints every patch white and counts batches.
#[derive(Default)]
pub(crate) struct ModelCounter {
    pub(crate) calls: AtomicUsize,
    pub(crate) sizes: Mutex<Vec<usize>>,
}

struct WhitePatch(Arc<ModelCounter>);

impl LipSyncModel for WhitePatch {
    fn infer(&mut self, faces: &[RgbImage], _mels: &[MelChunk]) -> Result<Vec<RgbImage>> {
        self.0.calls.fetch_add(1, Ordering::SeqCst);
        self.0.sizes.lock().expect("sizes").push(faces.len());
        Ok(faces
            .iter()
            .map(|f| RgbImage::from_pixel(f.width(), f.height(), Rgb([255, 255, 255])))
            .collect())
    }

    fn reload(&mut self, _model_path: &Path) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        "white-patch"
    }
}

pub(crate) fn white_patch_factory() -> (ModelFactory, Arc<ModelCounter>) {
    let counter = Arc::new(ModelCounter::default());
    let shared = Arc::clone(&counter);
    let factory: ModelFactory = Arc::new(move |_: &Path| -> Result<Box<dyn LipSyncModel>> {
        Ok(Box::new(WhitePatch(Arc::clone(&shared))))
    });
    (factory, counter)
}

/// Poll `cond` until it holds or five seconds pass.
pub(crate) fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}
