//! Speech drives the lip-sync model; silence never does.

use crate::helpers::{CollectingSink, test_config, wait_for, white_patch_factory};
use image::RgbImage;
use lipcast::session::SessionManager;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

#[test]
fn speech_is_rendered_through_the_model_in_full_batches() {
    let root = tempfile::tempdir().unwrap();
    let (config, catalog) = test_config(root.path(), 1);
    let (factory, counter) = white_patch_factory();
    let manager = SessionManager::new(config)
        .unwrap()
        .with_catalog(catalog)
        .with_models(factory)
        .start()
        .unwrap();

    let sink = Arc::new(CollectingSink::default());
    let id = manager.negotiate(sink.clone(), None).unwrap();
    manager.activate(&id).unwrap();

    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(counter.calls.load(Ordering::SeqCst), 0, "silence skips inference");

    manager.speak(&id, "hello avatar").unwrap();
    assert!(wait_for(|| counter.calls.load(Ordering::SeqCst) > 0));
    let lip_synced = |sink: &CollectingSink| {
        sink.video().iter().any(|f| {
            let img = RgbImage::from_raw(f.width, f.height, f.data.clone()).unwrap();
            img.get_pixel(3, 3).0 == [255, 255, 255] && img.get_pixel(0, 0).0[1] == 50
        })
    };
    assert!(wait_for(|| lip_synced(&sink)));
    manager.shutdown();

    assert!(counter.sizes.lock().unwrap().iter().all(|n| *n == 2));
    assert_eq!(sink.audio_len(), 2 * sink.video_len(), "two audio chunks per video frame");
}
