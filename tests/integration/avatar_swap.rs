//! Live avatar swaps against a streaming session.

use crate::helpers::{CollectingSink, start_manager, wait_for};
use image::RgbImage;
use lipcast::RenderError;
use lipcast::pipeline::messages::VideoFrame;
use lipcast::session::{SessionManager, SessionState};
use std::sync::Arc;

fn pixel(frame: &VideoFrame, x: u32, y: u32) -> [u8; 3] {
    let img = RgbImage::from_raw(frame.width, frame.height, frame.data.clone()).unwrap();
    img.get_pixel(x, y).0
}

#[test]
fn silent_stream_replays_the_cycle_in_order() {
    let root = tempfile::tempdir().unwrap();
    let manager = start_manager(root.path(), 1);
    let sink = Arc::new(CollectingSink::default());
    let id = manager.negotiate(sink.clone(), None).unwrap();
    manager.activate(&id).unwrap();
    assert!(wait_for(|| sink.video_len() >= 10));
    manager.shutdown();

    let video = sink.video();
    for pair in video.windows(2) {
        assert!(pair[1].seq > pair[0].seq, "sequence must increase");
        if pair[1].seq == pair[0].seq + 1 {
            let (a, b) = (pixel(&pair[0], 0, 0), pixel(&pair[1], 0, 0));
            assert_eq!(b[0], (a[0] + 1) % 4, "anna has a 4-frame cycle");
        }
    }
    assert!(video.iter().all(|f| pixel(f, 0, 0)[1] == 50));
}

#[test]
fn switch_avatar_changes_the_stream_without_stopping_it() {
    let root = tempfile::tempdir().unwrap();
    let manager = start_manager(root.path(), 1);
    let sink = Arc::new(CollectingSink::default());
    let id = manager.negotiate(sink.clone(), None).unwrap();
    manager.activate(&id).unwrap();
    assert!(wait_for(|| sink.video_len() >= 2));

    manager.switch_avatar(&id, "bob").unwrap();
    assert_eq!(manager.state(&id).unwrap(), SessionState::Active);
    let is_bob = |f: &VideoFrame| pixel(f, 0, 0)[1] == 150;
    assert!(wait_for(|| sink.video().iter().any(is_bob)));
    let before = sink.video_len();
    assert!(wait_for(|| sink.video_len() >= before + 4), "stream keeps flowing");
    manager.shutdown();

    let video = sink.video();
    let first_bob = video.iter().position(is_bob).unwrap();
    assert!(video[first_bob..].iter().all(is_bob), "no old-avatar frame after the swap");
    assert_eq!(manager.session_count(), 0);
}

#[test]
fn rejected_switch_leaves_session_untouched() {
    let root = tempfile::tempdir().unwrap();
    let manager = start_manager(root.path(), 1);
    let sink = Arc::new(CollectingSink::default());
    let id = manager.negotiate(sink.clone(), None).unwrap();
    manager.activate(&id).unwrap();

    assert!(matches!(
        manager.switch_avatar(&id, "carol"),
        Err(RenderError::InvalidAvatarId(_))
    ));
    assert_eq!(manager.state(&id).unwrap(), SessionState::Active);
    assert_eq!(manager.sessions()[0].avatar_id, "anna");
    assert!(wait_for(|| sink.video_len() >= 2));
    manager.shutdown();
}

#[test]
fn avatars_registered_at_runtime_can_be_used() {
    let root = tempfile::tempdir().unwrap();
    let manager = start_manager(root.path(), 1);
    crate::helpers::write_avatar(root.path(), "carol", 3, 220);
    manager.register_avatar("carol", "carol").unwrap();
    assert!(manager.avatar_ids().contains(&"carol".to_owned()));

    let sink = Arc::new(CollectingSink::default());
    let id = manager.negotiate(sink.clone(), Some("carol")).unwrap();
    manager.activate(&id).unwrap();
    assert!(wait_for(|| sink.video().iter().any(|f| pixel(f, 0, 0)[1] == 220)));
    manager.shutdown();
}

#[test]
fn catalog_edits_on_disk_are_picked_up_on_reload() {
    let root = tempfile::tempdir().unwrap();
    let (config, _) = crate::helpers::test_config(root.path(), 1);
    let catalog_path = root.path().join("avatar_map.json");
    std::fs::write(&catalog_path, r#"{"anna":"anna"}"#).unwrap();
    let manager = SessionManager::new(config).unwrap().start().unwrap();
    assert_eq!(manager.avatar_ids(), vec!["anna".to_owned()]);

    crate::helpers::write_avatar(root.path(), "dora", 2, 90);
    std::fs::write(&catalog_path, r#"{"anna":"anna","dora":"dora"}"#).unwrap();
    manager.reload_catalog().unwrap();
    assert_eq!(manager.avatar_ids(), vec!["anna".to_owned(), "dora".to_owned()]);

    std::fs::write(&catalog_path, "{ broken").unwrap();
    assert!(matches!(manager.reload_catalog(), Err(RenderError::Config(_))));
    assert_eq!(manager.avatar_ids().len(), 2, "a bad file keeps the old entries");

    let sink = Arc::new(CollectingSink::default());
    let id = manager.negotiate(sink.clone(), Some("dora")).unwrap();
    manager.activate(&id).unwrap();
    assert!(wait_for(|| sink.video().iter().any(|f| pixel(f, 0, 0)[1] == 90)));
    manager.shutdown();
}
