//! JSON commands flowing through the control bus into a session.

use crate::helpers::{start_manager, wait_for};
use lipcast::control::{ControlBus, run_command_reader};
use lipcast::session::SessionState;
use lipcast::transport::NullSink;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread")]
async fn stdin_style_commands_drive_the_session() {
    let root = tempfile::tempdir().unwrap();
    let manager = start_manager(root.path(), 1);
    let id = manager.negotiate(Arc::new(NullSink::default()), None).unwrap();
    manager.activate(&id).unwrap();

    let bus = ControlBus::new(320, Duration::from_millis(10));
    bus.attach(&manager, id.clone()).unwrap();

    let input = concat!(
        "{\"command\":\"speak\",\"text\":\"hi\"}\n",
        "{\"command\":\"switch_avatar\",\"avatar_id\":\"bob\"}\n",
        "{\"command\":\"interrupt\"}\n",
    );
    let mut out = Vec::new();
    run_command_reader(input.as_bytes(), &mut out, &bus, &id)
        .await
        .unwrap();
    let replies: Vec<serde_json::Value> = std::str::from_utf8(&out)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(replies.len(), 3);
    assert!(replies.iter().all(|r| r["ok"] == true));

    let m = Arc::clone(&manager);
    let check = id.clone();
    let paused = tokio::task::spawn_blocking(move || {
        wait_for(|| {
            m.state(&check).ok() == Some(SessionState::Paused)
                && m.sessions().first().map(|s| s.avatar_id.as_str()) == Some("bob")
        })
    })
    .await
    .unwrap();
    assert!(paused);

    let mut out = Vec::new();
    run_command_reader(b"{\"command\":\"shutdown\"}\n".as_slice(), &mut out, &bus, &id)
        .await
        .unwrap();
    let m = Arc::clone(&manager);
    let closed = tokio::task::spawn_blocking(move || wait_for(|| m.session_count() == 0))
        .await
        .unwrap();
    assert!(closed);

    bus.close();
    manager.shutdown();
}
