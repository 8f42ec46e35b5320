//! Admission control and lifecycle transitions through the public API.

use crate::helpers::{CollectingSink, start_manager, wait_for};
use lipcast::RenderError;
use lipcast::session::SessionState;
use lipcast::transport::{NullSink, TransportSink};
use std::sync::Arc;
use std::time::Duration;

fn null() -> Arc<dyn TransportSink> {
    Arc::new(NullSink::default())
}

#[test]
fn admission_refuses_past_capacity_until_a_session_closes() {
    let root = tempfile::tempdir().unwrap();
    let manager = start_manager(root.path(), 2);

    let first = manager.negotiate(null(), None).unwrap();
    let second = manager.negotiate(null(), None).unwrap();
    assert_ne!(first, second);
    match manager.negotiate(null(), None) {
        Err(RenderError::CapacityExceeded { max_sessions }) => assert_eq!(max_sessions, 2),
        other => panic!("expected CapacityExceeded, got {other:?}"),
    }

    manager.activate(&first).unwrap();
    manager.close(&first).unwrap();
    let third = manager.negotiate(null(), None).unwrap();

    let infos = manager.sessions();
    assert_eq!(infos.len(), 2);
    assert_eq!(infos[0].id, second);
    assert_eq!(infos[1].id, third);
    assert!(infos.iter().all(|i| i.state == SessionState::Negotiating));
    assert!(infos[0].created_at <= infos[1].created_at);
    manager.shutdown();
    assert_eq!(manager.session_count(), 0);
}

#[test]
fn nothing_is_emitted_before_activation() {
    let root = tempfile::tempdir().unwrap();
    let manager = start_manager(root.path(), 1);
    let sink = Arc::new(CollectingSink::default());
    let id = manager.negotiate(sink.clone(), None).unwrap();

    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(sink.video_len(), 0);

    manager.activate(&id).unwrap();
    assert!(wait_for(|| sink.video_len() >= 4), "silence should still stream frames");
    manager.shutdown();
}

#[test]
fn interrupt_halts_emission_until_resumed() {
    let root = tempfile::tempdir().unwrap();
    let manager = start_manager(root.path(), 1);
    let sink = Arc::new(CollectingSink::default());
    let id = manager.negotiate(sink.clone(), None).unwrap();
    manager.activate(&id).unwrap();
    assert!(wait_for(|| sink.video_len() > 0));

    manager.interrupt(&id).unwrap();
    assert_eq!(manager.state(&id).unwrap(), SessionState::Paused);
    std::thread::sleep(Duration::from_millis(100));
    let frozen = sink.video_len();
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(sink.video_len(), frozen);

    manager.resume(&id).unwrap();
    assert!(wait_for(|| sink.video_len() > frozen));
    manager.shutdown();
}

#[test]
fn invalid_transitions_are_rejected() {
    let root = tempfile::tempdir().unwrap();
    let manager = start_manager(root.path(), 1);
    let id = manager.negotiate(null(), None).unwrap();

    assert!(matches!(manager.speak(&id, "too early"), Err(RenderError::InvalidTransition { .. })));
    assert!(matches!(manager.interrupt(&id), Err(RenderError::InvalidTransition { .. })));
    manager.activate(&id).unwrap();
    assert!(matches!(manager.activate(&id), Err(RenderError::InvalidTransition { .. })));
    assert!(matches!(manager.resume(&id), Err(RenderError::InvalidTransition { .. })));

    manager.close(&id).unwrap();
    assert!(matches!(manager.close(&id), Err(RenderError::SessionNotFound(_))));
    manager.shutdown();
}
