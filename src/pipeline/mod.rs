//! Types and signals shared by every stage of the render pipeline.

pub mod messages;

use crossbeam_channel::{SendTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How long a blocked send waits before re-checking cancellation.
const SEND_POLL: Duration = Duration::from_millis(50);

/// Soft-cancellation state one session's stages share.
///
/// `epoch` increments on every interrupt; work stamped with an older epoch is
/// stale and gets discarded downstream. While `paused` is set, the render loop
/// discards input and the emitter sends nothing.
#[derive(Debug, Default)]
pub struct SessionSignals {
    paused: AtomicBool,
    epoch: AtomicU64,
}

impl SessionSignals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Start a new epoch, invalidating all in-flight work. Returns the new epoch.
    pub fn bump_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn is_current(&self, epoch: u64) -> bool {
        self.epoch() == epoch
    }
}

/// Blocking send that gives up on cancellation or disconnect.
pub(crate) fn send_until<T>(tx: &Sender<T>, item: T, cancel: &CancellationToken) -> bool {
    let mut item = item;
    loop {
        match tx.send_timeout(item, SEND_POLL) {
            Ok(()) => return true,
            Err(SendTimeoutError::Timeout(back)) => {
                if cancel.is_cancelled() {
                    return false;
                }
                item = back;
            }
            Err(SendTimeoutError::Disconnected(_)) => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn bump_invalidates_previous_epoch() {
        let signals = SessionSignals::new();
        assert!(signals.is_current(0));
        assert_eq!(signals.bump_epoch(), 1);
        assert!(!signals.is_current(0));
        assert!(signals.is_current(1));
    }

    #[test]
    fn send_until_gives_up_when_cancelled() {
        let (tx, _rx) = crossbeam_channel::bounded(1);
        let cancel = CancellationToken::new();
        assert!(send_until(&tx, 1, &cancel));
        cancel.cancel();
        assert!(!send_until(&tx, 2, &cancel));
    }
}
