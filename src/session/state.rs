//! Session lifecycle states.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a viewer session.
///
/// ```text
/// Idle → Negotiating → Active ⇄ Paused
///             ↓          ↓        ↓
///             └──────→ Closing ←──┘
///                        ↓
///                      Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Slot available, nothing allocated.
    Idle,
    /// Transport handshake in progress; pipeline built but not fed.
    Negotiating,
    /// Render loop running and accepting commands.
    Active,
    /// Interrupted: emission halted, input discarded until resumed.
    Paused,
    /// Teardown requested; threads are being stopped.
    Closing,
    /// Slot released.
    Closed,
}

impl SessionState {
    /// Returns `true` if a transition from `self` to `target` is valid.
    ///
    /// # State machine rules
    ///
    /// - `Idle → Negotiating`
    /// - `Negotiating → Active | Closing`
    /// - `Active → Paused | Closing`
    /// - `Paused → Active | Closing`
    /// - `Closing → Closed`
    pub fn can_transition_to(self, target: Self) -> bool {
        matches!(
            (self, target),
            (Self::Idle, Self::Negotiating)
                | (Self::Negotiating, Self::Active)
                | (Self::Negotiating, Self::Closing)
                | (Self::Active, Self::Paused)
                | (Self::Active, Self::Closing)
                | (Self::Paused, Self::Active)
                | (Self::Paused, Self::Closing)
                | (Self::Closing, Self::Closed)
        )
    }

    /// Counts against the session limit.
    pub fn holds_slot(self) -> bool {
        !matches!(self, Self::Closed)
    }

    /// Accepts `SwitchAvatar`.
    pub fn accepts_avatar_switch(self) -> bool {
        matches!(self, Self::Active | Self::Paused)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Negotiating => "negotiating",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
