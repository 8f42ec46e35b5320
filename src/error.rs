//! Error types for the lipcast render pipeline.

/// Top-level error type for the avatar render pipeline.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    /// Avatar assets missing, empty or malformed.
    #[error("asset load error: {0}")]
    AssetLoad(String),

    /// Lip-sync model call failed or timed out.
    #[error("inference error: {0}")]
    Inference(String),

    /// Session admission refused because every slot is in use.
    #[error("capacity exceeded: {max_sessions} sessions already open")]
    CapacityExceeded {
        /// Configured session bound.
        max_sessions: usize,
    },

    /// Avatar id not present in the avatar catalog.
    #[error("invalid avatar id: {0}")]
    InvalidAvatarId(String),

    /// Outbound transport sink rejected or could not accept a frame.
    #[error("transport error: {0}")]
    Transport(String),

    /// No session with the given id.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Requested lifecycle transition is not allowed from the current state.
    #[error("invalid session transition: {from} -> {to}")]
    InvalidTransition {
        /// State the session was in.
        from: String,
        /// State that was requested.
        to: String,
    },

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Inference worker context failure (spawn, crash, protocol).
    #[error("worker error: {0}")]
    Worker(String),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, RenderError>;
