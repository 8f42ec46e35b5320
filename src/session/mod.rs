//! Viewer sessions: lifecycle state machine, per-session pipeline and the
//! manager that admits and supervises them.

pub mod manager;
pub mod pipeline;
pub mod state;

pub use manager::{SessionInfo, SessionManager};
pub use pipeline::{PipelineDeps, SessionPipeline};
pub use state::SessionState;
