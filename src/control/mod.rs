//! Control plane: session-keyed command/audio queues and the JSON command
//! reader that feeds them.

pub mod bus;
pub mod stdio;

pub use bus::ControlBus;
pub use stdio::{CommandEnvelope, ResponseEnvelope, run_command_reader};
