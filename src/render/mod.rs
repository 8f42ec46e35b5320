//! Render loop and frame emission.

pub mod emitter;
pub mod scheduler;

pub use emitter::{EmitOutcome, FrameEmitter, Sleeper, ThreadSleeper};
pub use scheduler::{RenderScheduler, SchedulerIo, StepOutcome};
