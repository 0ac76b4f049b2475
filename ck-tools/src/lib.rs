//! Small runtime helpers shared across the clone kernel workspace: the
//! `WorkerTaskContext` logging/abort seam and the cooperative wait
//! primitive every blocking point in the engine is built from.

pub mod task;
pub mod wait;

pub use task::{LoggingContext, WorkerTaskContext};
pub use wait::{wait, wait_default, WaitOutcome};
