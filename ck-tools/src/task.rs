use anyhow::Error;

/// Methods a long-running clone worker needs from whatever embeds it
/// (a server-side task tracker, a test harness, ...), kept separate from
/// the worker's actual body so the engine never depends on a concrete
/// task-tracking implementation.
pub trait WorkerTaskContext {
    /// If the task should be aborted, this should fail with a reasonable
    /// error message. Called between every block and at every wait point.
    fn check_abort(&self) -> Result<(), Error>;

    /// Create a log message for this task.
    fn log(&self, level: log::Level, message: &std::fmt::Arguments);
}

/// Convenience implementation so callers can pass around `Arc<dyn
/// WorkerTaskContext>` without re-deriving the trait.
impl<T: WorkerTaskContext + ?Sized> WorkerTaskContext for std::sync::Arc<T> {
    fn check_abort(&self) -> Result<(), Error> {
        <T as WorkerTaskContext>::check_abort(&**self)
    }

    fn log(&self, level: log::Level, message: &std::fmt::Arguments) {
        <T as WorkerTaskContext>::log(&**self, level, message)
    }
}

#[macro_export]
macro_rules! task_error {
    ($task:expr, $($fmt:tt)+) => {{
        $crate::task::WorkerTaskContext::log(&*$task, log::Level::Error, &format_args!($($fmt)+))
    }};
}

#[macro_export]
macro_rules! task_warn {
    ($task:expr, $($fmt:tt)+) => {{
        $crate::task::WorkerTaskContext::log(&*$task, log::Level::Warn, &format_args!($($fmt)+))
    }};
}

#[macro_export]
macro_rules! task_log {
    ($task:expr, $($fmt:tt)+) => {{
        $crate::task::WorkerTaskContext::log(&*$task, log::Level::Info, &format_args!($($fmt)+))
    }};
}

#[macro_export]
macro_rules! task_debug {
    ($task:expr, $($fmt:tt)+) => {{
        $crate::task::WorkerTaskContext::log(&*$task, log::Level::Debug, &format_args!($($fmt)+))
    }};
}

/// A `WorkerTaskContext` that never aborts and logs through the `log`
/// facade. Used by background threads (GTID persister, undo truncator)
/// that are not driven by a per-session task but still want uniform
/// logging.
pub struct LoggingContext;

impl WorkerTaskContext for LoggingContext {
    fn check_abort(&self) -> Result<(), Error> {
        Ok(())
    }

    fn log(&self, level: log::Level, message: &std::fmt::Arguments) {
        log::log!(level, "{}", message);
    }
}
