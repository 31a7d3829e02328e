//! Supervisor error types.

/// Errors that can occur while supervising a child process.
#[derive(thiserror::Error, Debug)]
pub enum SupervisorError {
    /// The operation requires a started instance.
    #[error("Process has not been started")]
    NotStarted,

    /// `start` was called more than once.
    #[error("Process was already started")]
    AlreadyStarted,

    /// The operation was invoked on a torn-down instance.
    #[error("Supervisor has been disposed")]
    Disposed,

    /// A read deadline elapsed without a matching line or end of stream.
    #[error("Timed out waiting for an output line")]
    LineWaitingTimeout,

    /// The control thread failed to create the child process.
    #[error("Failed to spawn child process: {0}")]
    SpawnFailed(String),

    /// I/O error while waiting on the child.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
