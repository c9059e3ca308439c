//! Error types for the silk runtime

use core::fmt;

/// Result type for runtime operations
pub type SilkResult<T> = Result<T, SilkError>;

/// Errors that can occur in runtime operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SilkError {
    /// An I/O operation exceeded its configured timeout
    Timeout,

    /// Registering interest with the readiness multiplexer failed
    RegistrationFailed(i32),

    /// Failed to spawn an OS thread
    SpawnFailed,

    /// Descriptor is not tracked or already closed
    BadDescriptor,

    /// Scheduler already started
    AlreadyStarted,

    /// Operation requires a running scheduler on this thread
    NoScheduler,

    /// Platform call failed with the given errno
    SystemError(i32),
}

impl fmt::Display for SilkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SilkError::Timeout => write!(f, "operation timed out"),
            SilkError::RegistrationFailed(e) => {
                write!(f, "event registration failed (errno {})", e)
            }
            SilkError::SpawnFailed => write!(f, "failed to spawn thread"),
            SilkError::BadDescriptor => write!(f, "bad or closed descriptor"),
            SilkError::AlreadyStarted => write!(f, "scheduler already started"),
            SilkError::NoScheduler => write!(f, "no scheduler on this thread"),
            SilkError::SystemError(e) => write!(f, "system error (errno {})", e),
        }
    }
}

impl std::error::Error for SilkError {}
