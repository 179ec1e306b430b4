//! Error types for the shared building blocks

use std::fmt;
use std::io;

/// Result type for worker pool operations
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors from submitting to or starting a worker pool
#[derive(Debug)]
pub enum PoolError {
    /// `shutdown()` has been called; the task was not queued
    ShutDown,

    /// Queue is at capacity; the task was not queued
    QueueFull,

    /// A worker thread could not be spawned
    Spawn(io::Error),
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::ShutDown => write!(f, "worker pool is shut down"),
            PoolError::QueueFull => write!(f, "worker pool queue is full"),
            PoolError::Spawn(e) => write!(f, "failed to spawn worker thread: {}", e),
        }
    }
}

impl std::error::Error for PoolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PoolError::Spawn(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for PoolError {
    fn from(e: io::Error) -> Self {
        PoolError::Spawn(e)
    }
}
