//! Server error types.
//!
//! Only startup and loop-level failures surface as `ServerError`;
//! per-connection problems are logged and end that connection alone.

use std::fmt;
use std::io;

use ember_core::PoolError;

#[derive(Debug)]
pub enum ServerError {
    /// bind() on the configured address failed
    Bind { port: u16, source: io::Error },
    /// listen() failed
    Listen(io::Error),
    /// setsockopt() failed
    SocketOption { option: &'static str, source: io::Error },
    /// epoll create/ctl/wait failed outside any single connection
    Reactor(io::Error),
    /// eventfd creation or registration failed
    Notifier(io::Error),
    /// Worker pool could not be started
    Pool(PoolError),
    /// Invalid configuration or command-line argument
    Config(String),
    /// `run()` called on a server that already stopped
    Stopped,
    /// Other I/O error
    Io(io::Error),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bind { port, source } => write!(f, "bind port {}: {}", port, source),
            Self::Listen(e) => write!(f, "listen: {}", e),
            Self::SocketOption { option, source } => write!(f, "setsockopt {}: {}", option, source),
            Self::Reactor(e) => write!(f, "reactor: {}", e),
            Self::Notifier(e) => write!(f, "notifier: {}", e),
            Self::Pool(e) => write!(f, "worker pool: {}", e),
            Self::Config(msg) => write!(f, "config: {}", msg),
            Self::Stopped => write!(f, "server already stopped"),
            Self::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Bind { source, .. } | Self::SocketOption { source, .. } => Some(source),
            Self::Listen(e) | Self::Reactor(e) | Self::Notifier(e) | Self::Io(e) => Some(e),
            Self::Pool(e) => Some(e),
            Self::Config(_) | Self::Stopped => None,
        }
    }
}

impl From<PoolError> for ServerError {
    fn from(e: PoolError) -> Self {
        Self::Pool(e)
    }
}

impl From<io::Error> for ServerError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

pub type ServerResult<T> = std::result::Result<T, ServerError>;
