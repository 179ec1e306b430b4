//! # ember-core
//!
//! Platform-light building blocks shared by the ember HTTP server.
//!
//! ## Modules
//!
//! - `log` - Leveled logger handle with stderr and rolling-file sinks
//! - `env` - Environment variable utilities
//! - `timer` - Indexed min-heap of keyed deadlines
//! - `pool` - Fixed-size worker pool behind the `WorkerPool` trait
//! - `error` - Error types

pub mod log;
pub mod env;
pub mod timer;
pub mod pool;
pub mod error;

// Re-exports for convenience
pub use log::{LogConfig, LogLevel, LogSink, Logger};
pub use env::{env_get, env_get_bool, env_get_opt, env_is_set};
pub use timer::{TimeoutCallback, TimerHeap};
pub use pool::{Task, ThreadPool, WorkerPool};
pub use error::{PoolError, PoolResult};

/// Upper bound on worker threads per pool
pub const MAX_WORKERS: usize = 64;
