//! # ember-server
//!
//! epoll-driven HTTP/1.1 server: one dispatcher thread owning the
//! listener, reactor, idle timers and connection table, plus a worker
//! pool that parses requests and builds responses.
//!
//! ## Modules
//!
//! - `reactor` - epoll register/modify/deregister/wait
//! - `notifier` - eventfd wakeup and worker completion queue
//! - `listener` - Listening socket with linger/reuse options
//! - `closer` - Drops finished connections off the dispatcher thread
//! - `config` - Defaults, environment and command-line overrides
//! - `server` - Dispatcher loop and shutdown handle
//! - `error` - Error types
//!
//! ## Example
//!
//! ```rust,ignore
//! use ember_core::Logger;
//! use ember_server::{Server, ServerConfig};
//!
//! let mut server = Server::bind(ServerConfig::from_env(), Logger::stderr(Default::default()))?;
//! let stop = server.shutdown_handle();
//! server.run()?;
//! ```

pub mod error;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        pub mod reactor;
        pub mod notifier;
        pub mod listener;
        pub mod closer;
        pub mod config;
        pub mod server;

        pub use config::{ServerConfig, TriggerMode};
        pub use reactor::{Event, Interest, Reactor};
        pub use server::{Server, ServerStats, ShutdownHandle};
    } else {
        compile_error!("ember-server requires Linux (epoll, eventfd)");
    }
}

// Re-exports
pub use error::{ServerError, ServerResult};
