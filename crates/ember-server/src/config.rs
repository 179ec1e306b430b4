//! Server configuration
//!
//! Provides library defaults with runtime overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Command-line flags (`apply_args`)
//! 2. Environment variables (`from_env`)
//! 3. Library defaults
//!
//! # Example
//!
//! ```rust,ignore
//! use ember_server::config::{ServerConfig, TriggerMode};
//!
//! let config = ServerConfig::from_env()
//!     .port(8080)
//!     .trigger_mode(TriggerMode::EdgeEdge)
//!     .idle_timeout_ms(5_000);
//! ```

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use ember_core::env::{env_get, env_get_bool, env_get_opt};
use ember_core::log::{LogConfig, LogLevel};

use crate::error::{ServerError, ServerResult};
use crate::reactor::Interest;

/// Library defaults
pub mod defaults {
    pub const PORT: u16 = 9000;
    pub const IDLE_TIMEOUT_MS: u64 = 30_000;
    pub const LINGER: bool = true;
    pub const REUSE_ADDR: bool = true;
    pub const QUEUE_CAPACITY: usize = 10_000;
    pub const MAX_CONNECTIONS: usize = 65_536;
    pub const MAX_EVENTS: usize = 1024;
    pub const READ_BUFFER_INITIAL: usize = 2048;
    pub const READ_BUFFER_LIMIT: usize = 64 * 1024;
    pub const DOC_ROOT: &str = "./resource";
}

/// Readiness reporting for the listening socket and for connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TriggerMode {
    /// Listener LT, connections LT
    #[default]
    LevelLevel,
    /// Listener ET, connections ET
    EdgeEdge,
    /// Listener LT, connections ET
    LevelEdge,
    /// Listener ET, connections LT
    EdgeLevel,
}

impl TriggerMode {
    pub fn from_index(n: u8) -> Option<Self> {
        match n {
            0 => Some(Self::LevelLevel),
            1 => Some(Self::EdgeEdge),
            2 => Some(Self::LevelEdge),
            3 => Some(Self::EdgeLevel),
            _ => None,
        }
    }

    pub fn listen_edge(&self) -> bool {
        matches!(self, Self::EdgeEdge | Self::EdgeLevel)
    }

    pub fn conn_edge(&self) -> bool {
        matches!(self, Self::EdgeEdge | Self::LevelEdge)
    }

    /// Interest for the listening socket: readable plus peer hangup
    pub fn listen_interest(&self) -> Interest {
        let base = Interest::READABLE | Interest::PEER_HANGUP;
        if self.listen_edge() {
            base | Interest::EDGE
        } else {
            base
        }
    }

    /// Base interest for connections (one-shot plus peer hangup);
    /// the caller adds READABLE or WRITABLE.
    pub fn conn_interest(&self) -> Interest {
        let base = Interest::ONESHOT | Interest::PEER_HANGUP;
        if self.conn_edge() {
            base | Interest::EDGE
        } else {
            base
        }
    }
}

impl FromStr for TriggerMode {
    type Err = String;

    /// Accepts `0`..`3` or `lt`, `et`, `lt-et`, `et-lt` (listener-conn)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        if let Ok(n) = s.parse::<u8>() {
            return Self::from_index(n)
                .ok_or_else(|| format!("trigger mode {} out of range 0..=3", n));
        }
        match s.as_str() {
            "lt" | "lt-lt" => Ok(Self::LevelLevel),
            "et" | "et-et" => Ok(Self::EdgeEdge),
            "lt-et" => Ok(Self::LevelEdge),
            "et-lt" => Ok(Self::EdgeLevel),
            other => Err(format!("unknown trigger mode '{}'", other)),
        }
    }
}

/// Server configuration with builder pattern.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind
    pub host: Ipv4Addr,
    /// TCP port (0 = ephemeral)
    pub port: u16,
    /// LT/ET selection for listener and connections
    pub trigger_mode: TriggerMode,
    /// Idle connection timeout in milliseconds (0 disables eviction)
    pub idle_timeout_ms: u64,
    /// SO_LINGER {on, 1s} on the listening socket
    pub linger: bool,
    /// SO_REUSEADDR on the listening socket
    pub reuse_addr: bool,
    /// Worker threads
    pub num_workers: usize,
    /// Max queued tasks before submissions are rejected
    pub queue_capacity: usize,
    /// Open connections beyond which accepts are refused
    pub max_connections: usize,
    /// Events fetched per epoll_wait
    pub max_events: usize,
    /// Initial per-connection read buffer size
    pub read_buffer_initial: usize,
    /// Hard cap on buffered request bytes
    pub read_buffer_limit: usize,
    /// Directory that request paths resolve under
    pub doc_root: PathBuf,
    /// Logger settings
    pub log: LogConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .clamp(1, ember_core::MAX_WORKERS)
}

impl ServerConfig {
    /// Library defaults, no environment lookup
    pub fn new() -> Self {
        Self {
            host: Ipv4Addr::UNSPECIFIED,
            port: defaults::PORT,
            trigger_mode: TriggerMode::default(),
            idle_timeout_ms: defaults::IDLE_TIMEOUT_MS,
            linger: defaults::LINGER,
            reuse_addr: defaults::REUSE_ADDR,
            num_workers: default_workers(),
            queue_capacity: defaults::QUEUE_CAPACITY,
            max_connections: defaults::MAX_CONNECTIONS,
            max_events: defaults::MAX_EVENTS,
            read_buffer_initial: defaults::READ_BUFFER_INITIAL,
            read_buffer_limit: defaults::READ_BUFFER_LIMIT,
            doc_root: PathBuf::from(defaults::DOC_ROOT),
            log: LogConfig::default(),
        }
    }

    /// Defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `EMBER_HOST` - IPv4 address to bind
    /// - `EMBER_PORT` - TCP port
    /// - `EMBER_TRIGGER_MODE` - 0..3 or lt / et / lt-et / et-lt
    /// - `EMBER_IDLE_TIMEOUT_MS` - Idle timeout (0 disables)
    /// - `EMBER_LINGER` - SO_LINGER on/off
    /// - `EMBER_REUSE_ADDR` - SO_REUSEADDR on/off
    /// - `EMBER_WORKERS` - Worker threads
    /// - `EMBER_QUEUE_CAPACITY` - Pool queue bound
    /// - `EMBER_MAX_CONNECTIONS` - Connection limit
    /// - `EMBER_MAX_EVENTS` - Events per wait
    /// - `EMBER_READ_BUFFER_LIMIT` - Max buffered request bytes
    /// - `EMBER_DOC_ROOT` - Document root
    /// - `EMBER_LOG_LEVEL` - off / error / warn / info / debug / trace
    /// - `EMBER_LOG_DIR` - Rolling log directory (unset logs to stderr)
    /// - `EMBER_LOG_ASYNC` - Async file writes on/off
    pub fn from_env() -> Self {
        let base = Self::new();
        Self {
            host: env_get("EMBER_HOST", base.host),
            port: env_get("EMBER_PORT", base.port),
            trigger_mode: env_get("EMBER_TRIGGER_MODE", base.trigger_mode),
            idle_timeout_ms: env_get("EMBER_IDLE_TIMEOUT_MS", base.idle_timeout_ms),
            linger: env_get_bool("EMBER_LINGER", base.linger),
            reuse_addr: env_get_bool("EMBER_REUSE_ADDR", base.reuse_addr),
            num_workers: env_get("EMBER_WORKERS", base.num_workers),
            queue_capacity: env_get("EMBER_QUEUE_CAPACITY", base.queue_capacity),
            max_connections: env_get("EMBER_MAX_CONNECTIONS", base.max_connections),
            max_events: env_get("EMBER_MAX_EVENTS", base.max_events),
            read_buffer_initial: base.read_buffer_initial,
            read_buffer_limit: env_get("EMBER_READ_BUFFER_LIMIT", base.read_buffer_limit),
            doc_root: env_get("EMBER_DOC_ROOT", base.doc_root),
            log: LogConfig {
                level: env_get("EMBER_LOG_LEVEL", base.log.level),
                dir: env_get_opt("EMBER_LOG_DIR").or(base.log.dir),
                async_write: env_get_bool("EMBER_LOG_ASYNC", base.log.async_write),
                ..base.log
            },
        }
    }

    /// Apply command-line flags on top of the current values.
    ///
    /// Flags: `--port/-p N`, `--host ADDR`, `--root/-r DIR`,
    /// `--timeout-ms N`, `--workers/-w N`, `--mode/-m MODE`,
    /// `--log-dir DIR`, `--log-level LEVEL`, `--sync-log`, `--no-linger`,
    /// `--no-reuseaddr`, `--max-conns N`.
    pub fn apply_args<S: AsRef<str>>(mut self, args: &[S]) -> ServerResult<Self> {
        let mut i = 0;
        while i < args.len() {
            let flag = args[i].as_ref();
            match flag {
                "--sync-log" => self.log.async_write = false,
                "--no-linger" => self.linger = false,
                "--no-reuseaddr" => self.reuse_addr = false,
                "--port" | "-p" => self.port = parse_value(args, &mut i)?,
                "--host" => self.host = parse_value(args, &mut i)?,
                "--root" | "-r" => self.doc_root = parse_value(args, &mut i)?,
                "--timeout-ms" => self.idle_timeout_ms = parse_value(args, &mut i)?,
                "--workers" | "-w" => self.num_workers = parse_value(args, &mut i)?,
                "--mode" | "-m" => self.trigger_mode = parse_value(args, &mut i)?,
                "--log-dir" => self.log.dir = Some(parse_value(args, &mut i)?),
                "--log-level" => self.log.level = parse_value::<LogLevel, S>(args, &mut i)?,
                "--max-conns" => self.max_connections = parse_value(args, &mut i)?,
                other => {
                    return Err(ServerError::Config(format!("unknown argument '{}'", other)));
                }
            }
            i += 1;
        }
        Ok(self)
    }

    /// Reject settings the server cannot run with
    pub fn validate(&self) -> ServerResult<()> {
        if self.num_workers == 0 {
            return Err(ServerError::Config("num_workers must be at least 1".into()));
        }
        if self.queue_capacity == 0 {
            return Err(ServerError::Config("queue_capacity must be at least 1".into()));
        }
        if self.max_events == 0 {
            return Err(ServerError::Config("max_events must be at least 1".into()));
        }
        if self.max_connections == 0 {
            return Err(ServerError::Config("max_connections must be at least 1".into()));
        }
        if self.read_buffer_initial == 0 || self.read_buffer_limit < self.read_buffer_initial {
            return Err(ServerError::Config(format!(
                "read buffer limit {} smaller than initial size {}",
                self.read_buffer_limit, self.read_buffer_initial
            )));
        }
        Ok(())
    }

    /// Idle timeout, `None` when eviction is disabled
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_ms > 0).then(|| Duration::from_millis(self.idle_timeout_ms))
    }

    // Builder methods

    pub fn host(mut self, host: Ipv4Addr) -> Self {
        self.host = host;
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn trigger_mode(mut self, mode: TriggerMode) -> Self {
        self.trigger_mode = mode;
        self
    }

    pub fn idle_timeout_ms(mut self, ms: u64) -> Self {
        self.idle_timeout_ms = ms;
        self
    }

    pub fn linger(mut self, enable: bool) -> Self {
        self.linger = enable;
        self
    }

    pub fn reuse_addr(mut self, enable: bool) -> Self {
        self.reuse_addr = enable;
        self
    }

    pub fn num_workers(mut self, n: usize) -> Self {
        self.num_workers = n;
        self
    }

    pub fn queue_capacity(mut self, cap: usize) -> Self {
        self.queue_capacity = cap;
        self
    }

    pub fn max_connections(mut self, n: usize) -> Self {
        self.max_connections = n;
        self
    }

    pub fn max_events(mut self, n: usize) -> Self {
        self.max_events = n;
        self
    }

    pub fn read_buffer(mut self, initial: usize, limit: usize) -> Self {
        self.read_buffer_initial = initial;
        self.read_buffer_limit = limit;
        self
    }

    pub fn doc_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.doc_root = root.into();
        self
    }

    pub fn log(mut self, log: LogConfig) -> Self {
        self.log = log;
        self
    }
}

/// Parse the value following flag `args[*i]`, advancing `i` past it
fn parse_value<T, S>(args: &[S], i: &mut usize) -> ServerResult<T>
where
    T: FromStr,
    S: AsRef<str>,
{
    let flag = args[*i].as_ref();
    let Some(raw) = args.get(*i + 1) else {
        return Err(ServerError::Config(format!("{} requires a value", flag)));
    };
    *i += 1;
    raw.as_ref()
        .parse()
        .map_err(|_| ServerError::Config(format!("invalid value '{}' for {}", raw.as_ref(), flag)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::new();
        assert_eq!(config.port, 9000);
        assert_eq!(config.idle_timeout_ms, 30_000);
        assert_eq!(config.trigger_mode, TriggerMode::LevelLevel);
        assert!(config.linger && config.reuse_addr);
        assert!((1..=ember_core::MAX_WORKERS).contains(&config.num_workers));
        assert_eq!(config.doc_root, PathBuf::from("./resource"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_env_overrides() {
        std::env::set_var("EMBER_PORT", "8123");
        std::env::set_var("EMBER_TRIGGER_MODE", "et");
        std::env::set_var("EMBER_LINGER", "off");
        let config = ServerConfig::from_env();
        std::env::remove_var("EMBER_PORT");
        std::env::remove_var("EMBER_TRIGGER_MODE");
        std::env::remove_var("EMBER_LINGER");

        assert_eq!(config.port, 8123);
        assert_eq!(config.trigger_mode, TriggerMode::EdgeEdge);
        assert!(!config.linger);
    }

    #[test]
    fn test_apply_args() {
        let args = [
            "-p", "7000", "--mode", "2", "--timeout-ms", "0", "-w", "3", "--root", "/srv/www",
            "--log-level", "debug", "--sync-log", "--no-reuseaddr", "--max-conns", "10",
        ];
        let config = ServerConfig::new().apply_args(&args).unwrap();
        assert_eq!(config.port, 7000);
        assert_eq!(config.trigger_mode, TriggerMode::LevelEdge);
        assert_eq!(config.idle_timeout(), None);
        assert_eq!(config.num_workers, 3);
        assert_eq!(config.doc_root, PathBuf::from("/srv/www"));
        assert_eq!(config.log.level, LogLevel::Debug);
        assert!(!config.log.async_write);
        assert!(!config.reuse_addr);
        assert_eq!(config.max_connections, 10);
    }

    #[test]
    fn test_apply_args_errors() {
        assert!(matches!(
            ServerConfig::new().apply_args(&["--port"]),
            Err(ServerError::Config(_))
        ));
        assert!(matches!(
            ServerConfig::new().apply_args(&["--port", "http"]),
            Err(ServerError::Config(_))
        ));
        assert!(matches!(
            ServerConfig::new().apply_args(&["--frobnicate"]),
            Err(ServerError::Config(_))
        ));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(ServerConfig::new().num_workers(0).validate().is_err());
        assert!(ServerConfig::new().queue_capacity(0).validate().is_err());
        assert!(ServerConfig::new().max_events(0).validate().is_err());
        assert!(ServerConfig::new().read_buffer(4096, 1024).validate().is_err());
    }

    #[test]
    fn test_trigger_mode_interest() {
        let lt = TriggerMode::LevelLevel;
        assert_eq!(lt.listen_interest(), Interest::READABLE | Interest::PEER_HANGUP);
        assert!(!lt.conn_interest().contains(Interest::EDGE));
        assert!(lt.conn_interest().contains(Interest::ONESHOT));

        let mixed: TriggerMode = "et-lt".parse().unwrap();
        assert!(mixed.listen_interest().contains(Interest::EDGE));
        assert!(!mixed.conn_interest().contains(Interest::EDGE));

        assert!("4".parse::<TriggerMode>().is_err());
        assert!("sideways".parse::<TriggerMode>().is_err());
    }
}
