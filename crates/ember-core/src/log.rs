//! Leveled line logger
//!
//! A `Logger` is a cheap, cloneable handle passed explicitly to whatever
//! needs to log. There is no process-global sink: two servers in one
//! process can log to different places, and tests can hand out
//! `Logger::noop()`.
//!
//! Every line has the shape
//!
//! ```text
//! 2024-05-01 13:45:09.123456 [INFO]  message
//! ```
//!
//! Sinks:
//!
//! - stderr (locked per line)
//! - rolling file, synchronous: the caller writes the line itself
//! - rolling file, asynchronous: lines go through a bounded queue drained
//!   by a writer thread; a full queue drops the line and counts the drop
//!
//! Rolling files are named `application_YYYY_MM_DD.log_NN` and roll over
//! when the local date changes or after `max_lines` lines.
//!
//! # Usage
//!
//! ```ignore
//! use ember_core::{log_info, log_warn, Logger, LogLevel};
//!
//! let logger = Logger::stderr(LogLevel::Debug);
//! log_info!(logger, "listening on port {}", 9000);
//! log_warn!(logger, "client fd({}) rejected", fd);
//! ```

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crossbeam_queue::ArrayQueue;

/// Log levels (matches common conventions)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Off,
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            LogLevel::Off => "",
            LogLevel::Error => "[ERROR]",
            LogLevel::Warn => "[WARN] ",
            LogLevel::Info => "[INFO] ",
            LogLevel::Debug => "[DEBUG]",
            LogLevel::Trace => "[TRACE]",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "0" => Ok(LogLevel::Off),
            "error" | "1" => Ok(LogLevel::Error),
            "warn" | "2" => Ok(LogLevel::Warn),
            "info" | "3" => Ok(LogLevel::Info),
            "debug" | "4" => Ok(LogLevel::Debug),
            "trace" | "5" => Ok(LogLevel::Trace),
            other => Err(format!("unknown log level '{}'", other)),
        }
    }
}

/// How a `Logger` should be built
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Maximum level that is emitted
    pub level: LogLevel,

    /// Directory for rolling files; `None` logs to stderr
    pub dir: Option<PathBuf>,

    /// Hand file lines to a writer thread instead of writing inline
    pub async_write: bool,

    /// Capacity of the async queue (lines)
    pub queue_capacity: usize,

    /// Lines per file before rolling to the next index (0 = unlimited)
    pub max_lines: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            dir: None,
            async_write: true,
            queue_capacity: 1024,
            max_lines: 50_000,
        }
    }
}

/// Destination for formatted lines
///
/// Lines arrive fully formatted and newline-terminated.
pub trait LogSink: Send + Sync {
    fn write_line(&self, line: String);

    fn flush(&self) {}

    /// Lines lost because the sink could not keep up
    fn dropped(&self) -> u64 {
        0
    }
}

struct LoggerInner {
    level: AtomicU8,
    sink: Box<dyn LogSink>,
}

/// Cloneable logging handle
///
/// All clones share level and sink. A noop handle never formats anything.
#[derive(Clone)]
pub struct Logger {
    inner: Option<Arc<LoggerInner>>,
}

impl Logger {
    /// Handle that discards everything
    pub fn noop() -> Self {
        Self { inner: None }
    }

    /// Log to stderr
    pub fn stderr(level: LogLevel) -> Self {
        Self::with_sink(level, StderrSink)
    }

    /// Log to a caller-provided sink
    pub fn with_sink(level: LogLevel, sink: impl LogSink + 'static) -> Self {
        Self {
            inner: Some(Arc::new(LoggerInner {
                level: AtomicU8::new(level as u8),
                sink: Box::new(sink),
            })),
        }
    }

    /// Build from configuration, creating the log directory if needed
    pub fn from_config(config: &LogConfig) -> io::Result<Self> {
        let Some(dir) = &config.dir else {
            return Ok(Self::stderr(config.level));
        };
        let file = RollingFile::open(dir, config.max_lines)?;
        if config.async_write {
            let sink = AsyncFileSink::spawn(file, config.queue_capacity)?;
            Ok(Self::with_sink(config.level, sink))
        } else {
            Ok(Self::with_sink(config.level, SyncFileSink(Mutex::new(file))))
        }
    }

    pub fn level(&self) -> LogLevel {
        match &self.inner {
            Some(inner) => LogLevel::from_u8(inner.level.load(Ordering::Relaxed)),
            None => LogLevel::Off,
        }
    }

    /// Change the level for every clone of this handle
    pub fn set_level(&self, level: LogLevel) {
        if let Some(inner) = &self.inner {
            inner.level.store(level as u8, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn enabled(&self, level: LogLevel) -> bool {
        match &self.inner {
            Some(inner) => {
                level != LogLevel::Off && level as u8 <= inner.level.load(Ordering::Relaxed)
            }
            None => false,
        }
    }

    /// Format and emit one line. Prefer the `log_*!` macros.
    pub fn log(&self, level: LogLevel, args: fmt::Arguments<'_>) {
        if !self.enabled(level) {
            return;
        }
        if let Some(inner) = &self.inner {
            inner.sink.write_line(format_line(level, args));
        }
    }

    pub fn flush(&self) {
        if let Some(inner) = &self.inner {
            inner.sink.flush();
        }
    }

    /// Lines the sink had to drop (async queue overflow)
    pub fn dropped(&self) -> u64 {
        self.inner.as_ref().map_or(0, |inner| inner.sink.dropped())
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::noop()
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger").field("level", &self.level()).finish()
    }
}

#[doc(hidden)]
#[macro_export]
macro_rules! __ember_log {
    ($log:expr, $level:expr, $($arg:tt)*) => {{
        let logger: &$crate::log::Logger = &$log;
        if logger.enabled($level) {
            logger.log($level, format_args!($($arg)*));
        }
    }};
}

/// Log at error level: `log_error!(logger, "fmt", args..)`
#[macro_export]
macro_rules! log_error {
    ($log:expr, $($arg:tt)*) => {
        $crate::__ember_log!($log, $crate::log::LogLevel::Error, $($arg)*)
    };
}

/// Log at warn level
#[macro_export]
macro_rules! log_warn {
    ($log:expr, $($arg:tt)*) => {
        $crate::__ember_log!($log, $crate::log::LogLevel::Warn, $($arg)*)
    };
}

/// Log at info level
#[macro_export]
macro_rules! log_info {
    ($log:expr, $($arg:tt)*) => {
        $crate::__ember_log!($log, $crate::log::LogLevel::Info, $($arg)*)
    };
}

/// Log at debug level
#[macro_export]
macro_rules! log_debug {
    ($log:expr, $($arg:tt)*) => {
        $crate::__ember_log!($log, $crate::log::LogLevel::Debug, $($arg)*)
    };
}

/// Log at trace level
#[macro_export]
macro_rules! log_trace {
    ($log:expr, $($arg:tt)*) => {
        $crate::__ember_log!($log, $crate::log::LogLevel::Trace, $($arg)*)
    };
}

// ============================================================================
// Formatting
// ============================================================================

/// Broken-down local time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LocalTime {
    year: i32,
    month: i32,
    day: i32,
    hour: i32,
    minute: i32,
    second: i32,
    micros: u32,
}

impl LocalTime {
    fn now() -> Self {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let secs = since_epoch.as_secs() as libc::time_t;
        // SAFETY: tm is plain data; localtime_r only writes into it.
        let mut tm: libc::tm = unsafe { std::mem::zeroed() };
        unsafe {
            libc::localtime_r(&secs, &mut tm);
        }
        Self {
            year: tm.tm_year + 1900,
            month: tm.tm_mon + 1,
            day: tm.tm_mday,
            hour: tm.tm_hour,
            minute: tm.tm_min,
            second: tm.tm_sec,
            micros: since_epoch.subsec_micros(),
        }
    }

    fn date(&self) -> (i32, i32, i32) {
        (self.year, self.month, self.day)
    }
}

fn format_line(level: LogLevel, args: fmt::Arguments<'_>) -> String {
    let t = LocalTime::now();
    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:06} {} {}\n",
        t.year,
        t.month,
        t.day,
        t.hour,
        t.minute,
        t.second,
        t.micros,
        level.prefix(),
        args
    )
}

// ============================================================================
// Sinks
// ============================================================================

struct StderrSink;

impl LogSink for StderrSink {
    fn write_line(&self, line: String) {
        let stderr = io::stderr();
        let mut handle = stderr.lock();
        let _ = handle.write_all(line.as_bytes());
    }

    fn flush(&self) {
        let _ = io::stderr().lock().flush();
    }
}

fn log_file_name(date: (i32, i32, i32), index: u32) -> String {
    format!(
        "application_{:04}_{:02}_{:02}.log_{:02}",
        date.0, date.1, date.2, index
    )
}

/// Size/date-rolled log file
struct RollingFile {
    dir: PathBuf,
    max_lines: usize,
    date: (i32, i32, i32),
    index: u32,
    lines: usize,
    out: BufWriter<File>,
}

impl RollingFile {
    fn open(dir: &Path, max_lines: usize) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let date = LocalTime::now().date();
        let out = Self::open_file(dir, date, 0)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            max_lines,
            date,
            index: 0,
            lines: 0,
            out,
        })
    }

    fn open_file(dir: &Path, date: (i32, i32, i32), index: u32) -> io::Result<BufWriter<File>> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(log_file_name(date, index)))?;
        Ok(BufWriter::new(file))
    }

    fn write_line(&mut self, line: &str) -> io::Result<()> {
        let today = LocalTime::now().date();
        if today != self.date {
            self.date = today;
            self.index = 0;
            self.roll()?;
        } else if self.max_lines > 0 && self.lines >= self.max_lines {
            self.index += 1;
            self.roll()?;
        }
        self.out.write_all(line.as_bytes())?;
        self.lines += 1;
        Ok(())
    }

    fn roll(&mut self) -> io::Result<()> {
        self.out.flush()?;
        self.out = Self::open_file(&self.dir, self.date, self.index)?;
        self.lines = 0;
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

struct SyncFileSink(Mutex<RollingFile>);

impl LogSink for SyncFileSink {
    fn write_line(&self, line: String) {
        let mut file = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if file.write_line(&line).is_ok() {
            let _ = file.flush();
        }
    }

    fn flush(&self) {
        let _ = self.0.lock().unwrap_or_else(PoisonError::into_inner).flush();
    }
}

struct AsyncShared {
    queue: ArrayQueue<String>,
    stop: AtomicBool,
    flush_requested: AtomicBool,
    dropped: AtomicU64,
}

/// File sink fed through a bounded queue
///
/// Dropping the sink stops the writer after it has drained the queue.
struct AsyncFileSink {
    shared: Arc<AsyncShared>,
    writer: Option<JoinHandle<()>>,
}

impl AsyncFileSink {
    fn spawn(file: RollingFile, capacity: usize) -> io::Result<Self> {
        let shared = Arc::new(AsyncShared {
            queue: ArrayQueue::new(capacity.max(1)),
            stop: AtomicBool::new(false),
            flush_requested: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        });
        let worker_shared = Arc::clone(&shared);
        let writer = thread::Builder::new()
            .name("ember-log".into())
            .spawn(move || Self::writer_loop(file, worker_shared))?;
        Ok(Self {
            shared,
            writer: Some(writer),
        })
    }

    fn writer_loop(mut file: RollingFile, shared: Arc<AsyncShared>) {
        loop {
            let mut wrote = false;
            while let Some(line) = shared.queue.pop() {
                let _ = file.write_line(&line);
                wrote = true;
            }
            if wrote || shared.flush_requested.swap(false, Ordering::AcqRel) {
                let _ = file.flush();
            }
            if shared.stop.load(Ordering::Acquire) && shared.queue.is_empty() {
                break;
            }
            thread::park_timeout(Duration::from_millis(50));
        }
        let _ = file.flush();
    }

    fn wake(&self) {
        if let Some(writer) = &self.writer {
            writer.thread().unpark();
        }
    }
}

impl LogSink for AsyncFileSink {
    fn write_line(&self, line: String) {
        if self.shared.queue.push(line).is_err() {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.wake();
    }

    fn flush(&self) {
        self.shared.flush_requested.store(true, Ordering::Release);
        self.wake();
    }

    fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for AsyncFileSink {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        self.wake();
        if let Some(writer) = self.writer.take() {
            let _ = writer.join();
        }
    }
}
