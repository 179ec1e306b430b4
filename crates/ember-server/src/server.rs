//! Dispatcher loop.
//!
//! One thread owns the listener, the reactor, the timer heap and the
//! connection table. Each iteration sweeps expired timers, waits for
//! readiness, then routes every event:
//!
//! ```text
//!   listener readable   -> accept (once for LT, until EAGAIN for ET)
//!   eventfd readable    -> apply worker completions (re-arm / close)
//!   conn hangup/error   -> close
//!   conn readable       -> read_drain, submit process() to the pool
//!   conn writable       -> write_drain on this thread
//! ```
//!
//! Connections are one-shot: a connection produces no further events
//! until the dispatcher re-arms it, so a session is never read by the
//! dispatcher while a worker is processing it.
//!
//! With `SO_LINGER` enabled, only a connection whose response was fully
//! written closes gracefully, and its last reference is dropped on the
//! closer thread. Every other close resets the peer.

use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_queue::SegQueue;
use ember_core::{
    log_debug, log_error, log_info, log_trace, log_warn, Logger, Task, ThreadPool, TimerHeap,
    WorkerPool,
};
use ember_http::{
    CredentialStore, MemoryStore, NextStep, ProcessContext, ReadOutcome, Session, WriteOutcome,
};

use crate::closer::Closer;
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::listener::{bind_listener, set_abortive_close, set_nodelay};
use crate::notifier::{Completion, Completions};
use crate::reactor::{Event, Interest, Reactor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerState {
    Running,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseMode {
    /// Response fully written; let the kernel deliver the tail
    Graceful,
    /// Discard unsent data and reset the peer
    Abort,
}

/// Counters logged when the server stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub accepted: u64,
    pub rejected: u64,
    pub closed: u64,
    pub evicted: u64,
    pub requests: u64,
    pub bytes_out: u64,
}

/// Stops a running server from any thread, including a signal handler.
///
/// `trigger` only stores an atomic and writes to an eventfd.
#[derive(Clone)]
pub struct ShutdownHandle {
    running: Arc<AtomicBool>,
    completions: Arc<Completions>,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        self.running.store(false, Ordering::Release);
        self.completions.wake();
    }

    pub fn is_triggered(&self) -> bool {
        !self.running.load(Ordering::Acquire)
    }
}

/// Delivers `Close` if a task unwinds before reporting its result
struct CompletionGuard {
    completions: Arc<Completions>,
    fd: RawFd,
    serial: u64,
    delivered: bool,
}

impl CompletionGuard {
    fn deliver(mut self, next: NextStep) {
        self.delivered = true;
        self.completions.push(Completion {
            fd: self.fd,
            serial: self.serial,
            next,
        });
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if !self.delivered {
            self.completions.push(Completion {
                fd: self.fd,
                serial: self.serial,
                next: NextStep::Close,
            });
        }
    }
}

pub struct Server {
    config: ServerConfig,
    logger: Logger,
    listener: Option<TcpListener>,
    listener_fd: RawFd,
    local_addr: SocketAddr,
    reactor: Reactor,
    timers: TimerHeap<RawFd>,
    idle_timeout: Option<Duration>,
    evictions: Arc<SegQueue<(RawFd, u64)>>,
    completions: Arc<Completions>,
    pool: Box<dyn WorkerPool>,
    ctx: Arc<ProcessContext>,
    sessions: HashMap<RawFd, Arc<Session>>,
    closer: Closer<Arc<Session>>,
    running: Arc<AtomicBool>,
    state: ServerState,
    next_serial: u64,
    stats: ServerStats,
}

impl Server {
    /// Bind with the default in-memory credential store
    pub fn bind(config: ServerConfig, logger: Logger) -> ServerResult<Self> {
        Self::bind_with(config, logger, Arc::new(MemoryStore::default()))
    }

    /// Bind the listener, create the reactor and start the worker pool
    pub fn bind_with(
        config: ServerConfig,
        logger: Logger,
        store: Arc<dyn CredentialStore>,
    ) -> ServerResult<Self> {
        config.validate()?;

        let listener = bind_listener(config.host, config.port, config.linger, config.reuse_addr)?;
        let local_addr = listener.local_addr().map_err(ServerError::Listen)?;
        let listener_fd = listener.as_raw_fd();

        let reactor = Reactor::new(config.max_events).map_err(ServerError::Reactor)?;
        reactor
            .register(listener_fd, config.trigger_mode.listen_interest())
            .map_err(ServerError::Reactor)?;

        let completions = Arc::new(Completions::new().map_err(ServerError::Notifier)?);
        reactor
            .register(completions.fd(), Interest::READABLE)
            .map_err(ServerError::Notifier)?;

        let pool = ThreadPool::new(config.num_workers, config.queue_capacity, logger.clone())?;
        let closer = Closer::spawn().map_err(ServerError::Io)?;

        let ctx = Arc::new(ProcessContext {
            doc_root: config.doc_root.clone(),
            store,
            logger: logger.clone(),
        });

        log_info!(
            logger,
            "listening on {} ({:?}, {} workers, idle timeout {} ms)",
            local_addr,
            config.trigger_mode,
            pool.total_workers(),
            config.idle_timeout_ms
        );

        Ok(Self {
            idle_timeout: config.idle_timeout(),
            config,
            logger,
            listener: Some(listener),
            listener_fd,
            local_addr,
            reactor,
            timers: TimerHeap::with_capacity(1024),
            evictions: Arc::new(SegQueue::new()),
            completions,
            pool: Box::new(pool),
            ctx,
            sessions: HashMap::new(),
            closer,
            running: Arc::new(AtomicBool::new(true)),
            state: ServerState::Running,
            next_serial: 1,
            stats: ServerStats::default(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            running: Arc::clone(&self.running),
            completions: Arc::clone(&self.completions),
        }
    }

    pub fn stats(&self) -> ServerStats {
        self.stats
    }

    /// Open connections
    pub fn connections(&self) -> usize {
        self.sessions.len()
    }

    /// Serve until the shutdown handle fires. A stopped server cannot run again.
    pub fn run(&mut self) -> ServerResult<()> {
        if self.state == ServerState::Stopped {
            return Err(ServerError::Stopped);
        }

        let mut events = Vec::with_capacity(self.config.max_events);
        while self.running.load(Ordering::Acquire) {
            let timeout = self.timers.next_deadline();
            self.reap_evictions();

            if let Err(e) = self.reactor.wait(timeout, &mut events) {
                log_error!(self.logger, "epoll_wait failed: {}", e);
                self.stop();
                return Err(ServerError::Reactor(e));
            }

            for &event in &events {
                self.dispatch(event);
            }
        }

        self.stop();
        Ok(())
    }

    fn dispatch(&mut self, event: Event) {
        let fd = event.fd();
        if fd == self.listener_fd {
            self.accept_ready();
            return;
        }
        if fd == self.completions.fd() {
            self.drain_completions();
            return;
        }

        // already closed, e.g. evicted earlier in this batch
        let Some(session) = self.sessions.get(&fd).cloned() else {
            log_trace!(self.logger, "fd({}) event for unknown connection", fd);
            return;
        };

        if event.is_hangup() {
            self.close(session, CloseMode::Abort, "peer hangup");
        } else if event.is_readable() {
            self.on_readable(session);
        } else if event.is_writable() {
            self.on_writable(session);
        }
    }

    fn accept_ready(&mut self) {
        let Some(listener) = self.listener.as_ref() else {
            return;
        };
        let edge = self.config.trigger_mode.listen_edge();
        let mut accepted = Vec::new();
        loop {
            match listener.accept() {
                Ok(conn) => accepted.push(conn),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log_warn!(self.logger, "accept failed: {}", e);
                    break;
                }
            }
            if !edge {
                break;
            }
        }
        for (stream, peer) in accepted {
            self.admit(stream, peer);
        }
    }

    fn admit(&mut self, stream: TcpStream, peer: SocketAddr) {
        if self.sessions.len() >= self.config.max_connections {
            self.stats.rejected += 1;
            log_warn!(
                self.logger,
                "server busy ({} connections), refusing {}",
                self.sessions.len(),
                peer
            );
            return;
        }
        if let Err(e) = set_nodelay(&stream) {
            log_debug!(self.logger, "TCP_NODELAY for {}: {}", peer, e);
        }

        let serial = self.next_serial;
        self.next_serial += 1;
        let session = Arc::new(Session::new(
            stream,
            serial,
            self.config.read_buffer_initial,
            self.config.read_buffer_limit,
        ));
        let fd = session.fd();

        let interest = self.config.trigger_mode.conn_interest() | Interest::READABLE;
        if let Err(e) = self.reactor.register(fd, interest) {
            log_warn!(self.logger, "fd({}) register failed: {}", fd, e);
            return;
        }
        self.arm_timer(fd, serial);
        self.sessions.insert(fd, session);
        self.stats.accepted += 1;
        log_debug!(self.logger, "fd({}) accepted {} (#{})", fd, peer, serial);
    }

    fn on_readable(&mut self, session: Arc<Session>) {
        let fd = session.fd();
        match session.read_drain(self.config.trigger_mode.conn_edge()) {
            ReadOutcome::Drained { received } => {
                log_trace!(self.logger, "fd({}) read {} bytes", fd, received);
                self.refresh_timer(fd);
                self.submit_process(session);
            }
            ReadOutcome::Closed => self.close(session, CloseMode::Abort, "peer closed"),
            ReadOutcome::Failed(e) => {
                log_debug!(self.logger, "fd({}) read error: {}", fd, e);
                self.close(session, CloseMode::Abort, "read error");
            }
        }
    }

    fn on_writable(&mut self, session: Arc<Session>) {
        let fd = session.fd();
        let (outcome, sent) = session.write_drain();
        self.stats.bytes_out += sent as u64;
        match outcome {
            WriteOutcome::WouldBlock => {
                self.refresh_timer(fd);
                self.arm(session, Interest::WRITABLE);
            }
            WriteOutcome::Complete => {
                self.refresh_timer(fd);
                if !session.keep_alive() {
                    self.close(session, CloseMode::Graceful, "response sent");
                } else if session.finish_exchange() {
                    // next request already buffered
                    self.submit_process(session);
                } else {
                    self.arm(session, Interest::READABLE);
                }
            }
            WriteOutcome::Failed(e) => {
                log_debug!(self.logger, "fd({}) write error: {}", fd, e);
                self.close(session, CloseMode::Abort, "write error");
            }
        }
    }

    fn submit_process(&mut self, session: Arc<Session>) {
        let task_session = Arc::clone(&session);
        let ctx = Arc::clone(&self.ctx);
        let completions = Arc::clone(&self.completions);
        let task: Task = Box::new(move || {
            let guard = CompletionGuard {
                completions,
                fd: task_session.fd(),
                serial: task_session.serial(),
                delivered: false,
            };
            let next = task_session.process(&ctx);
            guard.deliver(next);
        });

        if let Err(e) = self.pool.submit(task) {
            log_warn!(self.logger, "fd({}) not scheduled: {}", session.fd(), e);
            self.close(session, CloseMode::Abort, "worker pool rejected task");
        }
    }

    fn drain_completions(&mut self) {
        self.completions.reset();
        while let Some(completion) = self.completions.pop() {
            let Some(session) = self.live_session(completion.fd, completion.serial) else {
                continue;
            };
            match completion.next {
                NextStep::AwaitRead => self.arm(session, Interest::READABLE),
                NextStep::AwaitWrite => {
                    self.stats.requests += 1;
                    self.arm(session, Interest::WRITABLE);
                }
                NextStep::Close => self.close(session, CloseMode::Abort, "closed by worker"),
            }
        }
    }

    /// Re-arm a one-shot connection for `direction`
    fn arm(&mut self, session: Arc<Session>, direction: Interest) {
        let interest = self.config.trigger_mode.conn_interest() | direction;
        if let Err(e) = self.reactor.modify(session.fd(), interest) {
            log_warn!(self.logger, "fd({}) re-arm failed: {}", session.fd(), e);
            self.close(session, CloseMode::Abort, "re-arm failed");
        }
    }

    fn arm_timer(&mut self, fd: RawFd, serial: u64) {
        if let Some(timeout) = self.idle_timeout {
            let evictions = Arc::clone(&self.evictions);
            self.timers.add(fd, timeout, move || evictions.push((fd, serial)));
        }
    }

    fn refresh_timer(&mut self, fd: RawFd) {
        if let Some(timeout) = self.idle_timeout {
            self.timers.update(fd, timeout);
        }
    }

    fn reap_evictions(&mut self) {
        while let Some((fd, serial)) = self.evictions.pop() {
            if let Some(session) = self.live_session(fd, serial) {
                self.stats.evicted += 1;
                log_info!(self.logger, "fd({}) idle timeout", fd);
                self.close(session, CloseMode::Abort, "idle timeout");
            }
        }
    }

    fn live_session(&self, fd: RawFd, serial: u64) -> Option<Arc<Session>> {
        self.sessions
            .get(&fd)
            .filter(|s| s.serial() == serial)
            .cloned()
    }

    /// Tear down one connection. The descriptor itself closes when the
    /// last `Arc<Session>` drops, which for a lingering graceful close
    /// happens on the closer thread.
    fn close(&mut self, session: Arc<Session>, mode: CloseMode, reason: &str) {
        let fd = session.fd();
        match self.sessions.get(&fd) {
            Some(current) if Arc::ptr_eq(current, &session) => {}
            _ => return,
        }
        self.sessions.remove(&fd);
        session.evict();
        if let Err(e) = self.reactor.deregister(fd) {
            log_trace!(self.logger, "fd({}) deregister: {}", fd, e);
        }
        self.timers.remove(fd, false);

        let lingering = self.config.linger && mode == CloseMode::Graceful;
        if self.config.linger && mode == CloseMode::Abort {
            if let Err(e) = set_abortive_close(session.stream()) {
                log_trace!(self.logger, "fd({}) abortive close: {}", fd, e);
            }
        }
        session.shutdown();
        session.release();
        self.stats.closed += 1;
        log_debug!(self.logger, "fd({}) closed: {}", fd, reason);
        if lingering {
            self.closer.defer(session);
        }
    }

    fn stop(&mut self) {
        if self.state == ServerState::Stopped {
            return;
        }
        self.state = ServerState::Stopped;
        self.running.store(false, Ordering::Release);

        let open: Vec<Arc<Session>> = self.sessions.values().cloned().collect();
        for session in open {
            self.close(session, CloseMode::Abort, "server stopping");
        }
        if let Some(listener) = self.listener.take() {
            let _ = self.reactor.deregister(listener.as_raw_fd());
        }
        self.pool.shutdown();
        self.timers.clear();
        while self.evictions.pop().is_some() {}
        while self.completions.pop().is_some() {}

        let s = self.stats;
        log_info!(
            self.logger,
            "stopped: accepted={} rejected={} closed={} evicted={} requests={} bytes_out={}",
            s.accepted,
            s.rejected,
            s.closed,
            s.evicted,
            s.requests,
            s.bytes_out
        );
        self.logger.flush();
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}
