//! Per-connection session.
//!
//! A `Session` is shared (`Arc`) between the connection table and at most
//! one in-flight worker task. The dispatcher performs all socket I/O
//! (`read_drain`, `write_drain`); a worker runs `process`, which only
//! touches the buffers and builds the response.
//!
//! The socket closes when the last `Arc` drops, so a descriptor number is
//! never reused while a task still holds the session. Tasks check
//! `is_evicted()` before doing any work.

use std::net::{Shutdown, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};

use ember_core::{log_debug, log_warn, Logger};

use crate::buffer::{self, PendingWrite, ReadBuffer, ReadOutcome, WriteOutcome};
use crate::credentials::CredentialStore;
use crate::request::{Method, ParseState, RequestParser};
use crate::response::Response;

/// What the dispatcher should do once `process` returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStep {
    /// Request incomplete; re-arm for readable
    AwaitRead,

    /// Response built; re-arm for writable
    AwaitWrite,

    /// Drop the connection
    Close,
}

/// Everything a worker needs to turn a request into a response
pub struct ProcessContext {
    pub doc_root: PathBuf,
    pub store: Arc<dyn CredentialStore>,
    pub logger: Logger,
}

/// Mutable per-connection data, guarded by the session mutex
#[derive(Debug)]
pub struct SessionState {
    pub buffer: ReadBuffer,
    pub parser: RequestParser,
    pub pending: PendingWrite,
    pub keep_alive: bool,
}

pub struct Session {
    serial: u64,
    fd: RawFd,
    stream: TcpStream,
    evicted: AtomicBool,
    state: Mutex<SessionState>,
}

impl Session {
    pub fn new(stream: TcpStream, serial: u64, buffer_initial: usize, buffer_limit: usize) -> Self {
        Self {
            serial,
            fd: stream.as_raw_fd(),
            stream,
            evicted: AtomicBool::new(false),
            state: Mutex::new(SessionState {
                buffer: ReadBuffer::new(buffer_initial, buffer_limit),
                parser: RequestParser::new(),
                pending: PendingWrite::empty(),
                keep_alive: false,
            }),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Distinguishes successive connections that reuse one descriptor number
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::Acquire)
    }

    /// Mark closed; in-flight tasks bail out on their next check
    pub fn evict(&self) {
        self.evicted.store(true, Ordering::Release);
    }

    pub fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Keep-alive flag of the response currently being written
    pub fn keep_alive(&self) -> bool {
        self.lock().keep_alive
    }

    /// Receive into the read buffer
    pub fn read_drain(&self, edge_triggered: bool) -> ReadOutcome {
        let mut state = self.lock();
        buffer::read_drain(&mut state.buffer, &mut &self.stream, edge_triggered)
    }

    /// Send as much of the pending response as the socket accepts.
    ///
    /// Returns the outcome and the number of bytes sent by this call.
    pub fn write_drain(&self) -> (WriteOutcome, usize) {
        let mut state = self.lock();
        let before = state.pending.bytes_sent();
        let outcome = buffer::write_drain(&mut state.pending, &mut &self.stream);
        let sent = state.pending.bytes_sent() - before;
        (outcome, sent)
    }

    /// Parse whatever is buffered and, once the request is terminal, build
    /// the response. Runs on a worker thread.
    pub fn process(&self, ctx: &ProcessContext) -> NextStep {
        if self.is_evicted() {
            return NextStep::Close;
        }
        let mut guard = self.lock();
        let state = &mut *guard;

        let consumed = state.parser.advance(state.buffer.unparsed());
        state.buffer.consume(consumed);

        let response = match state.parser.state() {
            ParseState::Complete => {
                let mut request = state.parser.take_request();
                request.apply_form_action(ctx.store.as_ref(), &ctx.logger);
                let response =
                    Response::for_request(&ctx.doc_root, request.path(), request.keep_alive())
                        .head_only(request.method() == Method::Head);
                log_debug!(
                    ctx.logger,
                    "fd({}) {} {} -> {}",
                    self.fd,
                    request.method(),
                    request.path(),
                    response.code()
                );
                response
            }
            ParseState::Failed => {
                log_warn!(ctx.logger, "fd({}) malformed request", self.fd);
                Response::bad_request(&ctx.doc_root)
            }
            _ if state.buffer.is_full() => {
                log_warn!(
                    ctx.logger,
                    "fd({}) request exceeds {} byte buffer",
                    self.fd,
                    state.buffer.limit()
                );
                Response::bad_request(&ctx.doc_root)
            }
            _ => return NextStep::AwaitRead,
        };

        if self.is_evicted() {
            return NextStep::Close;
        }
        state.keep_alive = response.keep_alive();
        state.pending = response.build();
        NextStep::AwaitWrite
    }

    /// Reset for the next request on a keep-alive connection.
    ///
    /// Releases the previous response and returns true if bytes of a
    /// further request are already buffered.
    pub fn finish_exchange(&self) -> bool {
        let mut state = self.lock();
        state.pending.release();
        state.parser.reset();
        state.keep_alive = false;
        state.buffer.compact();
        state.buffer.has_unparsed()
    }

    /// Half-close both directions so the peer sees EOF right away
    pub fn shutdown(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    /// Drop the pending response unless a worker currently holds the state
    pub fn release(&self) {
        match self.state.try_lock() {
            Ok(mut state) => state.pending.release(),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().pending.release(),
            Err(TryLockError::WouldBlock) => {}
        }
    }
}
