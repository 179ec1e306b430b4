//! Connection byte buffers.
//!
//! - `ReadBuffer`: received bytes with a write cursor (filled) and a parse
//!   cursor (consumed by the parser), capped at a hard limit.
//! - `PendingWrite`: up to two spans (header block, optional body) with a
//!   consumed counter per span.
//!
//! `read_drain` / `write_drain` are the only places that touch the socket;
//! both are generic over `Read` / `Write` so tests can substitute scripted
//! streams.

use std::io::{self, IoSlice, Read, Write};

use crate::mapped::MappedFile;

// ============================================================================
// Read side
// ============================================================================

/// Growable receive buffer
///
/// Invariant: `parse_cursor <= write_cursor <= data.len() <= limit`.
#[derive(Debug)]
pub struct ReadBuffer {
    data: Vec<u8>,
    write_cursor: usize,
    parse_cursor: usize,
    limit: usize,
}

impl ReadBuffer {
    pub fn new(initial: usize, limit: usize) -> Self {
        let initial = initial.max(1);
        Self {
            data: vec![0; initial],
            write_cursor: 0,
            parse_cursor: 0,
            limit: limit.max(initial),
        }
    }

    /// Bytes received but not yet consumed by the parser
    pub fn unparsed(&self) -> &[u8] {
        &self.data[self.parse_cursor..self.write_cursor]
    }

    pub fn has_unparsed(&self) -> bool {
        self.parse_cursor < self.write_cursor
    }

    pub fn write_cursor(&self) -> usize {
        self.write_cursor
    }

    pub fn parse_cursor(&self) -> usize {
        self.parse_cursor
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Mark `n` unparsed bytes as consumed
    pub fn consume(&mut self, n: usize) {
        self.parse_cursor = (self.parse_cursor + n).min(self.write_cursor);
    }

    /// Writable tail, grown (doubling) up to the limit. Empty when full.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        if self.write_cursor == self.data.len() && self.data.len() < self.limit {
            let grown = (self.data.len() * 2).min(self.limit);
            self.data.resize(grown, 0);
        }
        &mut self.data[self.write_cursor..]
    }

    /// Record `n` bytes written into `spare_mut()`
    pub fn commit(&mut self, n: usize) {
        self.write_cursor = (self.write_cursor + n).min(self.data.len());
    }

    /// True when no more bytes can be received without compaction
    pub fn is_full(&self) -> bool {
        self.write_cursor >= self.limit
    }

    /// Discard consumed bytes, moving the unparsed tail to the front
    pub fn compact(&mut self) {
        if self.parse_cursor == 0 {
            return;
        }
        self.data.copy_within(self.parse_cursor..self.write_cursor, 0);
        self.write_cursor -= self.parse_cursor;
        self.parse_cursor = 0;
    }

    pub fn clear(&mut self) {
        self.write_cursor = 0;
        self.parse_cursor = 0;
    }
}

/// Result of draining a socket into a `ReadBuffer`
#[derive(Debug)]
pub enum ReadOutcome {
    /// Socket has nothing more for now (or the buffer hit its limit)
    Drained { received: usize },

    /// Orderly shutdown by the peer (zero-length read)
    Closed,

    /// Any error other than would-block
    Failed(io::Error),
}

/// Receive into the tail of `buf`.
///
/// Edge-triggered sockets are read until would-block; level-triggered
/// ones get a single read per readiness event.
pub fn read_drain<R: Read>(buf: &mut ReadBuffer, src: &mut R, edge_triggered: bool) -> ReadOutcome {
    let mut received = 0;
    loop {
        let spare = buf.spare_mut();
        if spare.is_empty() {
            return ReadOutcome::Drained { received };
        }
        match src.read(spare) {
            Ok(0) => return ReadOutcome::Closed,
            Ok(n) => {
                buf.commit(n);
                received += n;
                if !edge_triggered {
                    return ReadOutcome::Drained { received };
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                return ReadOutcome::Drained { received };
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return ReadOutcome::Failed(e),
        }
    }
}

// ============================================================================
// Write side
// ============================================================================

/// Response body span
#[derive(Debug)]
pub enum Body {
    /// Read-only mapping of a served file
    Mapped(MappedFile),

    /// Owned bytes
    Owned(Vec<u8>),
}

impl Body {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Body::Mapped(map) => map.as_slice(),
            Body::Owned(bytes) => bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Progress through one span: `{length, consumed}`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpanCursor {
    len: usize,
    consumed: usize,
}

impl SpanCursor {
    pub fn new(len: usize) -> Self {
        Self { len, consumed: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.len - self.consumed
    }

    pub fn is_done(&self) -> bool {
        self.consumed == self.len
    }

    pub fn consumed(&self) -> usize {
        self.consumed
    }

    /// Apply `n` written bytes; returns the advanced cursor and the bytes
    /// left over for the next span.
    pub fn advance(self, n: usize) -> (Self, usize) {
        let step = n.min(self.remaining());
        (
            Self {
                len: self.len,
                consumed: self.consumed + step,
            },
            n - step,
        )
    }
}

/// Serialized response awaiting transmission
#[derive(Debug, Default)]
pub struct PendingWrite {
    head: Vec<u8>,
    head_cursor: SpanCursor,
    body: Option<Body>,
    body_cursor: SpanCursor,
}

impl PendingWrite {
    pub fn new(head: Vec<u8>, body: Option<Body>) -> Self {
        let head_cursor = SpanCursor::new(head.len());
        let body_cursor = SpanCursor::new(body.as_ref().map_or(0, Body::len));
        Self {
            head,
            head_cursor,
            body,
            body_cursor,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn head(&self) -> &[u8] {
        &self.head
    }

    pub fn body(&self) -> Option<&Body> {
        self.body.as_ref()
    }

    pub fn total_len(&self) -> usize {
        self.head_cursor.len + self.body_cursor.len
    }

    pub fn bytes_sent(&self) -> usize {
        self.head_cursor.consumed() + self.body_cursor.consumed()
    }

    pub fn bytes_remaining(&self) -> usize {
        self.head_cursor.remaining() + self.body_cursor.remaining()
    }

    pub fn is_complete(&self) -> bool {
        self.bytes_remaining() == 0
    }

    /// Account for `n` bytes accepted by the socket
    pub fn advance(&mut self, n: usize) {
        let (head, rest) = self.head_cursor.advance(n);
        let (body, _) = self.body_cursor.advance(rest);
        self.head_cursor = head;
        self.body_cursor = body;
    }

    /// Drop both spans, unmapping a file body
    pub fn release(&mut self) {
        *self = Self::empty();
    }

    fn slices(&self) -> ([IoSlice<'_>; 2], usize) {
        let mut out = [IoSlice::new(&[]), IoSlice::new(&[])];
        let mut n = 0;
        if !self.head_cursor.is_done() {
            out[n] = IoSlice::new(&self.head[self.head_cursor.consumed()..]);
            n += 1;
        }
        if let Some(body) = &self.body {
            if !self.body_cursor.is_done() {
                out[n] = IoSlice::new(&body.as_slice()[self.body_cursor.consumed()..]);
                n += 1;
            }
        }
        (out, n)
    }
}

/// Result of draining a `PendingWrite` into a socket
#[derive(Debug)]
pub enum WriteOutcome {
    /// Every byte has been accepted
    Complete,

    /// Socket buffer full, bytes remain
    WouldBlock,

    /// Any other write error, or the peer stopped accepting bytes
    Failed(io::Error),
}

/// Vectored write of whatever remains, looping over short writes.
pub fn write_drain<W: Write>(pending: &mut PendingWrite, dst: &mut W) -> WriteOutcome {
    while !pending.is_complete() {
        let result = {
            let (slices, n) = pending.slices();
            dst.write_vectored(&slices[..n])
        };
        match result {
            Ok(0) => {
                return WriteOutcome::Failed(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "socket accepted zero bytes",
                ));
            }
            Ok(n) => pending.advance(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return WriteOutcome::WouldBlock,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return WriteOutcome::Failed(e),
        }
    }
    WriteOutcome::Complete
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Reader that replays scripted chunks and errors
    struct ScriptedReader(VecDeque<io::Result<Vec<u8>>>);

    impl Read for ScriptedReader {
        fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
            match self.0.pop_front() {
                Some(Ok(chunk)) => {
                    let n = chunk.len().min(out.len());
                    out[..n].copy_from_slice(&chunk[..n]);
                    if n < chunk.len() {
                        self.0.push_front(Ok(chunk[n..].to_vec()));
                    }
                    Ok(n)
                }
                Some(Err(e)) => Err(e),
                None => Err(io::ErrorKind::WouldBlock.into()),
            }
        }
    }

    fn reader(steps: Vec<io::Result<Vec<u8>>>) -> ScriptedReader {
        ScriptedReader(steps.into_iter().collect())
    }

    fn ok(bytes: &[u8]) -> io::Result<Vec<u8>> {
        Ok(bytes.to_vec())
    }

    fn err(kind: io::ErrorKind) -> io::Result<Vec<u8>> {
        Err(kind.into())
    }

    /// Writer that accepts at most `budget[i]` bytes on call i, then
    /// would-blocks once the budget list runs dry.
    struct ThrottledWriter {
        budgets: VecDeque<usize>,
        written: Vec<u8>,
    }

    impl Write for ThrottledWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.write_vectored(&[IoSlice::new(buf)])
        }

        fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
            let Some(mut budget) = self.budgets.pop_front() else {
                return Err(io::ErrorKind::WouldBlock.into());
            };
            let mut n = 0;
            for buf in bufs {
                let take = budget.min(buf.len());
                self.written.extend_from_slice(&buf[..take]);
                budget -= take;
                n += take;
            }
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_read_level_triggered_reads_once() {
        let mut buf = ReadBuffer::new(16, 64);
        let mut src = reader(vec![ok(b"abc"), ok(b"def")]);
        let outcome = read_drain(&mut buf, &mut src, false);
        assert!(matches!(outcome, ReadOutcome::Drained { received: 3 }));
        assert_eq!(buf.unparsed(), b"abc");
    }

    #[test]
    fn test_read_edge_triggered_drains_to_would_block() {
        let mut buf = ReadBuffer::new(4, 64);
        let mut src = reader(vec![ok(b"hello "), ok(b"world")]);
        let outcome = read_drain(&mut buf, &mut src, true);
        assert!(matches!(outcome, ReadOutcome::Drained { received: 11 }));
        assert_eq!(buf.unparsed(), b"hello world");
    }

    #[test]
    fn test_read_zero_is_closed_and_errors_fail() {
        let mut buf = ReadBuffer::new(8, 8);
        let mut src = reader(vec![ok(b"")]);
        assert!(matches!(read_drain(&mut buf, &mut src, true), ReadOutcome::Closed));

        let mut src = reader(vec![err(io::ErrorKind::ConnectionReset)]);
        assert!(matches!(read_drain(&mut buf, &mut src, false), ReadOutcome::Failed(_)));
    }

    #[test]
    fn test_read_retries_interrupted() {
        let mut buf = ReadBuffer::new(8, 8);
        let mut src = reader(vec![err(io::ErrorKind::Interrupted), ok(b"ok")]);
        assert!(matches!(
            read_drain(&mut buf, &mut src, false),
            ReadOutcome::Drained { received: 2 }
        ));
    }

    #[test]
    fn test_read_stops_at_limit() {
        let mut buf = ReadBuffer::new(2, 6);
        let mut src = reader(vec![ok(b"0123456789")]);
        let outcome = read_drain(&mut buf, &mut src, true);
        assert!(matches!(outcome, ReadOutcome::Drained { received: 6 }));
        assert!(buf.is_full());
        assert_eq!(buf.unparsed(), b"012345");
    }

    #[test]
    fn test_compact_keeps_unparsed_tail() {
        let mut buf = ReadBuffer::new(16, 16);
        buf.spare_mut()[..10].copy_from_slice(b"GET /a\r\nXY");
        buf.commit(10);
        buf.consume(8);
        buf.compact();
        assert_eq!(buf.parse_cursor(), 0);
        assert_eq!(buf.write_cursor(), 2);
        assert_eq!(buf.unparsed(), b"XY");
    }

    #[test]
    fn test_span_cursor_advance_carries_leftover() {
        let (c, rest) = SpanCursor::new(5).advance(3);
        assert_eq!((c.consumed(), c.remaining(), rest), (3, 2, 0));
        let (c, rest) = c.advance(10);
        assert!(c.is_done());
        assert_eq!(rest, 8);
    }

    #[test]
    fn test_write_resumes_after_short_write() {
        let head = b"HTTP/1.1 200 OK\r\n\r\n".to_vec();
        let body = b"<html>body</html>".to_vec();
        let mut expected = head.clone();
        expected.extend_from_slice(&body);

        let mut pending = PendingWrite::new(head, Some(Body::Owned(body)));
        let total = pending.total_len();

        // first call takes only 5 bytes of the header, then the socket blocks
        let mut sock = ThrottledWriter {
            budgets: VecDeque::from(vec![5]),
            written: Vec::new(),
        };
        assert!(matches!(write_drain(&mut pending, &mut sock), WriteOutcome::WouldBlock));
        assert_eq!(pending.bytes_sent(), 5);

        sock.budgets.push_back(usize::MAX);
        assert!(matches!(write_drain(&mut pending, &mut sock), WriteOutcome::Complete));
        assert_eq!(pending.bytes_sent(), total);
        assert_eq!(pending.bytes_remaining(), 0);
        assert_eq!(sock.written, expected);
    }

    #[test]
    fn test_write_short_writes_across_span_boundary() {
        let mut pending = PendingWrite::new(b"abcd".to_vec(), Some(Body::Owned(b"efgh".to_vec())));
        let mut sock = ThrottledWriter {
            budgets: VecDeque::from(vec![3, 3, 3]),
            written: Vec::new(),
        };
        assert!(matches!(write_drain(&mut pending, &mut sock), WriteOutcome::Complete));
        assert_eq!(sock.written, b"abcdefgh");
    }

    #[test]
    fn test_write_zero_fails() {
        let mut pending = PendingWrite::new(b"x".to_vec(), None);
        let mut sock = ThrottledWriter {
            budgets: VecDeque::from(vec![0]),
            written: Vec::new(),
        };
        assert!(matches!(write_drain(&mut pending, &mut sock), WriteOutcome::Failed(_)));
    }

    #[test]
    fn test_empty_pending_is_complete() {
        let mut pending = PendingWrite::empty();
        let mut sock = ThrottledWriter {
            budgets: VecDeque::new(),
            written: Vec::new(),
        };
        assert!(matches!(write_drain(&mut pending, &mut sock), WriteOutcome::Complete));
    }
}
