//! epoll readiness reactor.
//!
//! Thin wrapper over `epoll_create1` / `epoll_ctl` / `epoll_wait`.
//! The event payload is the descriptor itself, so every event maps
//! straight back to a connection table key.
//!
//! Connections are registered one-shot: after an event is reported the
//! descriptor is disarmed until `modify` re-arms it for exactly one of
//! readable or writable. Re-arming with `EPOLL_CTL_MOD` re-evaluates
//! readiness, so data that arrived while disarmed is reported even in
//! edge-triggered mode.

use std::io;
use std::ops::{BitOr, BitOrAssign};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use nix::fcntl::{fcntl, FcntlArg, OFlag};

/// Bitset of epoll interest flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest(u32);

impl Interest {
    pub const READABLE: Interest = Interest(libc::EPOLLIN as u32);
    pub const WRITABLE: Interest = Interest(libc::EPOLLOUT as u32);
    pub const PEER_HANGUP: Interest = Interest(libc::EPOLLRDHUP as u32);
    pub const ERROR: Interest = Interest(libc::EPOLLERR as u32);
    pub const EDGE: Interest = Interest(libc::EPOLLET as u32);
    pub const ONESHOT: Interest = Interest(libc::EPOLLONESHOT as u32);

    pub const fn empty() -> Self {
        Interest(0)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub const fn contains(&self, other: Interest) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

impl BitOrAssign for Interest {
    fn bitor_assign(&mut self, rhs: Interest) {
        self.0 |= rhs.0;
    }
}

/// One readiness report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    fd: RawFd,
    mask: u32,
}

impl Event {
    pub fn new(fd: RawFd, mask: u32) -> Self {
        Self { fd, mask }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn mask(&self) -> u32 {
        self.mask
    }

    pub fn is_readable(&self) -> bool {
        self.mask & libc::EPOLLIN as u32 != 0
    }

    pub fn is_writable(&self) -> bool {
        self.mask & libc::EPOLLOUT as u32 != 0
    }

    /// Peer closed, hung up, or the socket reported an error
    pub fn is_hangup(&self) -> bool {
        self.mask & (libc::EPOLLRDHUP | libc::EPOLLHUP | libc::EPOLLERR) as u32 != 0
    }
}

pub struct Reactor {
    epfd: OwnedFd,
    events: Vec<libc::epoll_event>,
}

impl Reactor {
    /// `max_events`: events fetched per `wait`
    pub fn new(max_events: usize) -> io::Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: fd was just returned by epoll_create1 and is owned by nobody else.
        let epfd = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self {
            epfd,
            events: vec![libc::epoll_event { events: 0, u64: 0 }; max_events.max(1)],
        })
    }

    /// Switch `fd` to non-blocking and add it with `interest`
    pub fn register(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        set_nonblocking(fd)?;
        self.ctl(libc::EPOLL_CTL_ADD, fd, interest)
    }

    /// Replace the interest of a registered fd (re-arms one-shot)
    pub fn modify(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, interest)
    }

    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        let ret = unsafe {
            libc::epoll_ctl(self.epfd.as_raw_fd(), libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Block until events arrive or `timeout` passes (`None` = forever).
    ///
    /// `out` is cleared and filled. An interrupted wait returns 0 events.
    pub fn wait(&mut self, timeout: Option<Duration>, out: &mut Vec<Event>) -> io::Result<usize> {
        out.clear();
        let timeout_ms = match timeout {
            None => -1,
            // round up so a pending deadline is not polled early in a busy loop
            Some(d) => d
                .as_nanos()
                .div_ceil(1_000_000)
                .min(libc::c_int::MAX as u128) as libc::c_int,
        };
        let n = unsafe {
            libc::epoll_wait(
                self.epfd.as_raw_fd(),
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }
        for ev in &self.events[..n as usize] {
            let mask = ev.events;
            let data = ev.u64;
            out.push(Event::new(data as RawFd, mask));
        }
        Ok(n as usize)
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, interest: Interest) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: interest.bits(),
            u64: fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd, &mut ev) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl AsRawFd for Reactor {
    fn as_raw_fd(&self) -> RawFd {
        self.epfd.as_raw_fd()
    }
}

pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(io::Error::from)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(io::Error::from)?;
    Ok(())
}
