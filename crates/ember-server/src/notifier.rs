//! Worker-to-dispatcher completion channel.
//!
//! Workers push a `Completion` onto a lock-free queue and bump an eventfd
//! that is registered with the reactor. Several notifications before the
//! dispatcher reads the eventfd coalesce into a single wakeup (eventfd
//! counter semantics), so the dispatcher always drains the whole queue.

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crossbeam_queue::SegQueue;
use ember_http::NextStep;

/// Non-blocking eventfd used as a reactor wakeup
pub struct EventFd {
    fd: OwnedFd,
}

impl EventFd {
    /// Create with `EFD_NONBLOCK | EFD_CLOEXEC`
    pub fn create() -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: fd was just returned by eventfd and has no other owner.
        Ok(Self { fd: unsafe { OwnedFd::from_raw_fd(fd) } })
    }

    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn notify(&self) -> io::Result<()> {
        let val: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // EAGAIN: counter saturated, a wakeup is already pending
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }

    /// Reset the counter. Returns the number of coalesced notifications.
    pub fn drain(&self) -> u64 {
        let mut val: u64 = 0;
        let ret = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                &mut val as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            0
        } else {
            val
        }
    }
}

/// Result of one worker task, applied by the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub fd: RawFd,
    pub serial: u64,
    pub next: NextStep,
}

pub struct Completions {
    queue: SegQueue<Completion>,
    waker: EventFd,
}

impl Completions {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            queue: SegQueue::new(),
            waker: EventFd::create()?,
        })
    }

    /// Queue `completion` and wake the dispatcher
    pub fn push(&self, completion: Completion) {
        self.queue.push(completion);
        self.wake();
    }

    /// Wake the dispatcher without queueing anything
    pub fn wake(&self) {
        // write fails only on a closed eventfd, which outlives every pusher
        let _ = self.waker.notify();
    }

    pub fn pop(&self) -> Option<Completion> {
        self.queue.pop()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Descriptor to register for readable interest
    pub fn fd(&self) -> RawFd {
        self.waker.fd()
    }

    /// Clear the eventfd counter before draining the queue
    pub fn reset(&self) -> u64 {
        self.waker.drain()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_eventfd_coalesces() {
        let efd = EventFd::create().unwrap();
        assert_eq!(efd.drain(), 0);
        efd.notify().unwrap();
        efd.notify().unwrap();
        efd.notify().unwrap();
        assert_eq!(efd.drain(), 3);
        assert_eq!(efd.drain(), 0);
    }

    #[test]
    fn test_completions_from_threads() {
        let completions = Arc::new(Completions::new().unwrap());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let completions = Arc::clone(&completions);
                thread::spawn(move || {
                    for i in 0..25 {
                        completions.push(Completion {
                            fd: t,
                            serial: i,
                            next: NextStep::AwaitWrite,
                        });
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert!(completions.reset() > 0);
        assert_eq!(completions.len(), 100);
        let mut n = 0;
        while let Some(c) = completions.pop() {
            assert_eq!(c.next, NextStep::AwaitWrite);
            n += 1;
        }
        assert_eq!(n, 100);
        assert!(completions.is_empty());
    }
}
