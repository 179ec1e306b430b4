//! Background thread that drops values whose destructor may block.
//!
//! With `SO_LINGER {on, 1s}` the final `close(2)` of a connection waits
//! until unsent data is acknowledged or the timeout expires. Handing the
//! last reference here keeps that wait off the dispatcher.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_queue::SegQueue;

struct Shared<T> {
    queue: SegQueue<T>,
    stop: AtomicBool,
}

/// Owns a single `ember-closer` thread; dropping the `Closer` drains the
/// queue and joins it.
pub struct Closer<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    thread: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> Closer<T> {
    pub fn spawn() -> io::Result<Self> {
        let shared = Arc::new(Shared {
            queue: SegQueue::new(),
            stop: AtomicBool::new(false),
        });
        let worker_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("ember-closer".into())
            .spawn(move || Self::drop_loop(worker_shared))?;
        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    fn drop_loop(shared: Arc<Shared<T>>) {
        loop {
            while let Some(item) = shared.queue.pop() {
                drop(item);
            }
            if shared.stop.load(Ordering::Acquire) && shared.queue.is_empty() {
                break;
            }
            thread::park_timeout(Duration::from_millis(50));
        }
    }

    /// Queue `item` to be dropped on the closer thread
    pub fn defer(&self, item: T) {
        self.shared.queue.push(item);
        if let Some(thread) = &self.thread {
            thread.thread().unpark();
        }
    }

    /// Items queued but not yet dropped
    pub fn pending(&self) -> usize {
        self.shared.queue.len()
    }
}

impl<T: Send + 'static> Drop for Closer<T> {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            thread.thread().unpark();
            let _ = thread.join();
        }
        // closer thread failed to spawn or panicked
        while let Some(item) = self.shared.queue.pop() {
            drop(item);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordDrop(Arc<Mutex<Vec<Option<String>>>>);

    impl Drop for RecordDrop {
        fn drop(&mut self) {
            let name = thread::current().name().map(str::to_owned);
            self.0.lock().unwrap().push(name);
        }
    }

    #[test]
    fn test_deferred_values_drop_on_closer_thread() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let closer = Closer::spawn().unwrap();
        for _ in 0..3 {
            closer.defer(RecordDrop(Arc::clone(&seen)));
        }
        drop(closer);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|n| n.as_deref() == Some("ember-closer")));
    }

    #[test]
    fn test_slow_drop_does_not_block_caller() {
        struct Slow;
        impl Drop for Slow {
            fn drop(&mut self) {
                thread::sleep(Duration::from_millis(300));
            }
        }

        let closer = Closer::spawn().unwrap();
        let start = std::time::Instant::now();
        closer.defer(Slow);
        closer.defer(Slow);
        assert!(start.elapsed() < Duration::from_millis(100));
        drop(closer);
        assert!(start.elapsed() >= Duration::from_millis(600));
    }
}
