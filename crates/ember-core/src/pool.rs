//! Worker pool abstraction and the default fixed-size implementation.
//!
//! The dispatcher hands request processing to a `WorkerPool` so that it
//! never parses or touches the filesystem itself.
//!
//! **Contract:**
//! - `submit()` never blocks the caller. A full queue returns
//!   `Err(QueueFull)`, a stopped pool returns `Err(ShutDown)`.
//! - Every accepted task runs exactly once, even if other tasks panic.
//! - `shutdown()` lets queued tasks finish, then joins the workers.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use crate::error::{PoolError, PoolResult};
use crate::log::Logger;
use crate::{log_debug, log_error};

/// Unit of work executed on a pool thread
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Executes tasks on a set of threads.
pub trait WorkerPool: Send + Sync {
    /// Queue a task. Returns immediately.
    fn submit(&self, task: Task) -> PoolResult<()>;

    /// Tasks queued but not yet picked up
    fn pending(&self) -> usize;

    /// Number of workers currently running a task
    fn active_workers(&self) -> usize;

    /// Total number of workers (busy + idle)
    fn total_workers(&self) -> usize;

    /// Stop accepting work, drain the queue, join the workers.
    fn shutdown(&self);
}

struct PoolQueue {
    tasks: VecDeque<Task>,
    stopped: bool,
}

/// Shared state between submitters and workers
struct PoolInner {
    queue: Mutex<PoolQueue>,
    available: Condvar,
    capacity: usize,
    active: AtomicUsize,
    completed: AtomicU64,
    panicked: AtomicU64,
    logger: Logger,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Fixed number of OS threads sharing one bounded FIFO
pub struct ThreadPool {
    inner: Arc<PoolInner>,
    total: usize,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadPool {
    /// Create a pool with `workers` threads.
    ///
    /// `capacity`: max queued tasks before `submit` fails.
    pub fn new(workers: usize, capacity: usize, logger: Logger) -> PoolResult<Self> {
        let workers = workers.clamp(1, crate::MAX_WORKERS);
        let inner = Arc::new(PoolInner {
            queue: Mutex::new(PoolQueue {
                tasks: VecDeque::with_capacity(capacity.min(4096)),
                stopped: false,
            }),
            available: Condvar::new(),
            capacity: capacity.max(1),
            active: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            panicked: AtomicU64::new(0),
            logger,
        });

        let pool = ThreadPool {
            inner,
            total: workers,
            handles: Mutex::new(Vec::with_capacity(workers)),
        };

        for worker_id in 0..workers {
            let inner = Arc::clone(&pool.inner);
            let spawned = thread::Builder::new()
                .name(format!("ember-worker-{}", worker_id))
                .spawn(move || worker_loop(inner, worker_id));
            match spawned {
                Ok(handle) => pool.lock_handles().push(handle),
                Err(e) => {
                    // dropping `pool` stops and joins what was started
                    return Err(PoolError::Spawn(e));
                }
            }
        }

        log_debug!(
            pool.inner.logger,
            "pool: {} workers, queue capacity {}",
            workers,
            pool.inner.capacity
        );
        Ok(pool)
    }

    /// Tasks that ran to completion
    pub fn completed(&self) -> u64 {
        self.inner.completed.load(Ordering::Relaxed)
    }

    /// Tasks that panicked
    pub fn panicked(&self) -> u64 {
        self.inner.panicked.load(Ordering::Relaxed)
    }

    fn lock_handles(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stop_and_join(&self) {
        {
            let mut queue = self.inner.lock();
            queue.stopped = true;
        }
        self.inner.available.notify_all();

        let handles: Vec<JoinHandle<()>> = self.lock_handles().drain(..).collect();
        let me = thread::current().id();
        for handle in handles {
            // a task that drops the last pool reference cannot join itself
            if handle.thread().id() == me {
                continue;
            }
            let _ = handle.join();
        }
    }
}

impl WorkerPool for ThreadPool {
    fn submit(&self, task: Task) -> PoolResult<()> {
        {
            let mut queue = self.inner.lock();
            if queue.stopped {
                return Err(PoolError::ShutDown);
            }
            if queue.tasks.len() >= self.inner.capacity {
                return Err(PoolError::QueueFull);
            }
            queue.tasks.push_back(task);
        }
        self.inner.available.notify_one();
        Ok(())
    }

    fn pending(&self) -> usize {
        self.inner.lock().tasks.len()
    }

    fn active_workers(&self) -> usize {
        self.inner.active.load(Ordering::Relaxed)
    }

    fn total_workers(&self) -> usize {
        self.total
    }

    fn shutdown(&self) {
        self.stop_and_join();
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

/// Worker thread main loop.
///
/// Exits only once the pool is stopped and the queue is empty.
fn worker_loop(inner: Arc<PoolInner>, worker_id: usize) {
    loop {
        let task = {
            let mut queue = inner.lock();
            loop {
                if let Some(task) = queue.tasks.pop_front() {
                    break Some(task);
                }
                if queue.stopped {
                    break None;
                }
                queue = inner
                    .available
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };
        let Some(task) = task else { break };

        inner.active.fetch_add(1, Ordering::Relaxed);
        let outcome = panic::catch_unwind(AssertUnwindSafe(task));
        inner.active.fetch_sub(1, Ordering::Relaxed);

        match outcome {
            Ok(()) => {
                inner.completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(payload) => {
                inner.panicked.fetch_add(1, Ordering::Relaxed);
                log_error!(
                    inner.logger,
                    "pool: task on worker {} panicked: {}",
                    worker_id,
                    panic_message(payload.as_ref())
                );
            }
        }
    }
    log_debug!(inner.logger, "pool: worker {} exiting", worker_id);
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
