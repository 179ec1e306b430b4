//! Indexed min-heap of keyed deadlines
//!
//! Each key (a connection descriptor in the server) owns at most one
//! deadline. A side index maps key to heap slot so that refresh and
//! removal of an arbitrary key are O(log n) instead of a linear scan.
//!
//! # Complexity
//!
//! - Add / update / remove: O(log n)
//! - Sweep expired: O(k log n) where k = number of expired entries
//! - Next deadline: O(1) after the sweep
//!
//! # Callbacks
//!
//! A node is detached from the heap before its callback runs. A callback
//! therefore never observes its own entry, and the heap is consistent
//! again by the time user code executes.
//!
//! The heap is single-owner (`&mut self` everywhere): the dispatcher
//! thread holds it and nothing else touches it.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Invoked when a deadline fires (or on `remove(key, true)`)
pub type TimeoutCallback = Box<dyn FnMut() + Send>;

struct TimerNode<K> {
    key: K,
    expires: Instant,
    callback: TimeoutCallback,
}

/// Min-heap keyed by `K`, ordered by expiry
pub struct TimerHeap<K> {
    heap: Vec<TimerNode<K>>,
    slots: HashMap<K, usize>,
}

impl<K> TimerHeap<K>
where
    K: Copy + Eq + Hash,
{
    pub fn new() -> Self {
        Self::with_capacity(64)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            heap: Vec::with_capacity(capacity),
            slots: HashMap::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn contains(&self, key: K) -> bool {
        self.slots.contains_key(&key)
    }

    /// Expiry currently registered for `key`
    pub fn expiry(&self, key: K) -> Option<Instant> {
        self.slots.get(&key).map(|&i| self.heap[i].expires)
    }

    /// Earliest entry without sweeping
    pub fn peek(&self) -> Option<(K, Instant)> {
        self.heap.first().map(|n| (n.key, n.expires))
    }

    /// Schedule `callback` to fire `timeout` from now.
    ///
    /// An existing entry for `key` gets the new expiry and callback.
    pub fn add<F>(&mut self, key: K, timeout: Duration, callback: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.add_at(key, Instant::now() + timeout, callback);
    }

    /// Same as `add` with an absolute expiry
    pub fn add_at<F>(&mut self, key: K, expires: Instant, callback: F)
    where
        F: FnMut() + Send + 'static,
    {
        match self.slots.get(&key).copied() {
            Some(i) => {
                self.heap[i].expires = expires;
                self.heap[i].callback = Box::new(callback);
                self.restore(i);
            }
            None => {
                let i = self.heap.len();
                self.heap.push(TimerNode {
                    key,
                    expires,
                    callback: Box::new(callback),
                });
                self.slots.insert(key, i);
                self.sift_up(i);
            }
        }
    }

    /// Move `key`'s expiry to `timeout` from now, keeping its callback.
    ///
    /// Returns false if `key` has no entry.
    pub fn update(&mut self, key: K, timeout: Duration) -> bool {
        self.update_at(key, Instant::now() + timeout)
    }

    pub fn update_at(&mut self, key: K, expires: Instant) -> bool {
        match self.slots.get(&key).copied() {
            Some(i) => {
                self.heap[i].expires = expires;
                self.restore(i);
                true
            }
            None => false,
        }
    }

    /// Drop `key`'s entry, optionally running its callback first.
    ///
    /// Removing a missing key is a no-op returning false.
    pub fn remove(&mut self, key: K, run_callback: bool) -> bool {
        let Some(i) = self.slots.get(&key).copied() else {
            return false;
        };
        match self.take(i) {
            Some(mut node) => {
                if run_callback {
                    (node.callback)();
                }
                true
            }
            None => false,
        }
    }

    /// Fire and remove every entry with `expires <= now`, earliest first.
    ///
    /// Returns the number of callbacks run.
    pub fn expire_sweep(&mut self, now: Instant) -> usize {
        let mut fired = 0;
        while self.heap.first().is_some_and(|n| n.expires <= now) {
            let Some(mut node) = self.take(0) else { break };
            (node.callback)();
            fired += 1;
        }
        fired
    }

    /// Sweep, then report how long until the next entry fires.
    ///
    /// `None` means the heap is empty (wait indefinitely).
    pub fn next_deadline(&mut self) -> Option<Duration> {
        self.next_deadline_at(Instant::now())
    }

    pub fn next_deadline_at(&mut self, now: Instant) -> Option<Duration> {
        self.expire_sweep(now);
        self.heap
            .first()
            .map(|n| n.expires.saturating_duration_since(now))
    }

    /// Drop every entry without running callbacks
    pub fn clear(&mut self) {
        self.heap.clear();
        self.slots.clear();
    }

    /// Detach slot `i`, keeping the heap and index consistent
    fn take(&mut self, i: usize) -> Option<TimerNode<K>> {
        let last = self.heap.len().checked_sub(1)?;
        if i != last {
            self.swap(i, last);
        }
        let node = self.heap.pop()?;
        self.slots.remove(&node.key);
        if i < self.heap.len() {
            self.restore(i);
        }
        Some(node)
    }

    fn restore(&mut self, i: usize) {
        if !self.sift_down(i) {
            self.sift_up(i);
        }
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.heap[parent].expires <= self.heap[i].expires {
                break;
            }
            self.swap(i, parent);
            i = parent;
        }
    }

    /// Returns true if the node moved
    fn sift_down(&mut self, start: usize) -> bool {
        let n = self.heap.len();
        let mut i = start;
        loop {
            let left = 2 * i + 1;
            if left >= n {
                break;
            }
            let mut child = left;
            if left + 1 < n && self.heap[left + 1].expires < self.heap[left].expires {
                child = left + 1;
            }
            if self.heap[i].expires <= self.heap[child].expires {
                break;
            }
            self.swap(i, child);
            i = child;
        }
        i > start
    }

    fn swap(&mut self, i: usize, j: usize) {
        self.heap.swap(i, j);
        self.slots.insert(self.heap[i].key, i);
        self.slots.insert(self.heap[j].key, j);
    }

    #[cfg(test)]
    fn assert_consistent(&self) {
        assert_eq!(self.heap.len(), self.slots.len());
        for (i, node) in self.heap.iter().enumerate() {
            assert_eq!(self.slots.get(&node.key), Some(&i));
            if i > 0 {
                assert!(self.heap[(i - 1) / 2].expires <= node.expires);
            }
        }
    }
}

impl<K> Default for TimerHeap<K>
where
    K: Copy + Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> fmt::Debug for TimerHeap<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHeap")
            .field("len", &self.heap.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recorder() -> Arc<Mutex<Vec<i32>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn push_on_fire(log: &Arc<Mutex<Vec<i32>>>, key: i32) -> impl FnMut() + Send + 'static {
        let log = log.clone();
        move || log.lock().unwrap().push(key)
    }

    #[test]
    fn test_sweep_fires_in_expiry_order() {
        let base = Instant::now();
        let fired = recorder();
        let mut heap = TimerHeap::new();

        heap.add_at(3, base + Duration::from_millis(30), push_on_fire(&fired, 3));
        heap.add_at(1, base + Duration::from_millis(10), push_on_fire(&fired, 1));
        heap.add_at(2, base + Duration::from_millis(20), push_on_fire(&fired, 2));
        heap.add_at(4, base + Duration::from_millis(40), push_on_fire(&fired, 4));
        heap.assert_consistent();

        let n = heap.expire_sweep(base + Duration::from_millis(25));
        assert_eq!(n, 2);
        assert_eq!(*fired.lock().unwrap(), vec![1, 2]);
        assert_eq!(heap.len(), 2);
        assert!(!heap.contains(1));
        assert!(heap.contains(3));
        heap.assert_consistent();
    }

    #[test]
    fn test_next_deadline() {
        let base = Instant::now();
        let mut heap: TimerHeap<i32> = TimerHeap::new();
        assert_eq!(heap.next_deadline_at(base), None);

        heap.add_at(7, base + Duration::from_millis(50), || {});
        heap.add_at(8, base + Duration::from_millis(5), || {});
        assert_eq!(
            heap.next_deadline_at(base),
            Some(Duration::from_millis(5))
        );

        // sweeping inside next_deadline drops key 8
        assert_eq!(
            heap.next_deadline_at(base + Duration::from_millis(10)),
            Some(Duration::from_millis(40))
        );
        assert!(!heap.contains(8));
        assert_eq!(heap.next_deadline_at(base + Duration::from_millis(60)), None);
        assert!(heap.is_empty());
    }

    #[test]
    fn test_update_moves_entry() {
        let base = Instant::now();
        let fired = recorder();
        let mut heap = TimerHeap::new();

        heap.add_at(1, base + Duration::from_millis(10), push_on_fire(&fired, 1));
        heap.add_at(2, base + Duration::from_millis(20), push_on_fire(&fired, 2));

        assert!(heap.update_at(1, base + Duration::from_millis(100)));
        assert_eq!(heap.peek().map(|(k, _)| k), Some(2));
        heap.assert_consistent();

        heap.expire_sweep(base + Duration::from_millis(50));
        assert_eq!(*fired.lock().unwrap(), vec![2]);
        assert_eq!(heap.expiry(1), Some(base + Duration::from_millis(100)));

        assert!(!heap.update_at(42, base));
    }

    #[test]
    fn test_add_existing_key_replaces() {
        let base = Instant::now();
        let fired = recorder();
        let mut heap = TimerHeap::new();

        heap.add_at(5, base + Duration::from_millis(10), push_on_fire(&fired, 50));
        heap.add_at(5, base + Duration::from_millis(30), push_on_fire(&fired, 51));
        assert_eq!(heap.len(), 1);

        heap.expire_sweep(base + Duration::from_millis(20));
        assert!(fired.lock().unwrap().is_empty());
        heap.expire_sweep(base + Duration::from_millis(30));
        assert_eq!(*fired.lock().unwrap(), vec![51]);
    }

    #[test]
    fn test_remove_with_and_without_callback() {
        let base = Instant::now();
        let fired = recorder();
        let mut heap = TimerHeap::new();

        heap.add_at(1, base + Duration::from_secs(1), push_on_fire(&fired, 1));
        heap.add_at(2, base + Duration::from_secs(2), push_on_fire(&fired, 2));

        assert!(heap.remove(1, false));
        assert!(heap.remove(2, true));
        assert_eq!(*fired.lock().unwrap(), vec![2]);

        // idempotent
        assert!(!heap.remove(1, true));
        assert!(!heap.remove(2, false));
        assert!(heap.is_empty());
    }

    #[test]
    fn test_remove_from_middle_keeps_order() {
        let base = Instant::now();
        let mut heap = TimerHeap::new();
        for k in 0..32 {
            heap.add_at(k, base + Duration::from_millis(((k * 37) % 32) as u64), || {});
        }
        for k in (0..32).step_by(3) {
            assert!(heap.remove(k, false));
            heap.assert_consistent();
        }

        let mut last = base;
        while let Some((k, at)) = heap.peek() {
            assert!(at >= last);
            last = at;
            heap.remove(k, false);
        }
    }

    #[test]
    fn test_callback_can_mutate_shared_state_during_sweep() {
        // Callbacks that feed into a list the owner drains later are how
        // the dispatcher turns an expiry into a close.
        let base = Instant::now();
        let evicted = recorder();
        let mut heap = TimerHeap::new();
        for k in 0..10 {
            heap.add_at(k, base + Duration::from_millis(k as u64), push_on_fire(&evicted, k));
        }
        heap.expire_sweep(base + Duration::from_millis(100));
        assert_eq!(*evicted.lock().unwrap(), (0..10).collect::<Vec<_>>());
        assert!(heap.is_empty());
        assert_eq!(heap.expire_sweep(base + Duration::from_millis(200)), 0);
    }

    #[test]
    fn test_random_operations_stay_consistent() {
        // Small LCG so the sequence is deterministic
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        let mut next = move || {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (seed >> 33) as u32
        };

        let base = Instant::now();
        let mut heap = TimerHeap::new();
        let mut live: HashMap<i32, Instant> = HashMap::new();

        for _ in 0..2000 {
            let key = (next() % 64) as i32;
            let at = base + Duration::from_millis((next() % 10_000) as u64);
            match next() % 4 {
                0 | 1 => {
                    heap.add_at(key, at, || {});
                    live.insert(key, at);
                }
                2 => {
                    let present = live.remove(&key).is_some();
                    assert_eq!(heap.remove(key, false), present);
                }
                _ => {
                    let present = live.contains_key(&key);
                    assert_eq!(heap.update_at(key, at), present);
                    if present {
                        live.insert(key, at);
                    }
                }
            }
            heap.assert_consistent();
            assert_eq!(heap.len(), live.len());
            let min = live.values().min().copied();
            assert_eq!(heap.peek().map(|(_, at)| at), min);
        }
    }
}
