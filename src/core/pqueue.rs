//! Deadline-ordered priority queue.
//!
//! A binary min-heap keyed on absolute wake-up time, with a side index from
//! [`EntryKey`] to heap slot so that an entry can be removed before it comes
//! due (a message finished or requeued ahead of its timeout) in O(log n).
//!
//! The queue is not synchronized; owners wrap it in their own lock and hold
//! it across any peek-then-pop sequence.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use tokio::time::Instant;

/// Handle identifying one pushed entry for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryKey(u64);

static NEXT_KEY: AtomicU64 = AtomicU64::new(1);

impl EntryKey {
    /// Allocates a process-unique key (lock-free).
    pub fn next() -> Self {
        EntryKey(NEXT_KEY.fetch_add(1, AtomicOrdering::Relaxed))
    }
}

#[derive(Debug, Clone)]
pub struct DeadlineEntry<T> {
    pub key: EntryKey,
    pub deadline: Instant,
    pub value: T,
}

impl<T> DeadlineEntry<T> {
    pub fn new(deadline: Instant, value: T) -> Self {
        Self {
            key: EntryKey::next(),
            deadline,
            value,
        }
    }

    #[inline]
    pub fn is_due(&self, now: Instant) -> bool {
        self.deadline <= now
    }

    // Keys grow monotonically, so equal deadlines pop in push order.
    #[inline]
    fn precedes(&self, other: &Self) -> bool {
        match self.deadline.cmp(&other.deadline) {
            Ordering::Less => true,
            Ordering::Greater => false,
            Ordering::Equal => self.key < other.key,
        }
    }
}

#[derive(Debug)]
pub struct DeadlineQueue<T> {
    heap: Vec<DeadlineEntry<T>>,
    index: HashMap<EntryKey, usize>,
}

impl<T> Default for DeadlineQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DeadlineQueue<T> {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            heap: Vec::with_capacity(capacity),
            index: HashMap::with_capacity(capacity),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn contains(&self, key: EntryKey) -> bool {
        self.index.contains_key(&key)
    }

    /// Inserts an entry, returning its key.
    pub fn push(&mut self, entry: DeadlineEntry<T>) -> EntryKey {
        let key = entry.key;
        debug_assert!(!self.index.contains_key(&key), "duplicate entry key");

        let pos = self.heap.len();
        self.index.insert(key, pos);
        self.heap.push(entry);
        self.sift_up(pos);
        key
    }

    /// Returns the entry with the earliest deadline without removing it.
    #[inline]
    pub fn peek(&self) -> Option<&DeadlineEntry<T>> {
        self.heap.first()
    }

    /// Removes and returns the entry with the earliest deadline.
    pub fn pop(&mut self) -> Option<DeadlineEntry<T>> {
        if self.heap.is_empty() {
            return None;
        }
        Some(self.remove_at(0))
    }

    /// Pops the earliest entry only if its deadline is at or before `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<DeadlineEntry<T>> {
        if self.peek()?.is_due(now) {
            self.pop()
        } else {
            None
        }
    }

    /// Removes the entry pushed under `key`. Returns `None` if it was already
    /// popped or removed.
    pub fn remove(&mut self, key: EntryKey) -> Option<DeadlineEntry<T>> {
        let pos = *self.index.get(&key)?;
        Some(self.remove_at(pos))
    }

    fn remove_at(&mut self, pos: usize) -> DeadlineEntry<T> {
        let last = self.heap.len() - 1;
        if pos != last {
            self.swap(pos, last);
        }

        let removed = self.heap.pop().expect("heap is non-empty");
        self.index.remove(&removed.key);

        if pos < self.heap.len() {
            // The entry moved into `pos` may belong above or below it.
            if !self.sift_down(pos) {
                self.sift_up(pos);
            }
        }
        removed
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        self.index.insert(self.heap[a].key, a);
        self.index.insert(self.heap[b].key, b);
    }

    fn sift_up(&mut self, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if !self.heap[pos].precedes(&self.heap[parent]) {
                break;
            }
            self.swap(pos, parent);
            pos = parent;
        }
    }

    /// Returns true if the entry at `pos` moved.
    fn sift_down(&mut self, mut pos: usize) -> bool {
        let start = pos;
        let len = self.heap.len();
        loop {
            let left = 2 * pos + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let child = if right < len && self.heap[right].precedes(&self.heap[left]) {
                right
            } else {
                left
            };
            if !self.heap[child].precedes(&self.heap[pos]) {
                break;
            }
            self.swap(pos, child);
            pos = child;
        }
        pos != start
    }
}
