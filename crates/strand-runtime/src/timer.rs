//! Per-cord one-shot timer heap
//!
//! Binary min-heap ordered by deadline with lazy cancellation: cancelled
//! handles go into a set and are skipped when they surface. The heap is
//! cord-local, so no locking is needed.

use std::cell::RefCell;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashSet};
use std::rc::Weak;

use crate::fiber::Fiber;

/// Handle for cancelling a registered timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

struct TimerEntry {
    /// Deadline in cord-monotonic seconds
    deadline: f64,
    handle: TimerHandle,
    fiber: Weak<Fiber>,
}

/// Wrapper for heap ordering (min-heap by deadline)
struct HeapEntry(TimerEntry);

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.deadline == other.0.deadline && self.0.handle == other.0.handle
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reverse ordering for min-heap, tie-break by handle for
        // deterministic firing order
        match other.0.deadline.total_cmp(&self.0.deadline) {
            CmpOrdering::Equal => other.0.handle.0.cmp(&self.0.handle.0),
            ord => ord,
        }
    }
}

struct HeapInner {
    heap: BinaryHeap<HeapEntry>,
    cancelled: HashSet<TimerHandle>,
    next_handle: u64,
}

/// Cord-local timer heap
pub struct TimerHeap {
    inner: RefCell<HeapInner>,
}

impl TimerHeap {
    pub fn new() -> Self {
        Self {
            inner: RefCell::new(HeapInner {
                heap: BinaryHeap::new(),
                cancelled: HashSet::new(),
                next_handle: 1,
            }),
        }
    }

    /// Register a one-shot wakeup for `fiber` at `deadline`
    pub fn insert(&self, deadline: f64, fiber: Weak<Fiber>) -> TimerHandle {
        let mut inner = self.inner.borrow_mut();
        let handle = TimerHandle(inner.next_handle);
        inner.next_handle += 1;
        inner.heap.push(HeapEntry(TimerEntry {
            deadline,
            handle,
            fiber,
        }));
        handle
    }

    /// Lazily cancel a timer; returns false if already cancelled
    pub fn cancel(&self, handle: TimerHandle) -> bool {
        let mut inner = self.inner.borrow_mut();
        inner.cancelled.insert(handle)
    }

    /// Pop every timer whose deadline has passed
    ///
    /// Returns the fibers to wake, in deadline order. Cancelled and
    /// already-dropped entries are skipped.
    pub fn fire_expired(&self, now: f64) -> Vec<Weak<Fiber>> {
        let mut inner = self.inner.borrow_mut();
        let mut expired = Vec::new();

        while let Some(entry) = inner.heap.peek() {
            if entry.0.deadline > now {
                break;
            }
            let entry = inner.heap.pop().unwrap().0;
            if inner.cancelled.remove(&entry.handle) {
                continue;
            }
            expired.push(entry.fiber);
        }

        if inner.heap.is_empty() {
            inner.cancelled.clear();
        }

        expired
    }

    /// Earliest pending deadline, if any
    pub fn next_deadline(&self) -> Option<f64> {
        let inner = self.inner.borrow();
        inner.heap.peek().map(|e| e.0.deadline)
    }

    /// Number of entries still in the heap (cancelled included)
    pub fn len(&self) -> usize {
        let inner = self.inner.borrow();
        inner.heap.len().saturating_sub(inner.cancelled.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TimerHeap {
    fn default() -> Self {
        Self::new()
    }
}
