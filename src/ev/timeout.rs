//! The timeout min-heap.
use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::fiber::FiberHandle;

/// `(when, fiber, curr_fiber_or_null, sched_id, is_error)`. `curr_fiber`
/// set means this is a **deadline** entry (cancel `fiber` iff `curr_fiber`
/// is unfinished); unset means a plain **timeout** (cancel-or-resume
/// `fiber` iff its `sched_id` still matches).
#[derive(Clone)]
pub struct TimeoutEntry {
    pub when: u64,
    pub fiber: FiberHandle,
    pub curr_fiber: Option<FiberHandle>,
    pub sched_id: u64,
    pub is_error: bool,
}

impl TimeoutEntry {
    pub fn is_deadline(&self) -> bool {
        self.curr_fiber.is_some()
    }
}

impl PartialEq for TimeoutEntry {
    fn eq(&self, other: &Self) -> bool {
        self.when == other.when
    }
}
impl Eq for TimeoutEntry {}

impl PartialOrd for TimeoutEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Reversed so [`BinaryHeap`] (a max-heap) behaves as the min-heap the
/// spec calls for, keyed by `when`.
impl Ord for TimeoutEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other.when.cmp(&self.when)
    }
}

#[derive(Default)]
pub struct TimeoutHeap {
    heap: BinaryHeap<TimeoutEntry>,
}

impl TimeoutHeap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: TimeoutEntry) {
        self.heap.push(entry);
    }

    pub fn peek_when(&self) -> Option<u64> {
        self.heap.peek().map(|e| e.when)
    }

    pub fn pop(&mut self) -> Option<TimeoutEntry> {
        self.heap.pop()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::FiberBuilder;
    use crate::error::SignalResult;

    fn fiber() -> FiberHandle {
        FiberBuilder::new().spawn(|_f, v| SignalResult::ok(v))
    }

    #[test]
    fn pops_in_nondecreasing_when_order() {
        let mut heap = TimeoutHeap::new();
        heap.push(TimeoutEntry { when: 30, fiber: fiber(), curr_fiber: None, sched_id: 0, is_error: true });
        heap.push(TimeoutEntry { when: 10, fiber: fiber(), curr_fiber: None, sched_id: 0, is_error: true });
        heap.push(TimeoutEntry { when: 20, fiber: fiber(), curr_fiber: None, sched_id: 0, is_error: true });
        assert_eq!(heap.pop().unwrap().when, 10);
        assert_eq!(heap.pop().unwrap().when, 20);
        assert_eq!(heap.pop().unwrap().when, 30);
        assert!(heap.is_empty());
    }
}
