//! The scheduled-task queue: a FIFO ring buffer that grows by doubling and
//! wraps around. `VecDeque` already is a ring buffer with the same
//! amortized-doubling growth policy, so it is used directly rather than
//! hand-rolling one.
use std::collections::VecDeque;

use crate::error::Signal;
use crate::fiber::FiberHandle;
use crate::value::Value;

pub struct Task {
    pub fiber: FiberHandle,
    pub value: Value,
    pub signal: Signal,
}

#[derive(Default)]
pub struct TaskQueue {
    ring: VecDeque<Task>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, task: Task) {
        self.ring.push_back(task);
    }

    pub fn pop(&mut self) -> Option<Task> {
        self.ring.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }
}
