//! Bounded FIFO of finished runs.
use super::run::{ExecutionResult, RunHandle};
use std::collections::VecDeque;

#[derive(Debug)]
pub struct ResultHistory {
    capacity: usize,
    entries: VecDeque<ExecutionResult>,
}

impl ResultHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    /// Appends a result, returning the evicted oldest entry when full.
    pub fn push(&mut self, result: ExecutionResult) -> Option<ExecutionResult> {
        let evicted = if self.entries.len() >= self.capacity {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(result);
        evicted
    }

    pub fn get(&self, run: RunHandle) -> Option<&ExecutionResult> {
        self.entries.iter().find(|r| r.run == run)
    }

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &ExecutionResult> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
