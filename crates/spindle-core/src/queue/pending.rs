//! Storage for tasks waiting in the queue.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};

use super::QueueMode;
use crate::domain::{Priority, Task};

/// Heap entry for priority mode.
///
/// Higher priority wins; within the same priority the lower sequence number
/// (earlier insertion) wins, which keeps the heap stable.
pub(super) struct Ranked<T> {
    priority: Priority,
    seq: u64,
    task: Task<T>,
}

impl<T> PartialEq for Ranked<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl<T> Eq for Ranked<T> {}

impl<T> PartialOrd for Ranked<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Ranked<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

pub(super) enum PendingTasks<T> {
    Fifo(VecDeque<Task<T>>),
    Priority {
        heap: BinaryHeap<Ranked<T>>,
        next_seq: u64,
    },
}

impl<T> PendingTasks<T> {
    pub(super) fn new(mode: QueueMode) -> Self {
        match mode {
            QueueMode::Fifo => PendingTasks::Fifo(VecDeque::new()),
            QueueMode::Priority => PendingTasks::Priority {
                heap: BinaryHeap::new(),
                next_seq: 0,
            },
        }
    }

    pub(super) fn push(&mut self, task: Task<T>) {
        match self {
            PendingTasks::Fifo(ready) => ready.push_back(task),
            PendingTasks::Priority { heap, next_seq } => {
                let seq = *next_seq;
                *next_seq += 1;
                heap.push(Ranked {
                    priority: task.priority(),
                    seq,
                    task,
                });
            }
        }
    }

    pub(super) fn pop(&mut self) -> Option<Task<T>> {
        match self {
            PendingTasks::Fifo(ready) => ready.pop_front(),
            PendingTasks::Priority { heap, .. } => heap.pop().map(|ranked| ranked.task),
        }
    }

    pub(super) fn len(&self) -> usize {
        match self {
            PendingTasks::Fifo(ready) => ready.len(),
            PendingTasks::Priority { heap, .. } => heap.len(),
        }
    }

    /// Remove everything, in the order it would have been dequeued.
    pub(super) fn drain_ordered(&mut self) -> Vec<Task<T>> {
        let mut drained = Vec::with_capacity(self.len());
        while let Some(task) = self.pop() {
            drained.push(task);
        }
        drained
    }
}
