//! Task queue: the ordered hand-off between submitters and workers.
//!
//! Design intent:
//! - One lock guards both the ordering structure and the closed flags, so
//!   insert, extract and close are linearizable relative to each other.
//! - Waiting dequeuers sleep on a condition variable; nobody polls.
//! - The queue never runs anything and never touches the result store.

mod pending;

use std::str::FromStr;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use self::pending::PendingTasks;
use crate::domain::Task;
use crate::error::{ConfigError, EngineError};

/// Ordering discipline of a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueMode {
    /// Strict insertion order across all producers.
    #[default]
    Fifo,
    /// Highest priority first, insertion order within equal priority.
    Priority,
}

impl FromStr for QueueMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fifo" | "" => Ok(QueueMode::Fifo),
            "priority" => Ok(QueueMode::Priority),
            other => Err(ConfigError::Invalid {
                key: "queue_mode",
                value: other.to_string(),
                reason: "expected 'fifo' or 'priority'".to_string(),
            }),
        }
    }
}

/// Result of [`TaskQueue::dequeue`].
#[derive(Debug)]
pub enum Dequeue<T> {
    Task(Task<T>),
    /// Nothing arrived within the timeout. Callers loop and re-check liveness.
    Empty,
    /// Closed and fully drained. Terminal.
    Closed,
}

struct QueueState<T> {
    pending: PendingTasks<T>,
    /// No new submissions.
    closed: bool,
    /// Pending work was discarded; follow-ups are refused as well.
    cancelled: bool,
}

pub struct TaskQueue<T> {
    mode: QueueMode,
    state: Mutex<QueueState<T>>,
    available: Condvar,
}

impl<T> TaskQueue<T> {
    pub fn new(mode: QueueMode) -> Self {
        Self {
            mode,
            state: Mutex::new(QueueState {
                pending: PendingTasks::new(mode),
                closed: false,
                cancelled: false,
            }),
            available: Condvar::new(),
        }
    }

    pub fn mode(&self) -> QueueMode {
        self.mode
    }

    /// Add a task. Fails with `QueueClosed` once [`close`](Self::close) ran.
    pub fn enqueue(&self, task: Task<T>) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(EngineError::QueueClosed);
        }
        state.pending.push(task);
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    /// Add work spawned by work that is already running.
    ///
    /// Accepted after `close()` so a draining shutdown still runs it; refused
    /// after [`cancel_pending`](Self::cancel_pending).
    pub fn enqueue_follow_up(&self, task: Task<T>) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        if state.cancelled {
            return Err(EngineError::QueueClosed);
        }
        state.pending.push(task);
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    /// Take the next task, waiting up to `timeout` for one to arrive.
    pub fn dequeue(&self, timeout: Duration) -> Dequeue<T> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state.lock();
        loop {
            if let Some(task) = state.pending.pop() {
                return Dequeue::Task(task);
            }
            if state.closed {
                return Dequeue::Closed;
            }
            let timed_out = match deadline {
                Some(deadline) => self.available.wait_until(&mut state, deadline).timed_out(),
                None => {
                    self.available.wait(&mut state);
                    false
                }
            };
            if timed_out {
                return match state.pending.pop() {
                    Some(task) => Dequeue::Task(task),
                    None if state.closed => Dequeue::Closed,
                    None => Dequeue::Empty,
                };
            }
        }
    }

    /// Number of tasks waiting.
    pub fn size(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Closed with nothing left to hand out.
    pub fn is_drained(&self) -> bool {
        let state = self.state.lock();
        state.closed && state.pending.len() == 0
    }

    /// Stop accepting submissions and wake every blocked dequeuer.
    /// Tasks already queued are still handed out. Idempotent.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        drop(state);
        self.available.notify_all();
    }

    /// Close, refuse follow-ups, and hand back everything still queued.
    pub fn cancel_pending(&self) -> Vec<Task<T>> {
        let mut state = self.state.lock();
        state.closed = true;
        state.cancelled = true;
        let drained = state.pending.drain_ordered();
        drop(state);
        self.available.notify_all();
        drained
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use chrono::Utc;
    use rstest::rstest;

    use super::*;
    use crate::domain::{Priority, TaskId};

    fn task(id: u64, priority: i32) -> Task<u64> {
        Task::new(
            TaskId::new(id),
            Box::new(move || Ok(id)),
            Priority(priority),
            Utc::now(),
        )
    }

    fn drain_ids(queue: &TaskQueue<u64>) -> Vec<u64> {
        let mut ids = Vec::new();
        while let Dequeue::Task(t) = queue.dequeue(Duration::ZERO) {
            ids.push(t.id().get());
        }
        ids
    }

    #[test]
    fn fifo_preserves_insertion_order() {
        let queue = TaskQueue::new(QueueMode::Fifo);
        queue.enqueue(task(1, 0)).unwrap();
        queue.enqueue(task(2, 9)).unwrap();
        queue.enqueue(task(3, 0)).unwrap();

        assert_eq!(drain_ids(&queue), vec![1, 2, 3]);
    }

    #[test]
    fn priority_serves_highest_first() {
        let queue = TaskQueue::new(QueueMode::Priority);
        queue.enqueue(task(1, 1)).unwrap();
        queue.enqueue(task(2, 5)).unwrap();
        queue.enqueue(task(3, 3)).unwrap();

        assert_eq!(drain_ids(&queue), vec![2, 3, 1]);
    }

    #[test]
    fn priority_ties_keep_insertion_order() {
        let queue = TaskQueue::new(QueueMode::Priority);
        for id in 1..=5 {
            queue.enqueue(task(id, 2)).unwrap();
        }
        queue.enqueue(task(6, 7)).unwrap();

        assert_eq!(drain_ids(&queue), vec![6, 1, 2, 3, 4, 5]);
    }

    #[rstest]
    #[case(QueueMode::Fifo)]
    #[case(QueueMode::Priority)]
    fn dequeue_times_out_with_empty(#[case] mode: QueueMode) {
        let queue: TaskQueue<u64> = TaskQueue::new(mode);
        let start = Instant::now();
        let got = queue.dequeue(Duration::from_millis(50));
        assert!(matches!(got, Dequeue::Empty));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[rstest]
    #[case(QueueMode::Fifo)]
    #[case(QueueMode::Priority)]
    fn close_wakes_blocked_dequeuers(#[case] mode: QueueMode) {
        let queue: Arc<TaskQueue<u64>> = Arc::new(TaskQueue::new(mode));

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let q = Arc::clone(&queue);
                thread::spawn(move || q.dequeue(Duration::from_secs(10)))
            })
            .collect();

        thread::sleep(Duration::from_millis(50));
        let start = Instant::now();
        queue.close();

        for w in waiters {
            assert!(matches!(w.join().unwrap(), Dequeue::Closed));
        }
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn close_drains_remaining_then_reports_closed() {
        let queue = TaskQueue::new(QueueMode::Fifo);
        queue.enqueue(task(1, 0)).unwrap();
        queue.enqueue(task(2, 0)).unwrap();
        queue.close();
        queue.close();

        assert!(matches!(queue.enqueue(task(3, 0)), Err(EngineError::QueueClosed)));
        assert_eq!(drain_ids(&queue), vec![1, 2]);
        assert!(matches!(queue.dequeue(Duration::ZERO), Dequeue::Closed));
    }

    #[test]
    fn drained_means_closed_and_empty() {
        let queue = TaskQueue::new(QueueMode::Fifo);
        assert!(!queue.is_drained());
        queue.enqueue(task(1, 0)).unwrap();
        queue.close();
        assert!(!queue.is_drained());
        assert_eq!(drain_ids(&queue), vec![1]);
        assert!(queue.is_drained());
    }

    #[test]
    fn follow_ups_pass_close_but_not_cancel() {
        let queue = TaskQueue::new(QueueMode::Fifo);
        queue.close();
        queue.enqueue_follow_up(task(1, 0)).unwrap();
        assert_eq!(queue.size(), 1);

        let cancelled = queue.cancel_pending();
        assert_eq!(cancelled.len(), 1);
        assert!(matches!(
            queue.enqueue_follow_up(task(2, 0)),
            Err(EngineError::QueueClosed)
        ));
        assert!(matches!(queue.dequeue(Duration::ZERO), Dequeue::Closed));
    }

    #[test]
    fn cancel_pending_returns_tasks_in_dequeue_order() {
        let queue = TaskQueue::new(QueueMode::Priority);
        queue.enqueue(task(1, 1)).unwrap();
        queue.enqueue(task(2, 5)).unwrap();
        queue.enqueue(task(3, 3)).unwrap();

        let ids: Vec<u64> = queue.cancel_pending().iter().map(|t| t.id().get()).collect();
        assert_eq!(ids, vec![2, 3, 1]);
        assert!(queue.is_closed());
    }

    #[test]
    fn concurrent_producers_lose_nothing() {
        let queue: Arc<TaskQueue<u64>> = Arc::new(TaskQueue::new(QueueMode::Priority));
        let producers: Vec<_> = (0..4u64)
            .map(|p| {
                let q = Arc::clone(&queue);
                thread::spawn(move || {
                    for i in 0..250u64 {
                        q.enqueue(task(p * 1000 + i, (i % 7) as i32)).unwrap();
                    }
                })
            })
            .collect();
        for p in producers {
            p.join().unwrap();
        }

        let mut ids = drain_ids(&queue);
        assert_eq!(ids.len(), 1000);
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn queue_mode_parses_from_str() {
        assert_eq!("FIFO".parse::<QueueMode>().unwrap(), QueueMode::Fifo);
        assert_eq!(" priority ".parse::<QueueMode>().unwrap(), QueueMode::Priority);
        assert!("lifo".parse::<QueueMode>().is_err());
    }
}
