//! Worker pool: the engine's public surface.
//!
//! Lifecycle: `Idle -> Running -> Stopped`. `start` and `stop` are idempotent;
//! a stopped pool stays stopped.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::domain::{CompletionCallback, Outcome, Priority, Task, TaskBody, TaskId, TaskValue};
use crate::error::{EngineError, TaskFailure};
use crate::handle::TaskHandle;
use crate::observability::EngineCounts;
use crate::ports::{Clock, SystemClock};
use crate::queue::TaskQueue;
use crate::store::ResultStore;
use crate::worker::{Shared, WorkerGroup};

/// Per-submission options.
pub struct SubmitOptions<T> {
    priority: Priority,
    on_complete: Option<CompletionCallback<T>>,
}

impl<T> SubmitOptions<T> {
    pub fn new() -> Self {
        Self {
            priority: Priority::NORMAL,
            on_complete: None,
        }
    }

    /// Ignored by FIFO queues.
    pub fn priority(mut self, priority: impl Into<Priority>) -> Self {
        self.priority = priority.into();
        self
    }

    /// Called exactly once with the terminal outcome, normally on the worker
    /// thread that produced it.
    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(TaskId, &Outcome<T>) + Send + 'static,
    {
        self.on_complete = Some(Box::new(callback));
        self
    }
}

impl<T> Default for SubmitOptions<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// An id handed out ahead of its task.
///
/// Consumed by [`WorkerPool::submit_reserved`]. Dropping it unused records
/// the id as cancelled so nobody waits on it forever.
pub struct Reservation<T: TaskValue> {
    id: TaskId,
    store: Arc<ResultStore<T>>,
    armed: bool,
}

impl<T: TaskValue> Reservation<T> {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn handle(&self) -> TaskHandle<T> {
        TaskHandle::new(self.id, Arc::clone(&self.store))
    }
}

impl<T: TaskValue> Drop for Reservation<T> {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.store.put(
                self.id,
                Err(TaskFailure::cancelled("reservation dropped before submission")),
            );
        }
    }
}

enum Lifecycle {
    Idle,
    Running(WorkerGroup),
    Stopped,
}

pub struct WorkerPool<T: TaskValue> {
    shared: Arc<Shared<T>>,
    thread_name: String,
    next_id: AtomicU64,
    worker_count: AtomicUsize,
    lifecycle: Mutex<Lifecycle>,
}

impl<T: TaskValue> WorkerPool<T> {
    /// Create an idle pool. Tasks may be submitted before `start`; they wait
    /// in the queue.
    pub fn new(config: EngineConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: EngineConfig, clock: Arc<dyn Clock>) -> Self {
        let shared = Shared {
            queue: TaskQueue::new(config.queue_mode),
            store: Arc::new(ResultStore::new()),
            clock,
            running: AtomicBool::new(false),
            inflight: AtomicUsize::new(0),
            dequeue_timeout: config.dequeue_timeout,
        };
        Self {
            shared: Arc::new(shared),
            thread_name: config.thread_name,
            next_id: AtomicU64::new(1),
            worker_count: AtomicUsize::new(0),
            lifecycle: Mutex::new(Lifecycle::Idle),
        }
    }

    /// `new` followed by `start(config.worker_count)`.
    pub fn launch(config: EngineConfig) -> Result<Self, EngineError> {
        let worker_count = config.worker_count;
        let pool = Self::new(config);
        pool.start(worker_count)?;
        Ok(pool)
    }

    /// Spawn `worker_count` workers (at least one).
    ///
    /// No-op if the pool is already running or has been stopped.
    pub fn start(&self, worker_count: usize) -> Result<(), EngineError> {
        let mut lifecycle = self.lifecycle.lock();
        match *lifecycle {
            Lifecycle::Running(_) => {
                debug!("start ignored: pool already running");
                return Ok(());
            }
            Lifecycle::Stopped => {
                warn!("start ignored: pool already stopped");
                return Ok(());
            }
            Lifecycle::Idle => {}
        }

        let n = worker_count.max(1);
        self.shared.running.store(true, Ordering::Release);
        match WorkerGroup::spawn(n, &self.thread_name, Arc::clone(&self.shared)) {
            Ok(group) => {
                self.worker_count.store(group.len(), Ordering::Release);
                *lifecycle = Lifecycle::Running(group);
                info!(
                    workers = n,
                    mode = ?self.shared.queue.mode(),
                    queued = self.shared.queue.size(),
                    "worker pool started"
                );
                Ok(())
            }
            Err(err) => {
                *lifecycle = Lifecycle::Stopped;
                drop(lifecycle);
                self.cancel_queued("worker pool failed to start");
                Err(err)
            }
        }
    }

    /// Submit a body with default options.
    pub fn submit<F>(&self, body: F) -> Result<TaskHandle<T>, EngineError>
    where
        F: FnOnce() -> Result<T, TaskFailure> + Send + 'static,
    {
        self.submit_with(body, SubmitOptions::new())
    }

    /// Submit a body. Returns as soon as the task is queued.
    ///
    /// Fails with `QueueClosed` after `stop`; the id drawn for the rejected
    /// task is not reused and its callback is dropped unfired.
    pub fn submit_with<F>(
        &self,
        body: F,
        options: SubmitOptions<T>,
    ) -> Result<TaskHandle<T>, EngineError>
    where
        F: FnOnce() -> Result<T, TaskFailure> + Send + 'static,
    {
        let id = self.allocate_id();
        self.shared.store.register(id);
        if let Err(err) = self.enqueue(id, Box::new(body), options, false) {
            self.shared.store.forget_pending(id);
            return Err(err);
        }
        Ok(TaskHandle::new(id, Arc::clone(&self.shared.store)))
    }

    /// Draw an id now and submit its task later.
    pub fn reserve(&self) -> Reservation<T> {
        let id = self.allocate_id();
        self.shared.store.register(id);
        Reservation {
            id,
            store: Arc::clone(&self.shared.store),
            armed: true,
        }
    }

    /// Submit the task for a reserved id.
    ///
    /// Treated as follow-up work: still accepted while a draining `stop` is in
    /// progress, refused with `QueueClosed` once the workers are gone. If it
    /// cannot be queued the id is recorded as cancelled.
    pub fn submit_reserved<F>(
        &self,
        mut reservation: Reservation<T>,
        body: F,
        options: SubmitOptions<T>,
    ) -> Result<TaskHandle<T>, EngineError>
    where
        F: FnOnce() -> Result<T, TaskFailure> + Send + 'static,
    {
        reservation.armed = false;
        let id = reservation.id;
        if let Err(err) = self.enqueue(id, Box::new(body), options, true) {
            let _ = self.shared.store.put(
                id,
                Err(TaskFailure::cancelled("queue closed before the task could run")),
            );
            return Err(err);
        }
        Ok(reservation.handle())
    }

    /// Outcome of `id`, waiting up to `timeout` (`None`: no limit).
    pub fn get_result(
        &self,
        id: TaskId,
        timeout: Option<Duration>,
    ) -> Result<Outcome<T>, EngineError> {
        self.shared.store.wait(id, timeout)
    }

    /// Handle for an id submitted earlier, if still known to the store.
    pub fn handle(&self, id: TaskId) -> Option<TaskHandle<T>> {
        self.shared
            .store
            .get(id)
            .map(|_| TaskHandle::new(id, Arc::clone(&self.shared.store)))
    }

    /// Shut the pool down.
    ///
    /// - `drain = true`: close the queue, let workers finish everything queued
    ///   (including follow-up work), and join them. Anything queued after the
    ///   last worker left is recorded as cancelled. `inflight()` and `queued()`
    ///   are 0 on return.
    /// - `drain = false`: close the queue, record every still-queued task as
    ///   cancelled, and return without waiting for in-flight tasks.
    ///
    /// Calling it again is a no-op. Stopping a pool that never started cancels
    /// whatever was queued. A draining stop joins the workers, so it must not
    /// be called from a task body or a completion callback.
    pub fn stop(&self, drain: bool) {
        let previous = std::mem::replace(&mut *self.lifecycle.lock(), Lifecycle::Stopped);

        match previous {
            Lifecycle::Stopped => debug!("stop ignored: pool already stopped"),
            Lifecycle::Idle => {
                self.cancel_queued("pool stopped before it was started");
                self.shared.running.store(false, Ordering::Release);
                info!("worker pool stopped before start");
            }
            Lifecycle::Running(group) if drain => {
                info!(queued = self.shared.queue.size(), "draining worker pool");
                // close before clearing `running`: workers only leave once the queue is drained
                self.shared.queue.close();
                self.shared.running.store(false, Ordering::Release);
                group.join();

                // follow-ups that arrived after the last worker left
                let stranded = self.cancel_queued("no workers left to run it");
                if stranded > 0 {
                    warn!(stranded, "cancelled work queued after workers exited");
                }
                info!(inflight = self.inflight(), "worker pool drained and stopped");
            }
            Lifecycle::Running(group) => {
                let cancelled = self.cancel_queued("pool stopped without draining");
                self.shared.running.store(false, Ordering::Release);
                info!(
                    cancelled,
                    inflight = self.inflight(),
                    "worker pool stopped; in-flight tasks finish in the background"
                );
                drop(group);
            }
        }
    }

    /// Tasks currently executing.
    pub fn inflight(&self) -> usize {
        self.shared.inflight.load(Ordering::SeqCst)
    }

    /// Tasks waiting in the queue.
    pub fn queued(&self) -> usize {
        self.shared.queue.size()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Whether `submit` would currently be accepted.
    pub fn accepts_submissions(&self) -> bool {
        !self.shared.queue.is_closed()
    }

    /// Workers spawned by `start`; 0 before that.
    pub fn worker_count(&self) -> usize {
        self.worker_count.load(Ordering::Acquire)
    }

    pub fn store(&self) -> &Arc<ResultStore<T>> {
        &self.shared.store
    }

    pub fn counts(&self) -> EngineCounts {
        let store = self.shared.store.counts();
        EngineCounts {
            workers: self.worker_count(),
            queued: self.queued(),
            inflight: self.inflight(),
            pending: store.pending,
            succeeded: store.succeeded,
            failed: store.failed,
            callback_panics: self.shared.store.callback_panics(),
        }
    }

    fn allocate_id(&self) -> TaskId {
        TaskId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn enqueue(
        &self,
        id: TaskId,
        body: TaskBody<T>,
        options: SubmitOptions<T>,
        follow_up: bool,
    ) -> Result<(), EngineError> {
        if let Some(callback) = options.on_complete {
            self.shared.store.register_callback(id, callback)?;
        }
        let task = Task::new(id, body, options.priority, self.shared.clock.now());
        if follow_up {
            self.shared.queue.enqueue_follow_up(task)
        } else {
            self.shared.queue.enqueue(task)
        }
    }

    fn cancel_queued(&self, reason: &str) -> usize {
        let cancelled = self.shared.queue.cancel_pending();
        let n = cancelled.len();
        for task in cancelled {
            if let Err(err) = self.shared.store.put(task.id(), Err(TaskFailure::cancelled(reason))) {
                warn!(task_id = %task.id(), error = %err, "could not record cancellation");
            }
        }
        n
    }
}

impl<T: TaskValue> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        // Same as stop(false) minus the logging; workers are detached, not joined.
        for task in self.shared.queue.cancel_pending() {
            let _ = self
                .shared
                .store
                .put(task.id(), Err(TaskFailure::cancelled("pool dropped")));
        }
        self.shared.running.store(false, Ordering::Release);
    }
}
