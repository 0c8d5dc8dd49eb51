use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, info_span, warn};

use crate::domain::{Task, TaskValue};
use crate::error::EngineError;
use crate::ports::Clock;
use crate::queue::{Dequeue, TaskQueue};
use crate::runtime;
use crate::store::ResultStore;

/// State shared by the pool and every worker.
///
/// Workers only read `running` and only touch `inflight` through atomic
/// increments around a task; everything else goes through the queue and the
/// store.
pub(crate) struct Shared<T> {
    pub(crate) queue: TaskQueue<T>,
    pub(crate) store: Arc<ResultStore<T>>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) running: AtomicBool,
    pub(crate) inflight: AtomicUsize,
    pub(crate) dequeue_timeout: Duration,
}

/// Worker group handle.
/// - dropping it detaches the threads; they exit once the queue reports `Closed`
/// - `join()` waits for all of them
pub(crate) struct WorkerGroup {
    joins: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    /// Spawn `n` workers named `<name>-<i>`.
    ///
    /// If a thread cannot be spawned, the ones already running are shut down
    /// and joined before the error is returned.
    pub(crate) fn spawn<T: TaskValue>(
        n: usize,
        name: &str,
        shared: Arc<Shared<T>>,
    ) -> Result<Self, EngineError> {
        let mut joins = Vec::with_capacity(n);
        for worker_id in 0..n {
            let worker_shared = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(format!("{name}-{worker_id}"))
                .spawn(move || worker_loop(worker_id, worker_shared));

            match spawned {
                Ok(join) => joins.push(join),
                Err(err) => {
                    error!(worker = worker_id, error = %err, "failed to spawn worker");
                    shared.running.store(false, Ordering::Release);
                    shared.queue.close();
                    WorkerGroup { joins }.join();
                    return Err(EngineError::Spawn(err));
                }
            }
        }
        Ok(Self { joins })
    }

    pub(crate) fn len(&self) -> usize {
        self.joins.len()
    }

    /// Wait for every worker to exit.
    pub(crate) fn join(self) {
        for join in self.joins {
            if join.join().is_err() {
                // worker_loop contains body and callback panics, so this is a bug in the loop itself
                error!("worker thread panicked");
            }
        }
    }
}

fn worker_loop<T: TaskValue>(worker_id: usize, shared: Arc<Shared<T>>) {
    info!(worker = worker_id, "worker started");
    loop {
        match shared.queue.dequeue(shared.dequeue_timeout) {
            Dequeue::Task(task) => run_task(worker_id, &shared, task),
            // a task enqueued just before close must still be picked up
            Dequeue::Empty => {
                if !shared.running.load(Ordering::Acquire) && shared.queue.is_drained() {
                    break;
                }
            }
            Dequeue::Closed => break,
        }
    }
    info!(worker = worker_id, "worker stopped");
}

fn run_task<T: TaskValue>(worker_id: usize, shared: &Shared<T>, task: Task<T>) {
    let id = task.id();
    let span = info_span!("task", task_id = %id, worker = worker_id, priority = task.priority().0);
    let _enter = span.enter();

    let queued_ms = (shared.clock.now() - task.submitted_at())
        .num_milliseconds()
        .max(0);

    shared.inflight.fetch_add(1, Ordering::SeqCst);
    debug!(queued_ms, "task started");

    let result = runtime::execute(task.into_body());
    match &result {
        Ok(_) => debug!("task succeeded"),
        Err(failure) => warn!(error = %failure, "task failed"),
    }

    // put() also runs completion callbacks, so follow-up work they enqueue is
    // visible before this task stops counting as in flight.
    if let Err(err) = shared.store.put(id, result) {
        error!(error = %err, "result store rejected outcome; single-writer invariant broken");
        debug_assert!(false, "{err}");
    }

    shared.inflight.fetch_sub(1, Ordering::SeqCst);
}
