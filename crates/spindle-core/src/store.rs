//! Result store: task id -> outcome, with waiters and completion callbacks.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::domain::{CompletionCallback, Outcome, TaskId, TaskValue};
use crate::error::{EngineError, TaskFailure};
use crate::runtime::panic_message;

struct Slot<T> {
    outcome: Outcome<T>,
    /// Callbacks waiting for the terminal outcome. Always empty once terminal.
    callbacks: Vec<CompletionCallback<T>>,
}

impl<T> Slot<T> {
    fn pending() -> Self {
        Self {
            outcome: Outcome::Pending,
            callbacks: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreCounts {
    pub pending: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Thread-safe map of outcomes.
///
/// - One writer per id: the first terminal `put` wins, a second one is
///   reported as [`EngineError::DuplicatePut`].
/// - Waiters sleep on a shared condition variable woken by every `put`.
/// - Callbacks run outside the lock, after the outcome is visible to `get`.
pub struct ResultStore<T> {
    slots: Mutex<HashMap<TaskId, Slot<T>>>,
    completed: Condvar,
    callback_panics: AtomicU64,
}

impl<T: TaskValue> ResultStore<T> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            completed: Condvar::new(),
            callback_panics: AtomicU64::new(0),
        }
    }

    /// Track `id` as pending. No-op if it is already known.
    pub fn register(&self, id: TaskId) {
        self.slots.lock().entry(id).or_insert_with(Slot::pending);
    }

    /// Record the terminal outcome of `id` and fire its callbacks on the
    /// calling thread.
    ///
    /// Taking a `Result` keeps `Pending` from ever being written back.
    pub fn put(&self, id: TaskId, result: Result<T, TaskFailure>) -> Result<(), EngineError> {
        let (outcome, callbacks) = {
            let mut slots = self.slots.lock();
            let slot = slots.entry(id).or_insert_with(Slot::pending);
            if slot.outcome.is_terminal() {
                return Err(EngineError::DuplicatePut { id });
            }
            slot.outcome = Outcome::from(result);
            let callbacks = std::mem::take(&mut slot.callbacks);
            let outcome = if callbacks.is_empty() {
                None
            } else {
                Some(slot.outcome.clone())
            };
            (outcome, callbacks)
        };

        self.completed.notify_all();

        if let Some(outcome) = outcome {
            for callback in callbacks {
                self.invoke(callback, id, &outcome);
            }
        }
        Ok(())
    }

    /// Current outcome of `id`, or `None` if the id is unknown or evicted.
    pub fn get(&self, id: TaskId) -> Option<Outcome<T>> {
        self.slots.lock().get(&id).map(|slot| slot.outcome.clone())
    }

    /// Block until `id` is terminal. `None` waits without limit.
    pub fn wait(&self, id: TaskId, timeout: Option<Duration>) -> Result<Outcome<T>, EngineError> {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut slots = self.slots.lock();
        loop {
            match slots.get(&id) {
                None => return Err(EngineError::UnknownTask(id)),
                Some(slot) if slot.outcome.is_terminal() => return Ok(slot.outcome.clone()),
                Some(_) => {}
            }

            match deadline {
                Some(deadline) => {
                    if self.completed.wait_until(&mut slots, deadline).timed_out() {
                        return match slots.get(&id) {
                            Some(slot) if slot.outcome.is_terminal() => Ok(slot.outcome.clone()),
                            Some(_) => Err(EngineError::TimedOut {
                                id,
                                waited: timeout.unwrap_or_default(),
                            }),
                            None => Err(EngineError::UnknownTask(id)),
                        };
                    }
                }
                None => self.completed.wait(&mut slots),
            }
        }
    }

    /// Run `callback` once `id` is terminal.
    ///
    /// If the outcome is already recorded the callback runs right away on
    /// the caller's thread; otherwise it runs on the thread that records it.
    pub fn register_callback(
        &self,
        id: TaskId,
        callback: CompletionCallback<T>,
    ) -> Result<(), EngineError> {
        let outcome = {
            let mut slots = self.slots.lock();
            let Some(slot) = slots.get_mut(&id) else {
                return Err(EngineError::UnknownTask(id));
            };
            if !slot.outcome.is_terminal() {
                slot.callbacks.push(callback);
                return Ok(());
            }
            slot.outcome.clone()
        };
        self.invoke(callback, id, &outcome);
        Ok(())
    }

    /// Drop a terminal outcome. Pending ids are left alone.
    pub fn evict(&self, id: TaskId) -> Option<Outcome<T>> {
        let mut slots = self.slots.lock();
        if slots.get(&id)?.outcome.is_terminal() {
            slots.remove(&id).map(|slot| slot.outcome)
        } else {
            None
        }
    }

    /// Forget a pending id whose submission was rejected.
    pub(crate) fn forget_pending(&self, id: TaskId) {
        let mut slots = self.slots.lock();
        if slots.get(&id).is_some_and(|slot| !slot.outcome.is_terminal()) {
            slots.remove(&id);
        }
    }

    pub fn counts(&self) -> StoreCounts {
        let slots = self.slots.lock();
        let mut counts = StoreCounts::default();
        for slot in slots.values() {
            match slot.outcome {
                Outcome::Pending => counts.pending += 1,
                Outcome::Succeeded(_) => counts.succeeded += 1,
                Outcome::Failed(_) => counts.failed += 1,
            }
        }
        counts
    }

    /// Number of completion callbacks that panicked.
    pub fn callback_panics(&self) -> u64 {
        self.callback_panics.load(Ordering::Relaxed)
    }

    fn invoke(&self, callback: CompletionCallback<T>, id: TaskId, outcome: &Outcome<T>) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| callback(id, outcome))) {
            self.callback_panics.fetch_add(1, Ordering::Relaxed);
            error!(
                task_id = %id,
                panic = %panic_message(payload.as_ref()),
                "completion callback panicked"
            );
        }
    }
}

impl<T: TaskValue> Default for ResultStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, mpsc};
    use std::thread;

    use super::*;

    fn id(n: u64) -> TaskId {
        TaskId::new(n)
    }

    #[test]
    fn put_then_get() {
        let store = ResultStore::new();
        store.register(id(1));
        assert_eq!(store.get(id(1)), Some(Outcome::Pending));

        store.put(id(1), Ok(10u32)).unwrap();
        assert_eq!(store.get(id(1)), Some(Outcome::Succeeded(10)));
        assert_eq!(store.get(id(2)), None);
    }

    #[test]
    fn second_put_is_rejected_and_first_value_kept() {
        let store = ResultStore::new();
        store.register(id(1));
        store.put(id(1), Ok(1u32)).unwrap();

        let err = store.put(id(1), Err(TaskFailure::failed("late"))).unwrap_err();
        assert!(matches!(err, EngineError::DuplicatePut { id: dup } if dup == id(1)));
        assert_eq!(store.get(id(1)), Some(Outcome::Succeeded(1)));
    }

    #[test]
    fn wait_wakes_on_put_from_another_thread() {
        let store: Arc<ResultStore<&'static str>> = Arc::new(ResultStore::new());
        store.register(id(7));

        let writer = {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                store.put(id(7), Ok("done")).unwrap();
            })
        };

        let outcome = store.wait(id(7), Some(Duration::from_secs(5))).unwrap();
        assert_eq!(outcome, Outcome::Succeeded("done"));
        writer.join().unwrap();
    }

    #[test]
    fn wait_times_out_while_pending() {
        let store: ResultStore<u8> = ResultStore::new();
        store.register(id(1));

        let start = Instant::now();
        let err = store.wait(id(1), Some(Duration::from_millis(40))).unwrap_err();
        assert!(matches!(err, EngineError::TimedOut { .. }));
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn wait_on_unknown_id_fails_fast() {
        let store: ResultStore<u8> = ResultStore::new();
        let err = store.wait(id(99), None).unwrap_err();
        assert!(matches!(err, EngineError::UnknownTask(_)));
    }

    #[test]
    fn callback_registered_before_completion_fires_once_on_writer_thread() {
        let store: Arc<ResultStore<u32>> = Arc::new(ResultStore::new());
        store.register(id(1));

        let (tx, rx) = mpsc::channel();
        store
            .register_callback(
                id(1),
                Box::new(move |task_id, outcome| {
                    tx.send((task_id, outcome.clone(), thread::current().id())).unwrap();
                }),
            )
            .unwrap();

        let writer = {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                store.put(id(1), Ok(5)).unwrap();
                thread::current().id()
            })
        };
        let writer_thread = writer.join().unwrap();

        let (task_id, outcome, fired_on) = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(task_id, id(1));
        assert_eq!(outcome, Outcome::Succeeded(5));
        assert_eq!(fired_on, writer_thread);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn callback_registered_after_completion_fires_immediately() {
        let store: ResultStore<u32> = ResultStore::new();
        store.register(id(1));
        store.put(id(1), Ok(3)).unwrap();

        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        let caller = thread::current().id();
        store
            .register_callback(
                id(1),
                Box::new(move |_, outcome| {
                    *sink.lock() = Some((outcome.clone(), thread::current().id()));
                }),
            )
            .unwrap();

        assert_eq!(*seen.lock(), Some((Outcome::Succeeded(3), caller)));
    }

    #[test]
    fn callback_observes_recorded_outcome_through_get() {
        let store: Arc<ResultStore<u32>> = Arc::new(ResultStore::new());
        store.register(id(1));

        let seen = Arc::new(Mutex::new(None));
        let (sink, reader) = (Arc::clone(&seen), Arc::clone(&store));
        store
            .register_callback(
                id(1),
                Box::new(move |task_id, _| {
                    *sink.lock() = reader.get(task_id);
                }),
            )
            .unwrap();

        store.put(id(1), Ok(8)).unwrap();
        assert_eq!(*seen.lock(), Some(Outcome::Succeeded(8)));
    }

    #[test]
    fn panicking_callback_is_contained() {
        let store: ResultStore<u32> = ResultStore::new();
        store.register(id(1));

        let fired = Arc::new(AtomicUsize::new(0));
        store
            .register_callback(id(1), Box::new(|_, _| panic!("bad callback")))
            .unwrap();
        let counter = Arc::clone(&fired);
        store
            .register_callback(
                id(1),
                Box::new(move |_, _| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        store.put(id(1), Ok(1)).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(store.callback_panics(), 1);
    }

    #[test]
    fn evict_only_drops_terminal_outcomes() {
        let store: ResultStore<u32> = ResultStore::new();
        store.register(id(1));
        store.register(id(2));
        store.put(id(1), Ok(1)).unwrap();

        assert_eq!(store.evict(id(2)), None);
        assert_eq!(store.evict(id(1)), Some(Outcome::Succeeded(1)));
        assert_eq!(store.get(id(1)), None);
        assert_eq!(store.get(id(2)), Some(Outcome::Pending));
    }

    #[test]
    fn counts_by_state() {
        let store: ResultStore<u32> = ResultStore::new();
        for n in 1..=4 {
            store.register(id(n));
        }
        store.put(id(1), Ok(1)).unwrap();
        store.put(id(2), Err(TaskFailure::failed("x"))).unwrap();

        assert_eq!(
            store.counts(),
            StoreCounts {
                pending: 2,
                succeeded: 1,
                failed: 1
            }
        );
    }
}
