use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::domain::{Outcome, TaskId, TaskValue};
use crate::error::EngineError;
use crate::store::ResultStore;

/// Handle to a submitted task.
///
/// Cheap to clone; every clone reads the same result store entry.
pub struct TaskHandle<T> {
    id: TaskId,
    store: Arc<ResultStore<T>>,
}

impl<T> Clone for TaskHandle<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            store: Arc::clone(&self.store),
        }
    }
}

impl<T> std::fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle").field("id", &self.id).finish()
    }
}

impl<T: TaskValue> TaskHandle<T> {
    pub(crate) fn new(id: TaskId, store: Arc<ResultStore<T>>) -> Self {
        Self { id, store }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Current outcome without blocking. `None` once evicted.
    pub fn try_outcome(&self) -> Option<Outcome<T>> {
        self.store.get(self.id)
    }

    /// Block the current thread until the task is terminal.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<Outcome<T>, EngineError> {
        self.store.wait(self.id, timeout)
    }

    /// Register a completion callback. Fires immediately if already complete.
    pub fn on_complete<F>(&self, callback: F) -> Result<(), EngineError>
    where
        F: FnOnce(TaskId, &Outcome<T>) + Send + 'static,
    {
        self.store.register_callback(self.id, Box::new(callback))
    }

    /// Wait for the terminal outcome from async code.
    ///
    /// Bridges the store's completion callback into a oneshot channel, so no
    /// runtime thread is blocked while waiting.
    pub async fn outcome(&self) -> Result<Outcome<T>, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.store.register_callback(
            self.id,
            Box::new(move |_, outcome: &Outcome<T>| {
                // receiver may be gone if the caller stopped waiting
                let _ = tx.send(outcome.clone());
            }),
        )?;
        rx.await.map_err(|_| EngineError::UnknownTask(self.id))
    }
}
