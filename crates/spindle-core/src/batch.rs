//! Batch orchestration: fan out one task per item, then fan in once.
//!
//! The aggregation task id is reserved before any item is submitted, so the
//! caller gets it back immediately. Every item's completion callback records
//! its result and bumps an atomic counter; the callback that brings the
//! counter to the item total is the only one that submits the aggregation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::domain::{BatchId, Outcome, TaskId, TaskValue};
use crate::error::{EngineError, TaskFailure};
use crate::handle::TaskHandle;
use crate::pool::{Reservation, SubmitOptions, WorkerPool};
use crate::ports::{IdGenerator, SystemClock, UlidGenerator};

type Aggregate<T> = Box<dyn FnOnce(BatchReport<T>) -> Result<T, TaskFailure> + Send + 'static>;

/// Result of one item, in submission order.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchItem<T> {
    pub index: usize,
    /// `None` if the item was never submitted.
    pub task_id: Option<TaskId>,
    pub result: Result<T, TaskFailure>,
}

/// Everything the aggregation sees.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchReport<T> {
    pub batch_id: BatchId,
    pub items: Vec<BatchItem<T>>,
}

impl<T> BatchReport<T> {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Values of the items that succeeded.
    pub fn successes(&self) -> impl Iterator<Item = &T> {
        self.items.iter().filter_map(|item| item.result.as_ref().ok())
    }

    /// Items that failed, were cancelled, or could not be submitted.
    pub fn failures(&self) -> impl Iterator<Item = &BatchItem<T>> {
        self.items.iter().filter(|item| item.result.is_err())
    }

    /// Task ids of the failed items that made it into the queue.
    pub fn failed_ids(&self) -> Vec<TaskId> {
        self.failures().filter_map(|item| item.task_id).collect()
    }
}

/// What `run_batch` hands back.
#[derive(Debug, Clone)]
pub struct BatchHandle<T> {
    pub batch_id: BatchId,
    /// The aggregation task.
    pub result: TaskHandle<T>,
    /// Ids of the item tasks that were submitted, in item order.
    pub item_ids: Vec<TaskId>,
}

pub struct BatchOrchestrator<T: TaskValue> {
    pool: Arc<WorkerPool<T>>,
    ids: Box<dyn IdGenerator>,
}

impl<T: TaskValue> BatchOrchestrator<T> {
    pub fn new(pool: Arc<WorkerPool<T>>) -> Self {
        Self {
            pool,
            ids: Box::new(UlidGenerator::new(SystemClock)),
        }
    }

    pub fn with_id_generator(mut self, ids: impl IdGenerator + 'static) -> Self {
        self.ids = Box::new(ids);
        self
    }

    pub fn pool(&self) -> &Arc<WorkerPool<T>> {
        &self.pool
    }

    /// Submit `item_body` once per item and `aggregate` once all of them are
    /// terminal, whether they succeeded or not.
    ///
    /// Fails with `QueueClosed` only if the pool was already stopped. Items
    /// rejected later (the pool stopped mid-batch) are reported to the
    /// aggregation as cancelled.
    pub fn run_batch<I, F, A>(
        &self,
        items: Vec<I>,
        item_body: F,
        aggregate: A,
    ) -> Result<BatchHandle<T>, EngineError>
    where
        I: Send + 'static,
        F: Fn(I) -> Result<T, TaskFailure> + Send + Sync + 'static,
        A: FnOnce(BatchReport<T>) -> Result<T, TaskFailure> + Send + 'static,
    {
        if !self.pool.accepts_submissions() {
            return Err(EngineError::QueueClosed);
        }

        let batch_id = self.ids.generate_batch_id();
        let reservation = self.pool.reserve();
        let result = reservation.handle();
        let total = items.len();

        let fan_in = Arc::new(FanIn {
            batch_id,
            total,
            completed: AtomicUsize::new(0),
            slots: Mutex::new((0..total).map(|_| None).collect()),
            finish: Mutex::new(Some(Finish {
                reservation,
                aggregate: Box::new(aggregate),
            })),
            pool: Arc::downgrade(&self.pool),
        });

        info!(%batch_id, items = total, aggregate_task = %result.id(), "batch started");

        if total == 0 {
            fan_in.finish();
        }

        let item_body = Arc::new(item_body);
        let mut item_ids = Vec::with_capacity(total);
        for (index, item) in items.into_iter().enumerate() {
            let body = Arc::clone(&item_body);
            let sink = Arc::clone(&fan_in);
            let options = SubmitOptions::new().on_complete(move |id, outcome: &Outcome<T>| {
                let result = match outcome {
                    Outcome::Succeeded(value) => Ok(value.clone()),
                    Outcome::Failed(failure) => Err(failure.clone()),
                    // callbacks only ever see terminal outcomes
                    Outcome::Pending => return,
                };
                sink.record(index, Some(id), result);
            });

            match self.pool.submit_with(move || body(item), options) {
                Ok(handle) => item_ids.push(handle.id()),
                Err(err) => {
                    warn!(%batch_id, index, error = %err, "batch item not submitted");
                    fan_in.record(
                        index,
                        None,
                        Err(TaskFailure::cancelled(format!("item not submitted: {err}"))),
                    );
                }
            }
        }

        Ok(BatchHandle {
            batch_id,
            result,
            item_ids,
        })
    }
}

struct Finish<T: TaskValue> {
    reservation: Reservation<T>,
    aggregate: Aggregate<T>,
}

struct FanIn<T: TaskValue> {
    batch_id: BatchId,
    total: usize,
    completed: AtomicUsize,
    slots: Mutex<Vec<Option<BatchItem<T>>>>,
    finish: Mutex<Option<Finish<T>>>,
    pool: Weak<WorkerPool<T>>,
}

impl<T: TaskValue> FanIn<T> {
    fn record(&self, index: usize, task_id: Option<TaskId>, result: Result<T, TaskFailure>) {
        self.slots.lock()[index] = Some(BatchItem {
            index,
            task_id,
            result,
        });

        let done = self.completed.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(batch_id = %self.batch_id, done, total = self.total, "batch item recorded");
        if done == self.total {
            self.finish();
        }
    }

    /// Submit the aggregation. Runs at most once.
    fn finish(&self) {
        let Some(Finish {
            reservation,
            aggregate,
        }) = self.finish.lock().take()
        else {
            return;
        };

        let items: Vec<BatchItem<T>> = std::mem::take(&mut *self.slots.lock())
            .into_iter()
            .flatten()
            .collect();
        let report = BatchReport {
            batch_id: self.batch_id,
            items,
        };
        let failed = report.failures().count();
        info!(
            batch_id = %self.batch_id,
            succeeded = report.len() - failed,
            failed,
            "batch items complete; submitting aggregation"
        );

        // reservation's Drop records the aggregation as cancelled
        let Some(pool) = self.pool.upgrade() else {
            warn!(batch_id = %self.batch_id, "pool dropped before aggregation");
            return;
        };
        if let Err(err) =
            pool.submit_reserved(reservation, move || aggregate(report), SubmitOptions::new())
        {
            warn!(batch_id = %self.batch_id, error = %err, "aggregation not submitted");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::config::EngineConfig;
    use crate::ports::FixedClock;

    const WAIT: Option<Duration> = Some(Duration::from_secs(5));

    fn launch(workers: usize) -> Arc<WorkerPool<i64>> {
        let config = EngineConfig::default()
            .with_worker_count(workers)
            .with_dequeue_timeout(Duration::from_millis(20));
        Arc::new(WorkerPool::launch(config).unwrap())
    }

    fn sum(items: &[i64]) -> Result<i64, TaskFailure> {
        Ok(items.iter().sum())
    }

    #[test]
    fn aggregation_runs_once_and_sees_every_item() {
        let pool = launch(4);
        let orchestrator = BatchOrchestrator::new(Arc::clone(&pool));
        let aggregations = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&aggregations);

        let batch = orchestrator
            .run_batch(
                vec![vec![1, 2], vec![3], vec![4, 5, 6]],
                |data: Vec<i64>| sum(&data),
                move |report| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if report.len() != 3 {
                        return Err(TaskFailure::failed(format!("saw {} items", report.len())));
                    }
                    Ok(report.successes().sum())
                },
            )
            .unwrap();

        assert_eq!(batch.item_ids.len(), 3);
        assert_eq!(batch.result.wait(WAIT).unwrap(), Outcome::Succeeded(21));
        assert_eq!(aggregations.load(Ordering::SeqCst), 1);
        pool.stop(true);
    }

    #[test]
    fn repeated_batches_each_aggregate_exactly_once() {
        let pool = launch(4);
        let orchestrator = BatchOrchestrator::new(Arc::clone(&pool));
        let aggregations = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..20)
            .map(|_| {
                let counter = Arc::clone(&aggregations);
                orchestrator
                    .run_batch(
                        vec![1_i64, 2, 3],
                        |n| Ok(n * 10),
                        move |report| {
                            counter.fetch_add(1, Ordering::SeqCst);
                            Ok(report.successes().sum())
                        },
                    )
                    .unwrap()
            })
            .collect();

        for batch in &handles {
            assert_eq!(batch.result.wait(WAIT).unwrap(), Outcome::Succeeded(60));
        }
        assert_eq!(aggregations.load(Ordering::SeqCst), 20);
        pool.stop(true);
    }

    #[test]
    fn failed_items_are_reported_to_the_aggregation() {
        let pool = launch(2);
        let orchestrator = BatchOrchestrator::new(Arc::clone(&pool));
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);

        let batch = orchestrator
            .run_batch(
                vec![1_i64, -1, 2],
                |n| {
                    if n < 0 {
                        Err(TaskFailure::failed("negative input"))
                    } else {
                        Ok(n)
                    }
                },
                move |report| {
                    let total = report.successes().sum();
                    *sink.lock() = Some(report);
                    Ok(total)
                },
            )
            .unwrap();

        assert_eq!(batch.result.wait(WAIT).unwrap(), Outcome::Succeeded(3));
        let report = seen.lock().take().unwrap();
        assert_eq!(report.failed_ids(), vec![batch.item_ids[1]]);
        assert_eq!(
            report.items[1].result,
            Err(TaskFailure::failed("negative input"))
        );
        assert_eq!(report.batch_id, batch.batch_id);
        pool.stop(true);
    }

    #[test]
    fn empty_batch_aggregates_immediately() {
        let pool = launch(1);
        let orchestrator = BatchOrchestrator::new(Arc::clone(&pool));

        let batch = orchestrator
            .run_batch(Vec::<i64>::new(), Ok, |report| {
                Ok(if report.is_empty() { -1 } else { 0 })
            })
            .unwrap();

        assert!(batch.item_ids.is_empty());
        assert_eq!(batch.result.wait(WAIT).unwrap(), Outcome::Succeeded(-1));
        pool.stop(true);
    }

    #[test]
    fn draining_stop_still_runs_the_aggregation() {
        let pool = launch(2);
        let orchestrator = BatchOrchestrator::new(Arc::clone(&pool));

        let batch = orchestrator
            .run_batch(
                vec![1_i64, 2, 3, 4],
                |n| {
                    thread::sleep(Duration::from_millis(20));
                    Ok(n)
                },
                |report| Ok(report.successes().sum()),
            )
            .unwrap();

        pool.stop(true);
        assert_eq!(batch.result.try_outcome(), Some(Outcome::Succeeded(10)));
    }

    #[test]
    fn aggregation_resolves_when_stop_races_the_batch() {
        for _ in 0..20 {
            let pool = launch(2);
            let orchestrator = BatchOrchestrator::new(Arc::clone(&pool));
            let runner = thread::spawn(move || {
                orchestrator.run_batch((0..20_000_i64).collect::<Vec<_>>(), Ok, |report| {
                    Ok(report.successes().sum())
                })
            });

            thread::sleep(Duration::from_micros(300));
            pool.stop(true);

            let Ok(batch) = runner.join().unwrap() else {
                continue;
            };
            let outcome = batch
                .result
                .wait(Some(Duration::from_secs(2)))
                .expect("aggregation left pending after stop");
            assert!(outcome.is_terminal());
            assert_eq!(pool.queued(), 0);
            assert_eq!(pool.counts().pending, 0);
        }
    }

    #[test]
    fn stopped_pool_rejects_the_batch() {
        let pool = launch(1);
        pool.stop(true);
        let orchestrator = BatchOrchestrator::new(Arc::clone(&pool));

        let err = orchestrator
            .run_batch(vec![1_i64], Ok, |_| Ok(0))
            .unwrap_err();
        assert!(matches!(err, EngineError::QueueClosed));
    }

    #[test]
    fn batch_id_comes_from_the_generator() {
        let fixed = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let pool = launch(1);
        let orchestrator = BatchOrchestrator::new(Arc::clone(&pool))
            .with_id_generator(UlidGenerator::new(FixedClock::new(fixed)));

        let batch = orchestrator.run_batch(vec![1_i64], Ok, |_| Ok(0)).unwrap();
        assert_eq!(
            batch.batch_id.as_ulid().timestamp_ms(),
            fixed.timestamp_millis() as u64
        );
        batch.result.wait(WAIT).unwrap();
        pool.stop(true);
    }
}
