use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::info;

use spindle_core::{
    BatchOrchestrator, BatchReport, EngineConfig, EngineCounts, Outcome, QueueMode, RetryPolicy,
    SubmitOptions, TaskFailure, WorkerPool, init_tracing,
};

const REMOTE_URL: &str = "https://example.com/api";

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    Fifo,
    Priority,
}

impl From<Mode> for QueueMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Fifo => QueueMode::Fifo,
            Mode::Priority => QueueMode::Priority,
        }
    }
}

#[derive(Parser)]
#[command(name = "spindle", version, about = "Run a fan-out/fan-in batch on a worker pool.")]
struct Cli {
    /// Worker threads (overrides SPINDLE_WORKERS)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Queue ordering (overrides SPINDLE_QUEUE_MODE)
    #[arg(short, long, value_enum)]
    mode: Option<Mode>,

    /// Simulated processing time per batch item, in milliseconds
    #[arg(long, default_value_t = 200)]
    work_ms: u64,

    /// Failures the remote fetch injects before it succeeds
    #[arg(long, default_value_t = 2)]
    fetch_failures: u32,

    /// Total attempts allowed for the remote fetch
    #[arg(long, default_value_t = 3)]
    fetch_attempts: u32,

    /// Emit logs as JSON
    #[arg(long, default_value_t = false)]
    json: bool,
}

#[derive(Serialize)]
struct Summary {
    batch: Outcome<Value>,
    fetch: Outcome<Value>,
    counts: EngineCounts,
}

fn process_data(items: Vec<String>, work: Duration) -> Result<Value, TaskFailure> {
    if items.is_empty() {
        return Err(TaskFailure::failed("nothing to process"));
    }
    thread::sleep(work);
    Ok(json!({ "processed": items, "count": items.len() }))
}

fn aggregate_results(report: BatchReport<Value>) -> Result<Value, TaskFailure> {
    let total: u64 = report
        .successes()
        .filter_map(|value| value["count"].as_u64())
        .sum();
    Ok(json!({
        "batch_id": report.batch_id.to_string(),
        "items": report.len(),
        "total": total,
        "failed": report.failed_ids(),
    }))
}

fn fetch_remote_data(url: &str, remaining_failures: &AtomicU32) -> Result<Value, TaskFailure> {
    thread::sleep(Duration::from_millis(50));

    let left = remaining_failures.load(Ordering::Relaxed);
    if left > 0 {
        remaining_failures.fetch_sub(1, Ordering::Relaxed);
        return Err(TaskFailure::failed(format!(
            "connection reset by {url} (injected, left={left})"
        )));
    }
    Ok(Value::String(format!("data from {url}")))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    let mut config = EngineConfig::from_env().context("reading SPINDLE_* environment")?;
    if let Some(workers) = cli.workers {
        config = config.with_worker_count(workers);
    }
    if let Some(mode) = cli.mode {
        config = config.with_queue_mode(mode.into());
    }

    let pool = Arc::new(WorkerPool::<Value>::launch(config).context("starting worker pool")?);
    let orchestrator = BatchOrchestrator::new(Arc::clone(&pool));

    let data: Vec<Vec<String>> = vec![
        vec!["item1".into(), "item2".into()],
        vec!["item3".into(), "item4".into(), "item5".into()],
        vec!["item6".into()],
    ];
    let work = Duration::from_millis(cli.work_ms);
    let batch = orchestrator.run_batch(
        data,
        move |items| process_data(items, work),
        aggregate_results,
    )?;
    info!(batch_id = %batch.batch_id, aggregate_task = %batch.result.id(), "batch submitted");

    let remaining = Arc::new(AtomicU32::new(cli.fetch_failures));
    let fetch_body = RetryPolicy::new(cli.fetch_attempts, Duration::from_millis(100))
        .with_jitter(0.1)
        .wrap(move || fetch_remote_data(REMOTE_URL, &remaining));
    let fetch = pool.submit_with(fetch_body, SubmitOptions::new().priority(10))?;

    let (batch_outcome, fetch_outcome) = tokio::join!(batch.result.outcome(), fetch.outcome());

    // draining stop joins worker threads
    let stopping = Arc::clone(&pool);
    tokio::task::spawn_blocking(move || stopping.stop(true)).await?;

    let summary = Summary {
        batch: batch_outcome?,
        fetch: fetch_outcome?,
        counts: pool.counts(),
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
