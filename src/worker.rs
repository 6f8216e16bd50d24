//! Background job execution.
//!
//! A [`WorkerPool`] runs `worker.concurrency` loops that claim jobs from the
//! SQLite queue and hand them to [`pipeline::run_job`]. While a job runs, a
//! heartbeat pushes its lease (and the document lock) forward so a healthy
//! worker never loses the job to another process; a crashed worker's lease
//! simply expires and the job becomes claimable again.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::engine::Engine;
use crate::pipeline::{self, JobOutcome};
use crate::queue::Job;
use crate::store;

pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(engine: Arc<Engine>) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let concurrency = engine.config.worker.concurrency.max(1);
        let handles = (0..concurrency)
            .map(|n| tokio::spawn(worker_loop(Arc::clone(&engine), n, rx.clone())))
            .collect();
        tracing::info!(concurrency, "Worker pool started");
        Self { shutdown, handles }
    }

    /// Stops claiming new jobs and waits for in-flight ones to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Worker task panicked");
            }
        }
        tracing::info!("Worker pool stopped");
    }
}

async fn worker_loop(engine: Arc<Engine>, worker: usize, mut shutdown: watch::Receiver<bool>) {
    let poll = Duration::from_millis(engine.config.worker.poll_interval_ms);
    loop {
        if *shutdown.borrow() {
            break;
        }
        match engine.queue.claim().await {
            Ok(Some(job)) => {
                execute(&engine, &job, worker).await;
                continue;
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(worker, error = %e, "Failed to claim job"),
        }
        tokio::select! {
            _ = shutdown.changed() => {}
            _ = tokio::time::sleep(poll) => {}
        }
    }
}

async fn execute(engine: &Engine, job: &Job, worker: usize) -> Option<JobOutcome> {
    tracing::debug!(
        worker,
        job_id = %job.id,
        kind = job.kind.as_str(),
        document_id = %job.document_id,
        attempt = job.attempts,
        "Claimed job"
    );
    match with_heartbeat(engine, job).await {
        Ok(outcome) => Some(outcome),
        Err(e) => {
            tracing::error!(worker, job_id = %job.id, error = %e, "Job bookkeeping failed");
            None
        }
    }
}

/// Runs the job while renewing its lease every third of `worker.lease_secs`.
async fn with_heartbeat(engine: &Engine, job: &Job) -> anyhow::Result<JobOutcome> {
    let lease = engine.config.worker.lease_secs;
    let work = pipeline::run_job(engine, job);
    tokio::pin!(work);

    let mut tick = tokio::time::interval(Duration::from_secs((lease / 3).max(1)));
    tick.tick().await;
    loop {
        tokio::select! {
            outcome = &mut work => return outcome,
            _ = tick.tick() => {
                if let Err(e) = engine.queue.extend_lease(job).await {
                    tracing::warn!(job_id = %job.id, error = %e, "Lease renewal failed");
                }
                if let Err(e) = store::extend_lock(&engine.pool, &job.document_id, &job.lease_token, lease).await {
                    tracing::warn!(document_id = %job.document_id, error = %e, "Lock renewal failed");
                }
            }
        }
    }
}

/// Processes jobs in this task until the queue has nothing queued or
/// running. Used by `kb ingest --wait` and tests. Returns the number of
/// jobs that ran.
pub async fn run_until_idle(engine: &Engine) -> anyhow::Result<usize> {
    let poll = Duration::from_millis(engine.config.worker.poll_interval_ms);
    let mut ran = 0;
    loop {
        if let Some(job) = engine.queue.claim().await? {
            execute(engine, &job, 0).await;
            ran += 1;
            continue;
        }
        let stats = engine.queue.stats().await?;
        if stats.queued == 0 && stats.running == 0 {
            return Ok(ran);
        }
        tokio::time::sleep(poll).await;
    }
}
