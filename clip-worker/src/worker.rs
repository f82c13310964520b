//! # Worker
//!
//! A single-scheduler worker draining the job queue into the pipeline:
//! claim while below the concurrency bound, back off exponentially on an
//! empty queue, kick a GC sweep once an hour, and drain gracefully on
//! shutdown. Job tasks run concurrently in a `JoinSet` owned by the
//! scheduler; nothing else touches the set.

use std::sync::Arc;
use std::time;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use clip_common::backoff::PollBackoff;
use clip_common::cache::CacheStore;
use clip_common::fingerprint;
use clip_common::health::HealthHandle;
use clip_common::pipeline::Pipeline;
use clip_common::queue::{Job, JobStatus, JobStore};

/// Sleep between capacity checks while all task slots are busy.
const AT_CAPACITY_INTERVAL: time::Duration = time::Duration::from_millis(50);

/// The per-job half of the worker: everything `process_job` needs,
/// cloneable into a spawned task.
#[derive(Clone)]
pub struct JobProcessor {
    worker_id: String,
    jobs: Arc<dyn JobStore>,
    cache: Arc<dyn CacheStore>,
    pipeline: Arc<Pipeline>,
}

impl JobProcessor {
    pub fn new(
        worker_id: &str,
        jobs: Arc<dyn JobStore>,
        cache: Arc<dyn CacheStore>,
        pipeline: Arc<Pipeline>,
    ) -> Self {
        Self {
            worker_id: worker_id.to_owned(),
            jobs,
            cache,
            pipeline,
        }
    }

    /// Run one claimed job to a terminal transition (or a retry release).
    ///
    /// Never returns an error: every failure is classified and recorded
    /// on the job, and an unacknowledgeable job is deliberately left in
    /// `processing` for an operator.
    pub async fn process_job(&self, job: Job) {
        let started = time::Instant::now();
        info!("processing job {} - URL: {}", job.job_id, job.url);

        // Another worker (or an abandoned direct run) may have finished
        // this URL while the job sat queued.
        let fp = fingerprint::fingerprint(&job.url, job.locale.as_deref());
        if let Some(entry) = self.cache.get(&fp).await {
            let mut payload = entry.payload.0;
            payload.cached = Some(true);
            match self.jobs.mark_complete(&job.job_id, &payload).await {
                Ok(()) => {
                    info!("job {} - found in cache, marking complete", job.job_id);
                    metrics::counter!("worker_jobs_completed_total", "source" => "cache")
                        .increment(1);
                }
                Err(error) => {
                    error!("failed to acknowledge cached job {}: {}", job.job_id, error)
                }
            }
            return;
        }

        match self
            .pipeline
            .process(&job.url, &job.job_id, job.locale.as_deref())
            .await
        {
            Ok(payload) => match self.jobs.mark_complete(&job.job_id, &payload).await {
                Ok(()) => {
                    let elapsed = started.elapsed().as_secs_f64();
                    metrics::counter!("worker_jobs_completed_total", "source" => "pipeline")
                        .increment(1);
                    metrics::histogram!("worker_job_duration_seconds").record(elapsed);
                    info!(
                        "job {} - completed by {} in {:.2}s",
                        job.job_id, self.worker_id, elapsed
                    );
                }
                Err(error) => {
                    // Unacknowledged: the claim stays held and the job
                    // stays `processing` until an operator intervenes.
                    error!(
                        "job {} completed but could not be acknowledged, leaving it processing: {}",
                        job.job_id, error
                    );
                }
            },
            Err(process_error) => {
                let retryable = process_error.is_retryable();
                if !retryable {
                    error!(
                        "job {} - non-retryable error, moving to failed: {}",
                        job.job_id, process_error
                    );
                }
                match self
                    .jobs
                    .mark_failed(&job.job_id, &process_error.to_string(), retryable)
                    .await
                {
                    Ok(JobStatus::Pending) => {
                        metrics::counter!("worker_jobs_retried_total").increment(1);
                    }
                    Ok(_) => {
                        metrics::counter!("worker_jobs_failed_total").increment(1);
                    }
                    Err(store_error) => {
                        error!("failed to record failure for job {}: {}", job.job_id, store_error)
                    }
                }
            }
        }
    }
}

/// Scheduling knobs for a worker process.
#[derive(Clone, Copy, Debug)]
pub struct WorkerSettings {
    pub max_concurrent_jobs: usize,
    pub backoff: PollBackoff,
    pub cleanup_interval: time::Duration,
    pub cleanup_retention_days: i64,
    pub cleanup_batch_size: usize,
    pub shutdown_timeout: time::Duration,
}

/// A worker process: scheduler loop plus the processor it spawns.
pub struct ClipWorker {
    worker_id: String,
    processor: JobProcessor,
    jobs: Arc<dyn JobStore>,
    settings: WorkerSettings,
    liveness: HealthHandle,
}

impl ClipWorker {
    pub fn new(
        worker_id: &str,
        jobs: Arc<dyn JobStore>,
        cache: Arc<dyn CacheStore>,
        pipeline: Arc<Pipeline>,
        settings: WorkerSettings,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            worker_id: worker_id.to_owned(),
            processor: JobProcessor::new(worker_id, jobs.clone(), cache, pipeline),
            jobs,
            settings,
            liveness,
        }
    }

    /// Run until the shutdown flag flips, then drain.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("worker {} starting main loop", self.worker_id);

        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut consecutive_empty_polls: u32 = 0;
        let mut last_cleanup = time::Instant::now();

        while !*shutdown.borrow() {
            self.liveness.report_healthy().await;

            // Reap whatever finished since the last tick so the slot
            // count below is current.
            while tasks.try_join_next().is_some() {}
            metrics::gauge!("worker_active_jobs").set(tasks.len() as f64);

            if last_cleanup.elapsed() >= self.settings.cleanup_interval {
                last_cleanup = time::Instant::now();
                self.spawn_cleanup();
            }

            if tasks.len() >= self.settings.max_concurrent_jobs {
                self.sleep_or_shutdown(AT_CAPACITY_INTERVAL, &mut shutdown).await;
                continue;
            }

            match self.jobs.claim_next(&self.worker_id).await {
                Ok(Some(job)) => {
                    consecutive_empty_polls = 0;
                    let processor = self.processor.clone();
                    let job_id = job.job_id.clone();
                    tasks.spawn(async move { processor.process_job(job).await });
                    info!(
                        "started processing job {} ({}/{} active)",
                        job_id,
                        tasks.len(),
                        self.settings.max_concurrent_jobs
                    );
                }
                Ok(None) => {
                    consecutive_empty_polls += 1;
                    let delay = self.settings.backoff.delay(consecutive_empty_polls);
                    self.sleep_or_shutdown(delay, &mut shutdown).await;
                }
                Err(error) => {
                    error!("worker loop error: {}", error);
                    self.sleep_or_shutdown(self.settings.backoff.delay(1), &mut shutdown)
                        .await;
                }
            }
        }

        self.drain(tasks).await;
    }

    /// GC is fire-and-forget: a slow sweep must not stall claiming.
    fn spawn_cleanup(&self) {
        let jobs = self.jobs.clone();
        let days = self.settings.cleanup_retention_days;
        let batch = self.settings.cleanup_batch_size;
        tokio::spawn(async move {
            match jobs.cleanup_old(days, batch).await {
                Ok(0) => {}
                Ok(deleted) => {
                    metrics::counter!("worker_jobs_cleaned_total").increment(deleted);
                    info!("cleaned up {} old jobs from queue", deleted);
                }
                Err(error) => error!("periodic queue cleanup failed: {}", error),
            }
        });
    }

    async fn sleep_or_shutdown(
        &self,
        delay: time::Duration,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => {}
        }
    }

    async fn drain(&self, mut tasks: JoinSet<()>) {
        if !tasks.is_empty() {
            info!(
                "worker {} stopping, waiting for {} active tasks...",
                self.worker_id,
                tasks.len()
            );
            let drained =
                tokio::time::timeout(self.settings.shutdown_timeout, drain_all(&mut tasks)).await;
            if drained.is_err() {
                warn!(
                    "shutdown timeout reached, cancelling {} tasks",
                    tasks.len()
                );
                tasks.shutdown().await;
            }
        }
        info!("worker {} stopped", self.worker_id);
    }
}

async fn drain_all(tasks: &mut JoinSet<()>) {
    while tasks.join_next().await.is_some() {}
}
