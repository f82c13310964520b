//! # Job queue
//!
//! A distributed job queue for clip processing, backed by a PostgreSQL
//! table plus a results table keyed by job id. Delivery is at-least-once:
//! a worker claims a job by flipping `pending -> processing` (the claim is
//! the lease; there is no automatic lease expiry), and a failed attempt
//! either re-queues the job or parks it in terminal `failed` once its
//! attempts are spent.
//!
//! Ordering is best-effort FIFO by `created_at`; concurrent claims may
//! reorder and that is fine.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;
use tracing::{info, warn};

use crate::content::ContentRecord;

/// How many of the oldest pending jobs a single claim pass looks at.
const CLAIM_SAMPLE: usize = 5;

/// Enumeration of errors for operations on the job queue.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("{0} is not a valid JobStatus")]
    ParseJobStatusError(String),
    #[error("job {0} does not exist")]
    JobNotFound(String),
    #[error("job {job_id} is {status}, expected processing")]
    InvalidTransition { job_id: String, status: JobStatus },
}

/// Enumeration of possible statuses for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, sqlx::Type)]
#[sqlx(type_name = "job_status")]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting in the queue to be picked up by a worker.
    Pending,
    /// Claimed by a worker and currently being run.
    Processing,
    /// Terminal: finished successfully, result stored.
    Completed,
    /// Terminal: out of attempts or failed permanently.
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl FromStr for JobStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            invalid => Err(QueueError::ParseJobStatusError(invalid.to_owned())),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Queueing priority. Stored with the job; the queue currently drains
/// oldest-first regardless, so this is advisory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, sqlx::Type)]
#[sqlx(type_name = "job_priority")]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

/// A queued clip-processing job.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Job {
    /// `{request_id}_{epoch_millis}`, unique and monotonic per request.
    pub job_id: String,
    pub url: String,
    pub request_id: String,
    pub locale: Option<String>,
    pub priority: Priority,
    pub status: JobStatus,
    /// Number of times a worker has claimed this job.
    pub attempts: i32,
    pub max_attempts: i32,
    /// Set while a worker holds the claim, cleared when it releases.
    pub worker_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// The joined queue + results view for a single job id.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    #[serde(rename_all = "camelCase")]
    Pending {
        created_at: DateTime<Utc>,
        attempts: i32,
        #[serde(skip_serializing_if = "Option::is_none")]
        last_error: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Processing {
        created_at: DateTime<Utc>,
        attempts: i32,
        #[serde(skip_serializing_if = "Option::is_none")]
        last_error: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Completed {
        result: ContentRecord,
        completed_at: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    Failed {
        #[serde(skip_serializing_if = "Option::is_none")]
        last_error: Option<String>,
        attempts: i32,
    },
    NotFound,
}

/// Per-status job counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Build a job id from the submitting request and the current instant.
fn make_job_id(request_id: &str, epoch_millis: i64) -> String {
    format!("{request_id}_{epoch_millis}")
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create a `pending` job and return its id.
    async fn enqueue(
        &self,
        url: &str,
        request_id: &str,
        locale: Option<&str>,
        priority: Priority,
    ) -> Result<String, QueueError>;

    /// Most recent job for a URL, optionally narrowed by status. The
    /// locale is part of the match: `None` matches only jobs submitted
    /// without one.
    async fn find_by_url(
        &self,
        url: &str,
        status: Option<JobStatus>,
        locale: Option<&str>,
    ) -> Result<Option<Job>, QueueError>;

    /// Atomically claim the oldest pending job for this worker, flipping
    /// it to `processing` and incrementing `attempts`. `None` when the
    /// queue has nothing claimable.
    async fn claim_next(&self, worker_id: &str) -> Result<Option<Job>, QueueError>;

    /// Store the result, then flip the job to terminal `completed`. If
    /// this errors the job is left `processing` and the caller must treat
    /// it as unacknowledged.
    async fn mark_complete(&self, job_id: &str, payload: &ContentRecord)
        -> Result<(), QueueError>;

    /// Record a failed attempt. Retryable failures with attempts to spare
    /// go back to `pending`; everything else parks in terminal `failed`.
    /// Returns the resulting status.
    async fn mark_failed(
        &self,
        job_id: &str,
        error: &str,
        retryable: bool,
    ) -> Result<JobStatus, QueueError>;

    /// The caller-facing view joining the queue row and the result row.
    async fn get_result(&self, job_id: &str) -> Result<JobOutcome, QueueError>;

    /// Delete terminal jobs (and their results) older than `days_old`
    /// days, in batches of at most `batch_size` writes per commit.
    /// Returns the number of jobs deleted.
    async fn cleanup_old(&self, days_old: i64, batch_size: usize) -> Result<u64, QueueError>;

    /// Per-status job counts for observability surfaces.
    async fn queue_stats(&self) -> Result<QueueStats, QueueError>;
}

/// Job store backed by PostgreSQL tables.
///
/// Claims use `FOR UPDATE SKIP LOCKED`, which subsumes the sample-and-CAS
/// dance a document store needs: contending workers skip each other's
/// locked rows, so a single pass either claims or proves the queue empty.
pub struct PgJobStore {
    pool: PgPool,
    queue_table: String,
    results_table: String,
    max_attempts: i32,
}

impl PgJobStore {
    pub async fn new(
        url: &str,
        max_connections: u32,
        max_attempts: i32,
    ) -> Result<Self, QueueError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_lazy(url)
            .map_err(|error| QueueError::ConnectionError { error })?;

        Ok(Self::from_pool(pool, max_attempts))
    }

    pub fn from_pool(pool: PgPool, max_attempts: i32) -> Self {
        Self {
            pool,
            queue_table: "processing_queue".to_owned(),
            results_table: "processing_results".to_owned(),
            max_attempts,
        }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn enqueue(
        &self,
        url: &str,
        request_id: &str,
        locale: Option<&str>,
        priority: Priority,
    ) -> Result<String, QueueError> {
        let base_query = format!(
            r#"
INSERT INTO "{0}"
    (job_id, url, request_id, locale, priority, status, attempts, max_attempts, created_at)
VALUES
    ($1, $2, $3, $4, $5, 'pending'::job_status, 0, $6, NOW())
            "#,
            &self.queue_table
        );

        // A request enqueueing twice within the same millisecond would
        // collide on the id; bump the millis and retry.
        let mut epoch_millis = Utc::now().timestamp_millis();
        loop {
            let job_id = make_job_id(request_id, epoch_millis);
            let result = sqlx::query(&base_query)
                .bind(&job_id)
                .bind(url)
                .bind(request_id)
                .bind(locale)
                .bind(priority)
                .bind(self.max_attempts)
                .execute(&self.pool)
                .await;

            match result {
                Ok(_) => {
                    info!("enqueued job {} for {}", job_id, url);
                    return Ok(job_id);
                }
                Err(error)
                    if error
                        .as_database_error()
                        .is_some_and(|e| e.is_unique_violation()) =>
                {
                    epoch_millis += 1;
                }
                Err(error) => {
                    return Err(QueueError::QueryError {
                        command: "INSERT".to_owned(),
                        error,
                    })
                }
            }
        }
    }

    async fn find_by_url(
        &self,
        url: &str,
        status: Option<JobStatus>,
        locale: Option<&str>,
    ) -> Result<Option<Job>, QueueError> {
        let base_query = format!(
            r#"
SELECT *
FROM "{0}"
WHERE url = $1
    AND ($2::job_status IS NULL OR status = $2)
    AND locale IS NOT DISTINCT FROM $3
ORDER BY created_at DESC
LIMIT 1
            "#,
            &self.queue_table
        );

        sqlx::query_as(&base_query)
            .bind(url)
            .bind(status)
            .bind(locale)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })
    }

    async fn claim_next(&self, worker_id: &str) -> Result<Option<Job>, QueueError> {
        // SKIP LOCKED makes contending workers pass over each other's
        // candidate rows instead of racing on the same one. See:
        // 2ndquadrant.com/en/blog/what-is-select-skip-locked-for-in-postgresql-9-5.
        let base_query = format!(
            r#"
WITH oldest_pending AS (
    SELECT job_id
    FROM "{0}"
    WHERE status = 'pending'
    ORDER BY created_at
    LIMIT 1
    FOR UPDATE SKIP LOCKED
)
UPDATE "{0}"
SET
    status = 'processing'::job_status,
    worker_id = $1,
    started_at = NOW(),
    attempts = "{0}".attempts + 1
FROM oldest_pending
WHERE "{0}".job_id = oldest_pending.job_id
RETURNING "{0}".*
            "#,
            &self.queue_table
        );

        let job: Option<Job> = sqlx::query_as(&base_query)
            .bind(worker_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        if let Some(job) = &job {
            info!("worker {} claimed job {}", worker_id, job.job_id);
        }
        Ok(job)
    }

    async fn mark_complete(
        &self,
        job_id: &str,
        payload: &ContentRecord,
    ) -> Result<(), QueueError> {
        // Result first, then the status flip, on one transaction: a job
        // observed as completed always has its result row.
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| QueueError::ConnectionError { error })?;

        let insert_result = format!(
            r#"
INSERT INTO "{0}" (job_id, payload, completed_at)
VALUES ($1, $2, NOW())
ON CONFLICT (job_id) DO UPDATE SET
    payload = EXCLUDED.payload,
    completed_at = EXCLUDED.completed_at
            "#,
            &self.results_table
        );

        sqlx::query(&insert_result)
            .bind(job_id)
            .bind(sqlx::types::Json(payload))
            .execute(&mut *tx)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })?;

        let update_job = format!(
            r#"
UPDATE "{0}"
SET status = 'completed'::job_status, completed_at = NOW()
WHERE job_id = $1 AND status = 'processing'::job_status
RETURNING job_id
            "#,
            &self.queue_table
        );

        let updated: Option<(String,)> = sqlx::query_as(&update_job)
            .bind(job_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        if updated.is_none() {
            tx.rollback()
                .await
                .map_err(|error| QueueError::ConnectionError { error })?;
            return Err(self.transition_error(job_id).await);
        }

        tx.commit()
            .await
            .map_err(|error| QueueError::ConnectionError { error })?;

        info!("job {} marked as complete", job_id);
        Ok(())
    }

    async fn mark_failed(
        &self,
        job_id: &str,
        error: &str,
        retryable: bool,
    ) -> Result<JobStatus, QueueError> {
        let select = format!(
            r#"SELECT attempts, max_attempts, status FROM "{0}" WHERE job_id = $1"#,
            &self.queue_table
        );

        let row: Option<(i32, i32, JobStatus)> = sqlx::query_as(&select)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })?;

        let (attempts, max_attempts, status) =
            row.ok_or_else(|| QueueError::JobNotFound(job_id.to_owned()))?;
        if status != JobStatus::Processing {
            return Err(QueueError::InvalidTransition {
                job_id: job_id.to_owned(),
                status,
            });
        }

        let next_status = if retryable && attempts < max_attempts {
            JobStatus::Pending
        } else {
            JobStatus::Failed
        };

        let update = format!(
            r#"
UPDATE "{0}"
SET status = $2, last_error = $3, failed_at = NOW(), worker_id = NULL
WHERE job_id = $1 AND status = 'processing'::job_status
RETURNING job_id
            "#,
            &self.queue_table
        );

        let updated: Option<(String,)> = sqlx::query_as(&update)
            .bind(job_id)
            .bind(next_status)
            .bind(error)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        if updated.is_none() {
            return Err(self.transition_error(job_id).await);
        }

        match next_status {
            JobStatus::Pending => {
                warn!("job {} failed attempt {}, will retry: {}", job_id, attempts, error)
            }
            _ => warn!("job {} failed after {} attempts: {}", job_id, attempts, error),
        }
        Ok(next_status)
    }

    async fn get_result(&self, job_id: &str) -> Result<JobOutcome, QueueError> {
        let select_job = format!(
            r#"SELECT * FROM "{0}" WHERE job_id = $1"#,
            &self.queue_table
        );

        let job: Option<Job> = sqlx::query_as(&select_job)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })?;

        let Some(job) = job else {
            return Ok(JobOutcome::NotFound);
        };

        match job.status {
            JobStatus::Completed => {
                let select_result = format!(
                    r#"SELECT payload, completed_at FROM "{0}" WHERE job_id = $1"#,
                    &self.results_table
                );
                let row: Option<(sqlx::types::Json<ContentRecord>, DateTime<Utc>)> =
                    sqlx::query_as(&select_result)
                        .bind(job_id)
                        .fetch_optional(&self.pool)
                        .await
                        .map_err(|error| QueueError::QueryError {
                            command: "SELECT".to_owned(),
                            error,
                        })?;

                // A completed job without its result row means the pair
                // was half-collected; report it gone rather than lie.
                Ok(match row {
                    Some((payload, completed_at)) => JobOutcome::Completed {
                        result: payload.0,
                        completed_at,
                    },
                    None => JobOutcome::NotFound,
                })
            }
            JobStatus::Pending => Ok(JobOutcome::Pending {
                created_at: job.created_at,
                attempts: job.attempts,
                last_error: job.last_error,
            }),
            JobStatus::Processing => Ok(JobOutcome::Processing {
                created_at: job.created_at,
                attempts: job.attempts,
                last_error: job.last_error,
            }),
            JobStatus::Failed => Ok(JobOutcome::Failed {
                last_error: job.last_error,
                attempts: job.attempts,
            }),
        }
    }

    async fn cleanup_old(&self, days_old: i64, batch_size: usize) -> Result<u64, QueueError> {
        let cutoff = Utc::now() - Duration::days(days_old);
        // Each job costs two deletes (queue row + result row), so a batch
        // of N jobs stays within batch_size writes per commit.
        let jobs_per_batch = (batch_size / 2).max(1);

        let select = format!(
            r#"
SELECT job_id
FROM "{0}"
WHERE status IN ('completed'::job_status, 'failed'::job_status) AND created_at < $1
ORDER BY created_at
LIMIT $2
            "#,
            &self.queue_table
        );
        let delete_results = format!(
            r#"DELETE FROM "{0}" WHERE job_id = ANY($1)"#,
            &self.results_table
        );
        let delete_jobs = format!(
            r#"DELETE FROM "{0}" WHERE job_id = ANY($1)"#,
            &self.queue_table
        );

        let mut deleted: u64 = 0;
        loop {
            let ids: Vec<(String,)> = sqlx::query_as(&select)
                .bind(cutoff)
                .bind(jobs_per_batch as i64)
                .fetch_all(&self.pool)
                .await
                .map_err(|error| QueueError::QueryError {
                    command: "SELECT".to_owned(),
                    error,
                })?;

            if ids.is_empty() {
                break;
            }
            let ids: Vec<String> = ids.into_iter().map(|(id,)| id).collect();

            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|error| QueueError::ConnectionError { error })?;
            sqlx::query(&delete_results)
                .bind(&ids)
                .execute(&mut *tx)
                .await
                .map_err(|error| QueueError::QueryError {
                    command: "DELETE".to_owned(),
                    error,
                })?;
            sqlx::query(&delete_jobs)
                .bind(&ids)
                .execute(&mut *tx)
                .await
                .map_err(|error| QueueError::QueryError {
                    command: "DELETE".to_owned(),
                    error,
                })?;
            tx.commit()
                .await
                .map_err(|error| QueueError::ConnectionError { error })?;

            deleted += ids.len() as u64;
            if ids.len() < jobs_per_batch {
                break;
            }
        }

        info!("cleaned up {} old jobs", deleted);
        Ok(deleted)
    }

    async fn queue_stats(&self) -> Result<QueueStats, QueueError> {
        let base_query = format!(
            r#"SELECT status, COUNT(*) FROM "{0}" GROUP BY status"#,
            &self.queue_table
        );

        let rows: Vec<(JobStatus, i64)> = sqlx::query_as(&base_query)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            let count = count as u64;
            match status {
                JobStatus::Pending => stats.pending = count,
                JobStatus::Processing => stats.processing = count,
                JobStatus::Completed => stats.completed = count,
                JobStatus::Failed => stats.failed = count,
            }
        }
        Ok(stats)
    }
}

impl PgJobStore {
    /// Distinguish "job gone" from "job in the wrong state" after a CAS
    /// update matched no row.
    async fn transition_error(&self, job_id: &str) -> QueueError {
        let select = format!(
            r#"SELECT status FROM "{0}" WHERE job_id = $1"#,
            &self.queue_table
        );
        match sqlx::query_as::<_, (JobStatus,)>(&select)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
        {
            Ok(Some((status,))) => QueueError::InvalidTransition {
                job_id: job_id.to_owned(),
                status,
            },
            Ok(None) => QueueError::JobNotFound(job_id.to_owned()),
            Err(error) => QueueError::QueryError {
                command: "SELECT".to_owned(),
                error,
            },
        }
    }
}

/// A completed job's stored result.
#[derive(Debug, Clone)]
pub struct StoredResult {
    pub job_id: String,
    pub payload: ContentRecord,
    pub completed_at: DateTime<Utc>,
}

#[derive(Default)]
struct MemoryInner {
    jobs: HashMap<String, Job>,
    results: HashMap<String, StoredResult>,
}

/// In-memory job store with document-store claim semantics: sample the
/// oldest pending jobs and CAS each until one sticks. Under the single
/// mutex the first CAS always sticks, which trivially satisfies the
/// claim contract. Used by the test suites and embeddable deployments.
pub struct MemoryJobStore {
    inner: Mutex<MemoryInner>,
    max_attempts: i32,
}

impl MemoryJobStore {
    pub fn new(max_attempts: i32) -> Self {
        Self {
            inner: Mutex::new(MemoryInner::default()),
            max_attempts,
        }
    }

    /// Number of jobs currently held, any status.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("queue lock poisoned").jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot a job row. Test-support surface.
    pub fn job(&self, job_id: &str) -> Option<Job> {
        self.inner
            .lock()
            .expect("queue lock poisoned")
            .jobs
            .get(job_id)
            .cloned()
    }

    /// Rewrite a job's `created_at`. Test-support surface for retention
    /// scenarios.
    pub fn backdate_job(&self, job_id: &str, created_at: DateTime<Utc>) {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        if let Some(job) = inner.jobs.get_mut(job_id) {
            job.created_at = created_at;
        }
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn enqueue(
        &self,
        url: &str,
        request_id: &str,
        locale: Option<&str>,
        priority: Priority,
    ) -> Result<String, QueueError> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");

        let mut epoch_millis = Utc::now().timestamp_millis();
        let mut job_id = make_job_id(request_id, epoch_millis);
        while inner.jobs.contains_key(&job_id) {
            epoch_millis += 1;
            job_id = make_job_id(request_id, epoch_millis);
        }

        let job = Job {
            job_id: job_id.clone(),
            url: url.to_owned(),
            request_id: request_id.to_owned(),
            locale: locale.map(str::to_owned),
            priority,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: self.max_attempts,
            worker_id: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            failed_at: None,
            last_error: None,
        };
        inner.jobs.insert(job_id.clone(), job);
        Ok(job_id)
    }

    async fn find_by_url(
        &self,
        url: &str,
        status: Option<JobStatus>,
        locale: Option<&str>,
    ) -> Result<Option<Job>, QueueError> {
        let inner = self.inner.lock().expect("queue lock poisoned");
        let found = inner
            .jobs
            .values()
            .filter(|job| job.url == url)
            .filter(|job| status.map_or(true, |s| job.status == s))
            .filter(|job| job.locale.as_deref() == locale)
            .max_by(|a, b| {
                a.created_at
                    .cmp(&b.created_at)
                    .then_with(|| a.job_id.cmp(&b.job_id))
            })
            .cloned();
        Ok(found)
    }

    async fn claim_next(&self, worker_id: &str) -> Result<Option<Job>, QueueError> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");

        let mut candidates: Vec<(DateTime<Utc>, String)> = inner
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Pending)
            .map(|job| (job.created_at, job.job_id.clone()))
            .collect();
        candidates.sort();
        candidates.truncate(CLAIM_SAMPLE);

        for (_, job_id) in candidates {
            let Some(job) = inner.jobs.get_mut(&job_id) else {
                continue;
            };
            // Re-check under the lock; the sample could be stale in a
            // store with real concurrency.
            if job.status != JobStatus::Pending {
                continue;
            }
            job.status = JobStatus::Processing;
            job.worker_id = Some(worker_id.to_owned());
            job.started_at = Some(Utc::now());
            job.attempts += 1;
            return Ok(Some(job.clone()));
        }

        Ok(None)
    }

    async fn mark_complete(
        &self,
        job_id: &str,
        payload: &ContentRecord,
    ) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");

        let job = inner
            .jobs
            .get(job_id)
            .ok_or_else(|| QueueError::JobNotFound(job_id.to_owned()))?;
        if job.status != JobStatus::Processing {
            return Err(QueueError::InvalidTransition {
                job_id: job_id.to_owned(),
                status: job.status,
            });
        }

        let completed_at = Utc::now();
        inner.results.insert(
            job_id.to_owned(),
            StoredResult {
                job_id: job_id.to_owned(),
                payload: payload.clone(),
                completed_at,
            },
        );
        let job = inner.jobs.get_mut(job_id).expect("checked above");
        job.status = JobStatus::Completed;
        job.completed_at = Some(completed_at);
        Ok(())
    }

    async fn mark_failed(
        &self,
        job_id: &str,
        error: &str,
        retryable: bool,
    ) -> Result<JobStatus, QueueError> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");

        let job = inner
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| QueueError::JobNotFound(job_id.to_owned()))?;
        if job.status != JobStatus::Processing {
            return Err(QueueError::InvalidTransition {
                job_id: job_id.to_owned(),
                status: job.status,
            });
        }

        let next_status = if retryable && job.attempts < job.max_attempts {
            JobStatus::Pending
        } else {
            JobStatus::Failed
        };
        job.status = next_status;
        job.last_error = Some(error.to_owned());
        job.failed_at = Some(Utc::now());
        job.worker_id = None;
        Ok(next_status)
    }

    async fn get_result(&self, job_id: &str) -> Result<JobOutcome, QueueError> {
        let inner = self.inner.lock().expect("queue lock poisoned");

        let Some(job) = inner.jobs.get(job_id) else {
            return Ok(JobOutcome::NotFound);
        };

        Ok(match job.status {
            JobStatus::Completed => match inner.results.get(job_id) {
                Some(result) => JobOutcome::Completed {
                    result: result.payload.clone(),
                    completed_at: result.completed_at,
                },
                None => JobOutcome::NotFound,
            },
            JobStatus::Pending => JobOutcome::Pending {
                created_at: job.created_at,
                attempts: job.attempts,
                last_error: job.last_error.clone(),
            },
            JobStatus::Processing => JobOutcome::Processing {
                created_at: job.created_at,
                attempts: job.attempts,
                last_error: job.last_error.clone(),
            },
            JobStatus::Failed => JobOutcome::Failed {
                last_error: job.last_error.clone(),
                attempts: job.attempts,
            },
        })
    }

    async fn cleanup_old(&self, days_old: i64, batch_size: usize) -> Result<u64, QueueError> {
        let cutoff = Utc::now() - Duration::days(days_old);
        let jobs_per_batch = (batch_size / 2).max(1);
        let mut deleted: u64 = 0;

        loop {
            let mut inner = self.inner.lock().expect("queue lock poisoned");
            let batch: Vec<String> = inner
                .jobs
                .values()
                .filter(|job| job.status.is_terminal() && job.created_at < cutoff)
                .map(|job| job.job_id.clone())
                .take(jobs_per_batch)
                .collect();

            if batch.is_empty() {
                break;
            }
            for job_id in &batch {
                inner.jobs.remove(job_id);
                inner.results.remove(job_id);
            }
            deleted += batch.len() as u64;
            if batch.len() < jobs_per_batch {
                break;
            }
        }

        Ok(deleted)
    }

    async fn queue_stats(&self) -> Result<QueueStats, QueueError> {
        let inner = self.inner.lock().expect("queue lock poisoned");
        let mut stats = QueueStats::default();
        for job in inner.jobs.values() {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }
}
