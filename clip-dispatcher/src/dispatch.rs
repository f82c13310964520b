//! # Dispatcher
//!
//! Per-request entry point implementing the hybrid processing decision:
//! serve from cache, collapse onto an existing job, run inline if a
//! direct slot is free, otherwise enqueue. The caller always receives
//! either a content record or a job handle, never a raw processing error
//! (validation aside).
//!
//! Admission is a semaphore: `try_acquire` is the atomic
//! compare-and-increment against the direct ceiling, and the RAII permit
//! guarantees the slot is returned on every exit path, panics included.

use std::sync::Arc;
use std::time;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use clip_common::cache::CacheStore;
use clip_common::content::ContentRecord;
use clip_common::error::ProcessError;
use clip_common::fingerprint;
use clip_common::pipeline::Pipeline;
use clip_common::queue::{JobOutcome, JobStatus, JobStore, Priority, QueueError};

#[derive(Error, Debug)]
pub enum DispatchError {
    /// The URL failed validation; surfaced to the caller as a client
    /// error and never enqueued.
    #[error(transparent)]
    Validation(ProcessError),
    /// The queue rejected the enqueue; with the direct path already
    /// exhausted there is nothing left to offer the caller.
    #[error("failed to enqueue job: {0}")]
    Enqueue(#[from] QueueError),
}

/// A job handle returned when processing happens asynchronously.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedJob {
    pub status: &'static str,
    pub job_id: String,
    pub message: &'static str,
    pub check_url: String,
}

impl QueuedJob {
    fn queued(job_id: String, message: &'static str) -> Self {
        Self {
            status: "queued",
            check_url: format!("/status/{job_id}"),
            job_id,
            message,
        }
    }

    fn processing(job_id: String) -> Self {
        Self {
            status: "processing",
            check_url: format!("/status/{job_id}"),
            job_id,
            message: "Video is currently being processed",
        }
    }
}

/// What a submission resolved to: a finished content record (from cache
/// or the direct path) or a handle to poll.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Submitted {
    Content(ContentRecord),
    Queued(QueuedJob),
}

pub struct Dispatcher {
    cache: Arc<dyn CacheStore>,
    jobs: Arc<dyn JobStore>,
    pipeline: Arc<Pipeline>,
    direct_slots: Arc<Semaphore>,
    max_direct: usize,
    direct_timeout: time::Duration,
}

impl Dispatcher {
    pub fn new(
        cache: Arc<dyn CacheStore>,
        jobs: Arc<dyn JobStore>,
        pipeline: Arc<Pipeline>,
        max_direct: usize,
        direct_timeout: time::Duration,
    ) -> Self {
        Self {
            cache,
            jobs,
            pipeline,
            direct_slots: Arc::new(Semaphore::new(max_direct)),
            max_direct,
            direct_timeout,
        }
    }

    /// Submit a URL for processing.
    ///
    /// Decision order matters: cache, then dedupe against queued and
    /// in-flight jobs, then admission. A duplicate submission must never
    /// burn a direct slot.
    pub async fn submit(
        &self,
        url: &str,
        locale: Option<&str>,
        request_id: &str,
    ) -> Result<Submitted, DispatchError> {
        fingerprint::validate_url(url).map_err(DispatchError::Validation)?;

        let fp = fingerprint::fingerprint(url, locale);
        if let Some(entry) = self.cache.get(&fp).await {
            info!("returning cached result for request {}", request_id);
            metrics::counter!("dispatcher_cache_hits_total").increment(1);
            let mut payload = entry.payload.0;
            payload.cached = Some(true);
            return Ok(Submitted::Content(payload));
        }

        if let Some(job) = self.find_existing(url, JobStatus::Pending, locale).await {
            info!("request {} collapsed onto queued job {}", request_id, job.job_id);
            metrics::counter!("dispatcher_deduped_total").increment(1);
            return Ok(Submitted::Queued(QueuedJob::queued(
                job.job_id,
                "Video already queued for processing",
            )));
        }
        if let Some(job) = self.find_existing(url, JobStatus::Processing, locale).await {
            info!("request {} collapsed onto in-flight job {}", request_id, job.job_id);
            metrics::counter!("dispatcher_deduped_total").increment(1);
            return Ok(Submitted::Queued(QueuedJob::processing(job.job_id)));
        }

        if let Ok(permit) = self.direct_slots.clone().try_acquire_owned() {
            metrics::counter!("dispatcher_direct_admitted_total").increment(1);
            info!(
                "direct processing started for request {} ({}/{} slots free)",
                request_id,
                self.direct_slots.available_permits(),
                self.max_direct
            );

            let started = time::Instant::now();
            let outcome = tokio::time::timeout(
                self.direct_timeout,
                self.pipeline.process(url, request_id, locale),
            )
            .await;
            drop(permit);

            match outcome {
                Ok(Ok(mut payload)) => {
                    metrics::histogram!("dispatcher_direct_duration_seconds")
                        .record(started.elapsed().as_secs_f64());
                    payload.cached = Some(false);
                    return Ok(Submitted::Content(payload));
                }
                Ok(Err(error)) => {
                    warn!(
                        "direct processing failed for request {}, falling back to queue: {}",
                        request_id, error
                    );
                }
                Err(_) => {
                    metrics::counter!("dispatcher_direct_timeouts_total").increment(1);
                    warn!(
                        "direct processing timed out for request {}, falling back to queue",
                        request_id
                    );
                }
            }
        } else {
            metrics::counter!("dispatcher_direct_rejected_total").increment(1);
            info!("at direct capacity, queueing request {}", request_id);
        }

        let job_id = self
            .jobs
            .enqueue(url, request_id, locale, Priority::Normal)
            .await?;
        info!("request {} queued as job {}", request_id, job_id);
        Ok(Submitted::Queued(QueuedJob::queued(
            job_id,
            "Video queued for processing. Check status with job_id.",
        )))
    }

    /// The caller-facing status view for a job handle.
    pub async fn job_status(&self, job_id: &str) -> Result<JobOutcome, QueueError> {
        self.jobs.get_result(job_id).await
    }

    /// Dedupe lookups swallow store errors: a broken queue must not take
    /// the direct path down with it.
    async fn find_existing(
        &self,
        url: &str,
        status: JobStatus,
        locale: Option<&str>,
    ) -> Option<clip_common::queue::Job> {
        match self.jobs.find_by_url(url, Some(status), locale).await {
            Ok(job) => job,
            Err(error) => {
                warn!("job lookup failed during dedupe, continuing: {}", error);
                None
            }
        }
    }

    /// Currently free direct slots.
    pub fn available_direct_slots(&self) -> usize {
        self.direct_slots.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::watch;

    use super::*;
    use clip_common::cache::{CacheEntry, MemoryCacheStore, NewCacheEntry};
    use clip_common::content::{FetchedMedia, MediaMetadata, SlideshowMedia};
    use clip_common::pipeline::{AnalysisContext, Analyzer, FrameExtractor, MediaFetcher};
    use clip_common::queue::MemoryJobStore;

    const URL: &str = "https://www.tiktok.com/@a/video/1";

    /// Fetcher that panics when called; proves a path did no fetching.
    struct PanickingFetcher;

    #[async_trait]
    impl MediaFetcher for PanickingFetcher {
        async fn fetch(&self, _url: &str) -> Result<FetchedMedia, ProcessError> {
            panic!("fetcher must not be called on this path")
        }
        async fn fetch_slideshow(&self, _url: &str) -> Result<SlideshowMedia, ProcessError> {
            panic!("fetcher must not be called on this path")
        }
    }

    struct InstantFetcher;

    #[async_trait]
    impl MediaFetcher for InstantFetcher {
        async fn fetch(&self, _url: &str) -> Result<FetchedMedia, ProcessError> {
            Ok(FetchedMedia {
                bytes: vec![1, 2, 3],
                metadata: MediaMetadata::default(),
            })
        }
        async fn fetch_slideshow(&self, _url: &str) -> Result<SlideshowMedia, ProcessError> {
            unreachable!()
        }
    }

    struct FailingFetcher;

    #[async_trait]
    impl MediaFetcher for FailingFetcher {
        async fn fetch(&self, _url: &str) -> Result<FetchedMedia, ProcessError> {
            Err(ProcessError::Fetch("scraper returned HTTP 502".to_owned()))
        }
        async fn fetch_slideshow(&self, _url: &str) -> Result<SlideshowMedia, ProcessError> {
            unreachable!()
        }
    }

    /// Analyzer that optionally blocks until released, to hold a direct
    /// slot open or to outlive the direct timeout.
    struct StubAnalyzer {
        title: String,
        release: Option<watch::Receiver<bool>>,
    }

    #[async_trait]
    impl Analyzer for StubAnalyzer {
        async fn analyze_video(
            &self,
            _video: &[u8],
            _ctx: AnalysisContext<'_>,
        ) -> Result<ContentRecord, ProcessError> {
            if let Some(release) = &self.release {
                let mut release = release.clone();
                while !*release.borrow() {
                    if release.changed().await.is_err() {
                        break;
                    }
                }
            }
            Ok(ContentRecord {
                title: self.title.clone(),
                ..Default::default()
            })
        }

        async fn analyze_slideshow(
            &self,
            _images: &[Vec<u8>],
            _ctx: AnalysisContext<'_>,
        ) -> Result<ContentRecord, ProcessError> {
            unreachable!()
        }
    }

    struct NoFrames;

    #[async_trait]
    impl FrameExtractor for NoFrames {
        async fn first_frame(&self, _video: &[u8]) -> Result<Vec<u8>, ProcessError> {
            Err(ProcessError::Format("no frames in tests".to_owned()))
        }
    }

    struct Harness {
        cache: Arc<MemoryCacheStore>,
        jobs: Arc<MemoryJobStore>,
        dispatcher: Dispatcher,
    }

    fn harness_with(
        fetcher: Arc<dyn MediaFetcher>,
        analyzer: Arc<dyn Analyzer>,
        max_direct: usize,
        direct_timeout: Duration,
    ) -> Harness {
        let cache = Arc::new(MemoryCacheStore::new(168));
        let jobs = Arc::new(MemoryJobStore::new(3));
        let pipeline = Arc::new(Pipeline::new(
            fetcher,
            analyzer,
            Arc::new(NoFrames),
            cache.clone(),
            "dispatcher-test",
        ));
        let dispatcher = Dispatcher::new(
            cache.clone(),
            jobs.clone(),
            pipeline,
            max_direct,
            direct_timeout,
        );
        Harness {
            cache,
            jobs,
            dispatcher,
        }
    }

    fn harness(max_direct: usize) -> Harness {
        harness_with(
            Arc::new(InstantFetcher),
            Arc::new(StubAnalyzer {
                title: "fresh".to_owned(),
                release: None,
            }),
            max_direct,
            Duration::from_secs(30),
        )
    }

    #[tokio::test]
    async fn test_cache_hit_short_circuits_without_fetching() {
        let h = harness_with(
            Arc::new(PanickingFetcher),
            Arc::new(StubAnalyzer {
                title: "unused".to_owned(),
                release: None,
            }),
            15,
            Duration::from_secs(30),
        );

        h.cache
            .put(NewCacheEntry {
                fingerprint: &fingerprint::fingerprint(URL, None),
                payload: &ContentRecord {
                    title: "X".to_owned(),
                    hook: Some("Y".to_owned()),
                    ..Default::default()
                },
                metadata: serde_json::json!({}),
                source_url: URL,
                locale: None,
            })
            .await
            .unwrap();

        // Same clip through a tracking-tail URL still hits.
        let submitted = h
            .dispatcher
            .submit("https://tiktok.com/@a/video/1?utm_source=test", None, "req-1")
            .await
            .unwrap();

        match submitted {
            Submitted::Content(payload) => {
                assert_eq!(payload.title, "X");
                assert_eq!(payload.hook.as_deref(), Some("Y"));
                assert_eq!(payload.cached, Some(true));
            }
            other => panic!("expected content, got {other:?}"),
        }
        assert!(h.jobs.is_empty());
    }

    #[tokio::test]
    async fn test_direct_processing_returns_payload_and_caches() {
        let h = harness(15);

        let submitted = h.dispatcher.submit(URL, None, "req-1").await.unwrap();
        match submitted {
            Submitted::Content(payload) => {
                assert_eq!(payload.title, "fresh");
                assert_eq!(payload.cached, Some(false));
            }
            other => panic!("expected content, got {other:?}"),
        }

        // Slot returned, nothing queued, result cached under the fingerprint.
        assert_eq!(h.dispatcher.available_direct_slots(), 15);
        assert!(h.jobs.is_empty());
        assert!(h
            .cache
            .get(&fingerprint::fingerprint(URL, None))
            .await
            .is_some());
    }

    #[tokio::test]
    async fn test_at_capacity_enqueues_instead() {
        // Zero slots: admission must fail closed and fall through to the
        // queue without touching the pipeline.
        let h = harness_with(
            Arc::new(PanickingFetcher),
            Arc::new(StubAnalyzer {
                title: "unused".to_owned(),
                release: None,
            }),
            0,
            Duration::from_secs(30),
        );

        let submitted = h.dispatcher.submit(URL, None, "req-1").await.unwrap();
        match submitted {
            Submitted::Queued(queued) => {
                assert_eq!(queued.status, "queued");
                assert!(queued.job_id.starts_with("req-1_"));
                assert_eq!(queued.check_url, format!("/status/{}", queued.job_id));
            }
            other => panic!("expected queued, got {other:?}"),
        }
        assert_eq!(h.jobs.len(), 1);
    }

    #[tokio::test]
    async fn test_last_slot_admits_and_next_request_queues() {
        let (release_tx, release_rx) = watch::channel(false);
        let h = harness_with(
            Arc::new(InstantFetcher),
            Arc::new(StubAnalyzer {
                title: "slow".to_owned(),
                release: Some(release_rx),
            }),
            1,
            Duration::from_secs(30),
        );
        let dispatcher = Arc::new(h.dispatcher);

        // First request takes the last slot and parks in the analyzer.
        let first = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.submit(URL, None, "req-1").await })
        };
        while dispatcher.available_direct_slots() != 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // Second request for a different URL sees no capacity.
        let second = dispatcher
            .submit("https://tiktok.com/@b/video/2", None, "req-2")
            .await
            .unwrap();
        assert!(matches!(second, Submitted::Queued(ref q) if q.status == "queued"));

        release_tx.send(true).unwrap();
        let first = first.await.unwrap().unwrap();
        assert!(matches!(first, Submitted::Content(ref p) if p.cached == Some(false)));
        assert_eq!(dispatcher.available_direct_slots(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_submission_collapses_onto_pending_job() {
        let h = harness_with(
            Arc::new(PanickingFetcher),
            Arc::new(StubAnalyzer {
                title: "unused".to_owned(),
                release: None,
            }),
            0,
            Duration::from_secs(30),
        );

        let first = h.dispatcher.submit(URL, None, "req-1").await.unwrap();
        let Submitted::Queued(first) = first else {
            panic!("expected queued")
        };

        let second = h.dispatcher.submit(URL, None, "req-2").await.unwrap();
        let Submitted::Queued(second) = second else {
            panic!("expected queued")
        };

        assert_eq!(second.job_id, first.job_id);
        assert_eq!(h.jobs.len(), 1);
    }

    #[tokio::test]
    async fn test_submission_reports_in_flight_job_as_processing() {
        let h = harness_with(
            Arc::new(PanickingFetcher),
            Arc::new(StubAnalyzer {
                title: "unused".to_owned(),
                release: None,
            }),
            0,
            Duration::from_secs(30),
        );

        let Submitted::Queued(first) = h.dispatcher.submit(URL, None, "req-1").await.unwrap()
        else {
            panic!("expected queued")
        };
        // A worker picks it up.
        h.jobs.claim_next("worker-a").await.unwrap().unwrap();

        let Submitted::Queued(second) = h.dispatcher.submit(URL, None, "req-2").await.unwrap()
        else {
            panic!("expected queued")
        };
        assert_eq!(second.status, "processing");
        assert_eq!(second.job_id, first.job_id);
    }

    #[tokio::test]
    async fn test_locale_is_part_of_the_dedupe_key() {
        let h = harness_with(
            Arc::new(PanickingFetcher),
            Arc::new(StubAnalyzer {
                title: "unused".to_owned(),
                release: None,
            }),
            0,
            Duration::from_secs(30),
        );

        let Submitted::Queued(first) = h.dispatcher.submit(URL, None, "req-1").await.unwrap()
        else {
            panic!("expected queued")
        };
        let Submitted::Queued(second) =
            h.dispatcher.submit(URL, Some("es"), "req-2").await.unwrap()
        else {
            panic!("expected queued")
        };

        assert_ne!(first.job_id, second.job_id);
        assert_eq!(h.jobs.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_direct_timeout_falls_back_to_queue() {
        // The analyzer never releases; the deadline must cut it off and
        // the request must land in the queue with no payload returned.
        let (_release_tx, release_rx) = watch::channel(false);
        let h = harness_with(
            Arc::new(InstantFetcher),
            Arc::new(StubAnalyzer {
                title: "never".to_owned(),
                release: Some(release_rx),
            }),
            15,
            Duration::from_millis(50),
        );

        let submitted = h.dispatcher.submit(URL, None, "req-1").await.unwrap();
        assert!(matches!(submitted, Submitted::Queued(ref q) if q.status == "queued"));
        assert_eq!(h.jobs.len(), 1);
        assert_eq!(h.dispatcher.available_direct_slots(), 15);
    }

    #[tokio::test]
    async fn test_direct_failure_falls_back_to_queue() {
        let h = harness_with(
            Arc::new(FailingFetcher),
            Arc::new(StubAnalyzer {
                title: "unused".to_owned(),
                release: None,
            }),
            15,
            Duration::from_secs(30),
        );

        let submitted = h.dispatcher.submit(URL, None, "req-1").await.unwrap();
        assert!(matches!(submitted, Submitted::Queued(_)));
        assert_eq!(h.jobs.len(), 1);
        assert_eq!(h.dispatcher.available_direct_slots(), 15);
    }

    #[tokio::test]
    async fn test_invalid_urls_are_rejected_and_never_enqueued() {
        let h = harness(15);

        let err = h
            .dispatcher
            .submit("https://youtube.com/watch?v=1", None, "req-1")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Validation(ProcessError::UnsupportedPlatform(_))
        ));

        let err = h.dispatcher.submit("   ", None, "req-2").await.unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Validation(ProcessError::Validation(_))
        ));

        assert!(h.jobs.is_empty());
    }

    #[tokio::test]
    async fn test_job_status_passthrough() {
        let h = harness(0);

        let Submitted::Queued(queued) = h.dispatcher.submit(URL, None, "req-1").await.unwrap()
        else {
            panic!("expected queued")
        };

        assert!(matches!(
            h.dispatcher.job_status(&queued.job_id).await.unwrap(),
            JobOutcome::Pending { attempts: 0, .. }
        ));
        assert_eq!(
            h.dispatcher.job_status("missing_1").await.unwrap(),
            JobOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn test_expired_cache_entry_is_a_miss_and_reprocesses() {
        let h = harness(15);
        let fp = fingerprint::fingerprint(URL, None);
        let now = chrono::Utc::now();
        h.cache.insert_entry(CacheEntry {
            fingerprint: fp.clone(),
            payload: sqlx::types::Json(ContentRecord {
                title: "stale".to_owned(),
                ..Default::default()
            }),
            metadata: sqlx::types::Json(serde_json::json!({})),
            source_url: URL.to_owned(),
            locale: None,
            created_at: now - chrono::Duration::hours(200),
            expires_at: now - chrono::Duration::hours(32),
            ttl_hours: 168,
        });

        let submitted = h.dispatcher.submit(URL, None, "req-1").await.unwrap();
        match submitted {
            Submitted::Content(payload) => {
                assert_eq!(payload.title, "fresh");
                assert_eq!(payload.cached, Some(false));
            }
            other => panic!("expected content, got {other:?}"),
        }
    }
}
