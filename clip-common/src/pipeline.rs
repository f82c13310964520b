//! # Processing pipeline
//!
//! The one path a URL takes to become a content record: fetch the media,
//! pick a representative image, run the multimodal analyzer, stamp the
//! image over the analyzer's suggestion, cache, return. Both the
//! dispatcher's direct path and the worker drive this same orchestration.
//!
//! The fetcher, analyzer and frame extractor are capability traits so the
//! dispatcher and worker never know which scraper or model sits behind
//! them, and tests can swap in stubs.

use std::sync::Arc;

use async_trait::async_trait;
use base64::prelude::*;
use chrono::Utc;
use tracing::{info, warn};

use crate::cache::{CacheStore, NewCacheEntry};
use crate::content::{ContentRecord, FetchedMedia, SlideshowMedia};
use crate::error::ProcessError;
use crate::fingerprint;

/// Text context handed to the analyzer alongside the media.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnalysisContext<'a> {
    pub transcript: Option<&'a str>,
    pub caption: Option<&'a str>,
    pub description: Option<&'a str>,
    pub locale: Option<&'a str>,
}

/// Downloads media and metadata for a supported platform URL.
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedMedia, ProcessError>;

    /// The full image list for a multi-image post. Only called after
    /// `fetch` reported `is_slideshow`.
    async fn fetch_slideshow(&self, url: &str) -> Result<SlideshowMedia, ProcessError>;
}

/// Runs the multimodal model over media + text context.
#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze_video(
        &self,
        video: &[u8],
        ctx: AnalysisContext<'_>,
    ) -> Result<ContentRecord, ProcessError>;

    async fn analyze_slideshow(
        &self,
        images: &[Vec<u8>],
        ctx: AnalysisContext<'_>,
    ) -> Result<ContentRecord, ProcessError>;
}

/// Decodes the first frame of a video as JPEG.
#[async_trait]
pub trait FrameExtractor: Send + Sync {
    async fn first_frame(&self, video: &[u8]) -> Result<Vec<u8>, ProcessError>;
}

fn jpeg_data_uri(bytes: &[u8]) -> String {
    format!("data:image/jpeg;base64,{}", BASE64_STANDARD.encode(bytes))
}

/// Stateless fetch -> extract -> analyze -> cache orchestration.
pub struct Pipeline {
    fetcher: Arc<dyn MediaFetcher>,
    analyzer: Arc<dyn Analyzer>,
    frames: Arc<dyn FrameExtractor>,
    cache: Arc<dyn CacheStore>,
    /// Recorded in cache metadata so a stored entry names its producer.
    processor_id: String,
}

impl Pipeline {
    pub fn new(
        fetcher: Arc<dyn MediaFetcher>,
        analyzer: Arc<dyn Analyzer>,
        frames: Arc<dyn FrameExtractor>,
        cache: Arc<dyn CacheStore>,
        processor_id: &str,
    ) -> Self {
        Self {
            fetcher,
            analyzer,
            frames,
            cache,
            processor_id: processor_id.to_owned(),
        }
    }

    /// Process a URL end to end and return the content record.
    ///
    /// Re-invocation for the same URL is safe; the only side effect is the
    /// cache write, which is last-writer-wins with an identical payload.
    pub async fn process(
        &self,
        url: &str,
        request_id: &str,
        locale: Option<&str>,
    ) -> Result<ContentRecord, ProcessError> {
        let media = self.fetcher.fetch(url).await?;
        let meta = media.metadata.clone();

        let caption = meta.caption.clone().or_else(|| meta.description.clone());
        let mut transcript = meta.transcript.clone();
        let mut representative: Option<Vec<u8>> = None;

        let mut payload = if meta.is_slideshow {
            info!(
                "processing slideshow with {} images for request {}",
                meta.image_count.unwrap_or(0),
                request_id
            );
            let slideshow = self.fetcher.fetch_slideshow(url).await?;
            // The slideshow scrape can recover a transcript the metadata
            // fetch could not; prefer it.
            if slideshow.transcript.is_some() {
                transcript = slideshow.transcript.clone();
            }
            representative = slideshow.images.first().cloned();
            if representative.is_none() {
                warn!("slideshow for request {} came back with no images", request_id);
            }

            self.analyzer
                .analyze_slideshow(
                    &slideshow.images,
                    AnalysisContext {
                        transcript: transcript.as_deref(),
                        caption: caption.as_deref(),
                        description: meta.description.as_deref(),
                        locale,
                    },
                )
                .await?
        } else {
            match self.frames.first_frame(&media.bytes).await {
                Ok(frame) => representative = Some(frame),
                Err(error) => {
                    warn!("failed to extract video frame for request {}: {}", request_id, error)
                }
            }

            self.analyzer
                .analyze_video(
                    &media.bytes,
                    AnalysisContext {
                        transcript: transcript.as_deref(),
                        caption: caption.as_deref(),
                        description: meta.description.as_deref(),
                        locale,
                    },
                )
                .await?
        };

        if payload.title.is_empty() {
            return Err(ProcessError::Analyzer(
                "analyzer returned an empty content record".to_owned(),
            ));
        }

        // The frame we decoded ourselves wins over whatever image the
        // analyzer suggested; applied after analysis on purpose.
        if let Some(image) = &representative {
            payload.image = Some(jpeg_data_uri(image));
        }

        let fp = fingerprint::fingerprint(url, locale);
        let cache_metadata = serde_json::json!({
            "title": meta.title.as_deref().unwrap_or("Unknown"),
            "author": meta.author.as_deref().unwrap_or("Unknown"),
            "durationSeconds": meta.duration_seconds.unwrap_or(0.0),
            "processedAt": Utc::now().to_rfc3339(),
            "platform": meta.platform.map_or("unknown", |p| p.as_str()),
            "workerId": self.processor_id,
        });
        let put = self
            .cache
            .put(NewCacheEntry {
                fingerprint: &fp,
                payload: &payload,
                metadata: cache_metadata,
                source_url: url,
                locale,
            })
            .await;
        if let Err(error) = put {
            // Cache unavailability never costs the caller the payload.
            warn!("failed to cache result for {}: {}", fp, error);
        }

        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::cache::{CacheError, CacheStats, MemoryCacheStore};
    use crate::content::{MediaMetadata, Platform};

    struct StubFetcher {
        media: FetchedMedia,
        slideshow: Option<SlideshowMedia>,
    }

    #[async_trait]
    impl MediaFetcher for StubFetcher {
        async fn fetch(&self, _url: &str) -> Result<FetchedMedia, ProcessError> {
            Ok(self.media.clone())
        }

        async fn fetch_slideshow(&self, _url: &str) -> Result<SlideshowMedia, ProcessError> {
            Ok(self.slideshow.clone().expect("slideshow not stubbed"))
        }
    }

    struct FailingFetcher;

    #[async_trait]
    impl MediaFetcher for FailingFetcher {
        async fn fetch(&self, _url: &str) -> Result<FetchedMedia, ProcessError> {
            Err(ProcessError::Fetch("video not found".to_owned()))
        }

        async fn fetch_slideshow(&self, _url: &str) -> Result<SlideshowMedia, ProcessError> {
            unreachable!()
        }
    }

    /// Returns a fixed record and captures the transcript it was given.
    struct StubAnalyzer {
        record: ContentRecord,
        seen_transcript: Mutex<Option<String>>,
    }

    impl StubAnalyzer {
        fn returning(record: ContentRecord) -> Self {
            Self {
                record,
                seen_transcript: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl Analyzer for StubAnalyzer {
        async fn analyze_video(
            &self,
            _video: &[u8],
            ctx: AnalysisContext<'_>,
        ) -> Result<ContentRecord, ProcessError> {
            *self.seen_transcript.lock().unwrap() = ctx.transcript.map(str::to_owned);
            Ok(self.record.clone())
        }

        async fn analyze_slideshow(
            &self,
            _images: &[Vec<u8>],
            ctx: AnalysisContext<'_>,
        ) -> Result<ContentRecord, ProcessError> {
            *self.seen_transcript.lock().unwrap() = ctx.transcript.map(str::to_owned);
            Ok(self.record.clone())
        }
    }

    struct StubFrames {
        frame: Result<Vec<u8>, ProcessError>,
    }

    #[async_trait]
    impl FrameExtractor for StubFrames {
        async fn first_frame(&self, _video: &[u8]) -> Result<Vec<u8>, ProcessError> {
            self.frame.clone()
        }
    }

    struct BrokenCache;

    #[async_trait]
    impl CacheStore for BrokenCache {
        async fn get(&self, _fingerprint: &str) -> Option<crate::cache::CacheEntry> {
            None
        }
        async fn put(&self, _entry: NewCacheEntry<'_>) -> Result<(), CacheError> {
            Err(CacheError::QueryError {
                command: "INSERT".to_owned(),
                error: sqlx::Error::PoolClosed,
            })
        }
        async fn invalidate(&self, _fingerprint: &str) -> Result<bool, CacheError> {
            Ok(false)
        }
        async fn stats(&self) -> Result<CacheStats, CacheError> {
            Ok(CacheStats {
                total_sampled: 0,
                expired_in_sample: 0,
                ttl_hours: 0,
            })
        }
    }

    fn video_media() -> FetchedMedia {
        FetchedMedia {
            bytes: vec![1, 2, 3, 4],
            metadata: MediaMetadata {
                platform: Some(Platform::Tiktok),
                title: Some("a clip".to_owned()),
                transcript: Some("hello from the video".to_owned()),
                ..Default::default()
            },
        }
    }

    fn record_with_image(title: &str) -> ContentRecord {
        ContentRecord {
            title: title.to_owned(),
            image: Some("https://model-suggested.example/thumb.jpg".to_owned()),
            ..Default::default()
        }
    }

    fn pipeline(
        fetcher: Arc<dyn MediaFetcher>,
        analyzer: Arc<dyn Analyzer>,
        frames: Arc<dyn FrameExtractor>,
        cache: Arc<dyn CacheStore>,
    ) -> Pipeline {
        Pipeline::new(fetcher, analyzer, frames, cache, "worker-test-1")
    }

    #[tokio::test]
    async fn test_video_path_overwrites_analyzer_image_with_extracted_frame() {
        let cache = Arc::new(MemoryCacheStore::new(168));
        let analyzer = Arc::new(StubAnalyzer::returning(record_with_image("X")));
        let p = pipeline(
            Arc::new(StubFetcher { media: video_media(), slideshow: None }),
            analyzer,
            Arc::new(StubFrames { frame: Ok(vec![0xFF, 0xD8, 0xFF]) }),
            cache.clone(),
        );

        let url = "https://tiktok.com/@a/video/1";
        let payload = p.process(url, "req-1", None).await.unwrap();

        let expected = format!(
            "data:image/jpeg;base64,{}",
            BASE64_STANDARD.encode([0xFF, 0xD8, 0xFF])
        );
        assert_eq!(payload.image.as_deref(), Some(expected.as_str()));

        // The result landed in the cache under the URL's fingerprint.
        let fp = fingerprint::fingerprint(url, None);
        let entry = cache.get(&fp).await.expect("cache entry");
        assert_eq!(entry.payload.0, payload);
    }

    #[tokio::test]
    async fn test_frame_extraction_failure_keeps_analyzer_image() {
        let p = pipeline(
            Arc::new(StubFetcher { media: video_media(), slideshow: None }),
            Arc::new(StubAnalyzer::returning(record_with_image("X"))),
            Arc::new(StubFrames {
                frame: Err(ProcessError::Format("no decodable frames".to_owned())),
            }),
            Arc::new(MemoryCacheStore::new(168)),
        );

        let payload = p
            .process("https://tiktok.com/@a/video/1", "req-1", None)
            .await
            .unwrap();
        assert_eq!(
            payload.image.as_deref(),
            Some("https://model-suggested.example/thumb.jpg")
        );
    }

    #[tokio::test]
    async fn test_slideshow_path_uses_first_image_and_slideshow_transcript() {
        let mut metadata = video_media().metadata;
        metadata.is_slideshow = true;
        metadata.image_count = Some(2);

        let analyzer = Arc::new(StubAnalyzer::returning(record_with_image("S")));
        let p = pipeline(
            Arc::new(StubFetcher {
                media: FetchedMedia { bytes: Vec::new(), metadata: metadata.clone() },
                slideshow: Some(SlideshowMedia {
                    images: vec![vec![9, 9], vec![8, 8]],
                    metadata,
                    transcript: Some("slideshow audio".to_owned()),
                }),
            }),
            analyzer.clone(),
            // The frame extractor must not run on the slideshow path.
            Arc::new(StubFrames {
                frame: Err(ProcessError::Format("should not be called".to_owned())),
            }),
            Arc::new(MemoryCacheStore::new(168)),
        );

        let payload = p
            .process("https://tiktok.com/@a/photo/1", "req-1", None)
            .await
            .unwrap();

        let expected = format!("data:image/jpeg;base64,{}", BASE64_STANDARD.encode([9, 9]));
        assert_eq!(payload.image.as_deref(), Some(expected.as_str()));
        assert_eq!(
            analyzer.seen_transcript.lock().unwrap().as_deref(),
            Some("slideshow audio")
        );
    }

    #[tokio::test]
    async fn test_fetch_error_propagates() {
        let p = pipeline(
            Arc::new(FailingFetcher),
            Arc::new(StubAnalyzer::returning(record_with_image("X"))),
            Arc::new(StubFrames { frame: Ok(vec![1]) }),
            Arc::new(MemoryCacheStore::new(168)),
        );

        let err = p
            .process("https://tiktok.com/@a/video/1", "req-1", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Fetch(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_empty_analyzer_output_is_an_analyzer_error() {
        let p = pipeline(
            Arc::new(StubFetcher { media: video_media(), slideshow: None }),
            Arc::new(StubAnalyzer::returning(ContentRecord::default())),
            Arc::new(StubFrames { frame: Ok(vec![1]) }),
            Arc::new(MemoryCacheStore::new(168)),
        );

        let err = p
            .process("https://tiktok.com/@a/video/1", "req-1", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Analyzer(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_cache_write_failure_still_returns_payload() {
        let p = pipeline(
            Arc::new(StubFetcher { media: video_media(), slideshow: None }),
            Arc::new(StubAnalyzer::returning(record_with_image("X"))),
            Arc::new(StubFrames { frame: Ok(vec![1]) }),
            Arc::new(BrokenCache),
        );

        let payload = p
            .process("https://tiktok.com/@a/video/1", "req-1", None)
            .await
            .unwrap();
        assert_eq!(payload.title, "X");
    }
}
