//! HTTP clients for the scraper and analyzer sidecar services.
//!
//! The pipeline only knows the `MediaFetcher`/`Analyzer` traits; these
//! implementations speak a small JSON contract to whatever services are
//! configured, shipping media as base64 both ways.

use std::time;

use async_trait::async_trait;
use base64::prelude::*;
use serde::{Deserialize, Serialize};

use crate::content::{ContentRecord, FetchedMedia, MediaMetadata, SlideshowMedia};
use crate::error::ProcessError;
use crate::pipeline::{AnalysisContext, Analyzer, MediaFetcher};

/// How much of an error body we keep: enough to carry markers like
/// "video not found" into retry classification, short enough to persist
/// as a job's `last_error`.
const ERROR_BODY_SNIPPET: usize = 300;

fn body_snippet(body: &str) -> &str {
    if body.len() <= ERROR_BODY_SNIPPET {
        return body;
    }
    let mut end = ERROR_BODY_SNIPPET;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}

fn build_client(timeout: time::Duration, user_agent: &str) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(user_agent.to_owned())
        .build()
        .expect("failed to construct reqwest client")
}

#[derive(Serialize)]
struct FetchRequest<'a> {
    url: &'a str,
}

#[derive(Deserialize)]
struct FetchResponse {
    /// base64-encoded media bytes.
    media: String,
    metadata: MediaMetadata,
}

#[derive(Deserialize)]
struct SlideshowResponse {
    /// base64-encoded images, in display order.
    images: Vec<String>,
    metadata: MediaMetadata,
    transcript: Option<String>,
}

/// `MediaFetcher` talking to a scraper service over HTTP.
pub struct RemoteMediaFetcher {
    client: reqwest::Client,
    base_url: String,
}

impl RemoteMediaFetcher {
    pub fn new(base_url: &str, timeout: time::Duration) -> Self {
        Self {
            client: build_client(timeout, "clip-pipeline scraper client"),
            base_url: base_url.trim_end_matches('/').to_owned(),
        }
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        url: &str,
    ) -> Result<T, ProcessError> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(&FetchRequest { url })
            .send()
            .await
            .map_err(|e| ProcessError::Fetch(format!("scraper request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProcessError::Fetch(format!(
                "scraper returned HTTP {status}: {}",
                body_snippet(&body)
            )));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| ProcessError::Format(format!("malformed response from scraper: {e}")))
    }
}

fn decode_media(encoded: &str) -> Result<Vec<u8>, ProcessError> {
    BASE64_STANDARD
        .decode(encoded)
        .map_err(|e| ProcessError::Format(format!("malformed response from scraper: {e}")))
}

#[async_trait]
impl MediaFetcher for RemoteMediaFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedMedia, ProcessError> {
        let response: FetchResponse = self.post_json("/fetch", url).await?;
        Ok(FetchedMedia {
            bytes: decode_media(&response.media)?,
            metadata: response.metadata,
        })
    }

    async fn fetch_slideshow(&self, url: &str) -> Result<SlideshowMedia, ProcessError> {
        let response: SlideshowResponse = self.post_json("/slideshow", url).await?;
        let images = response
            .images
            .iter()
            .map(|encoded| decode_media(encoded))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(SlideshowMedia {
            images,
            metadata: response.metadata,
            transcript: response.transcript,
        })
    }
}

#[derive(Serialize)]
struct AnalyzeVideoRequest<'a> {
    video: String,
    transcript: Option<&'a str>,
    caption: Option<&'a str>,
    description: Option<&'a str>,
    locale: Option<&'a str>,
}

#[derive(Serialize)]
struct AnalyzeSlideshowRequest<'a> {
    images: Vec<String>,
    transcript: Option<&'a str>,
    caption: Option<&'a str>,
    description: Option<&'a str>,
    locale: Option<&'a str>,
}

/// `Analyzer` talking to a multimodal analysis service over HTTP.
pub struct RemoteAnalyzer {
    client: reqwest::Client,
    base_url: String,
}

impl RemoteAnalyzer {
    pub fn new(base_url: &str, timeout: time::Duration) -> Self {
        Self {
            client: build_client(timeout, "clip-pipeline analyzer client"),
            base_url: base_url.trim_end_matches('/').to_owned(),
        }
    }

    async fn analyze<B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<ContentRecord, ProcessError> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(body)
            .send()
            .await
            .map_err(|e| ProcessError::Analyzer(format!("analyzer request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProcessError::Analyzer(format!(
                "analyzer returned HTTP {status}: {}",
                body_snippet(&body)
            )));
        }

        response
            .json::<ContentRecord>()
            .await
            .map_err(|e| ProcessError::Analyzer(format!("unparseable analyzer output: {e}")))
    }
}

#[async_trait]
impl Analyzer for RemoteAnalyzer {
    async fn analyze_video(
        &self,
        video: &[u8],
        ctx: AnalysisContext<'_>,
    ) -> Result<ContentRecord, ProcessError> {
        self.analyze(
            "/analyze/video",
            &AnalyzeVideoRequest {
                video: BASE64_STANDARD.encode(video),
                transcript: ctx.transcript,
                caption: ctx.caption,
                description: ctx.description,
                locale: ctx.locale,
            },
        )
        .await
    }

    async fn analyze_slideshow(
        &self,
        images: &[Vec<u8>],
        ctx: AnalysisContext<'_>,
    ) -> Result<ContentRecord, ProcessError> {
        self.analyze(
            "/analyze/slideshow",
            &AnalyzeSlideshowRequest {
                images: images.iter().map(|i| BASE64_STANDARD.encode(i)).collect(),
                transcript: ctx.transcript,
                caption: ctx.caption,
                description: ctx.description,
                locale: ctx.locale,
            },
        )
        .await
    }
}
