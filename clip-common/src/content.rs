//! Payload and media types shared by the dispatcher and the worker.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Platforms we know how to scrape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Tiktok,
    Instagram,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Tiktok => "tiktok",
            Platform::Instagram => "instagram",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The structured content record produced by the analyzer and stored in the
/// cache. `format` and `niche` are drawn from closed sets enforced by the
/// analyzer prompt; the core treats them as opaque strings so a grown set
/// never breaks deserialization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentRecord {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Full transcript of everything said in the clip.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,
    /// The attention-grabbing opening line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hook: Option<String>,
    /// base64 data URI of the representative frame or slideshow image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub niche: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub niche_detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_niches: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    /// Set by the dispatcher, never by the analyzer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached: Option<bool>,
}

/// Metadata delivered by a `MediaFetcher` alongside the media bytes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaMetadata {
    pub platform: Option<Platform>,
    pub title: Option<String>,
    pub author: Option<String>,
    pub duration_seconds: Option<f64>,
    pub description: Option<String>,
    pub caption: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub transcript: Option<String>,
    #[serde(default)]
    pub is_slideshow: bool,
    pub image_count: Option<u32>,
}

/// A downloaded video and its metadata.
#[derive(Debug, Clone)]
pub struct FetchedMedia {
    pub bytes: Vec<u8>,
    pub metadata: MediaMetadata,
}

/// A multi-image post: the full image list plus an optional transcript
/// recovered from the slideshow's audio track.
#[derive(Debug, Clone)]
pub struct SlideshowMedia {
    pub images: Vec<Vec<u8>>,
    pub metadata: MediaMetadata,
    pub transcript: Option<String>,
}
