use thiserror::Error;

/// Message fragments that mark a failure as permanent regardless of its kind.
/// A remote scraper reporting any of these will keep failing on every retry.
const NON_RETRYABLE_PATTERNS: [&str; 7] = [
    "invalid url",
    "malformed url",
    "video not found",
    "private video",
    "video unavailable",
    "unsupported format",
    "invalid video id",
];

/// Enumeration of errors that can occur while processing a submitted URL.
///
/// The `Display` rendering (`Kind: message`) is what gets persisted as a
/// job's `last_error`, so variants keep their messages short and free of
/// backtraces.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessError {
    /// The input failed validation before any work happened. Never enqueued.
    #[error("ValidationError: {0}")]
    Validation(String),
    /// A well-formed URL for a platform we do not scrape.
    #[error("UnsupportedPlatformError: {0}")]
    UnsupportedPlatform(String),
    /// The remote scraper could not deliver the media.
    #[error("FetchError: {0}")]
    Fetch(String),
    /// Frame extraction or image decoding failed on the delivered bytes.
    #[error("FormatError: {0}")]
    Format(String),
    /// The multimodal analyzer returned empty or unparseable output.
    #[error("AnalyzerError: {0}")]
    Analyzer(String),
    /// Cache or queue I/O failure.
    #[error("StoreError: {0}")]
    Store(String),
}

impl ProcessError {
    /// Whether another attempt could plausibly succeed.
    ///
    /// Fetch, analyzer and store errors are transient unless the message
    /// carries one of the permanent-failure markers. Validation, platform
    /// and format errors will fail identically every time.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProcessError::Validation(_)
            | ProcessError::UnsupportedPlatform(_)
            | ProcessError::Format(_) => false,
            ProcessError::Fetch(msg)
            | ProcessError::Analyzer(msg)
            | ProcessError::Store(msg) => {
                let msg = msg.to_lowercase();
                !NON_RETRYABLE_PATTERNS.iter().any(|p| msg.contains(p))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_errors_are_not_retryable() {
        assert!(!ProcessError::Validation("empty url".to_owned()).is_retryable());
        assert!(!ProcessError::UnsupportedPlatform("youtube.com".to_owned()).is_retryable());
        assert!(!ProcessError::Format("no decodable frames".to_owned()).is_retryable());
    }

    #[test]
    fn test_transient_errors_are_retryable() {
        assert!(ProcessError::Fetch("connection reset by peer".to_owned()).is_retryable());
        assert!(ProcessError::Analyzer("model returned no candidates".to_owned()).is_retryable());
        assert!(ProcessError::Store("deadline exceeded".to_owned()).is_retryable());
    }

    #[test]
    fn test_permanent_fetch_messages_are_not_retryable() {
        assert!(!ProcessError::Fetch("remote said: Video Not Found".to_owned()).is_retryable());
        assert!(!ProcessError::Fetch("this is a private video".to_owned()).is_retryable());
        assert!(!ProcessError::Fetch("Unsupported Format: av1".to_owned()).is_retryable());
    }

    #[test]
    fn test_display_renders_kind_and_message() {
        let err = ProcessError::Fetch("HTTP 502 from scraper".to_owned());
        assert_eq!(err.to_string(), "FetchError: HTTP 502 from scraper");
    }
}
