//! URL canonicalization and cache-key derivation.
//!
//! Every storage and dedupe decision keys off the fingerprint produced
//! here, so normalization must be byte-deterministic: two URLs that name
//! the same clip (tracking tails, `www.` prefix, shuffled query order)
//! must collapse to the same 16-hex identifier.

use sha2::{Digest, Sha256};
use url::form_urlencoded;
use url::Url;

use crate::content::Platform;
use crate::error::ProcessError;

/// Query parameters that never affect which clip a URL points at.
const IGNORED_QUERY_PARAMS: [&str; 7] = [
    "utm_source",
    "utm_medium",
    "utm_campaign",
    "share_id",
    "timestamp",
    "ref",
    "source",
];

const TIKTOK_DOMAINS: [&str; 5] = [
    "tiktok.com",
    "www.tiktok.com",
    "vm.tiktok.com",
    "m.tiktok.com",
    "vt.tiktok.com",
];

const INSTAGRAM_DOMAINS: [&str; 4] = [
    "instagram.com",
    "www.instagram.com",
    "instagr.am",
    "www.instagr.am",
];

/// Map a URL to its canonical form: lowercased host without `www.`,
/// tracking parameters dropped, remaining query re-encoded in sorted key
/// order, no scheme, no trailing slash.
///
/// Inputs that do not parse as URLs fall back to trimmed lowercase, so the
/// function is total and deterministic for any string.
pub fn normalize_url(url: &str) -> String {
    let trimmed = url.trim();
    let candidate = if trimmed.contains("://") {
        trimmed.to_owned()
    } else {
        format!("https://{trimmed}")
    };

    let parsed = match Url::parse(&candidate) {
        Ok(parsed) if parsed.host_str().is_some() => parsed,
        _ => return trimmed.to_lowercase(),
    };

    let mut host = parsed.host_str().unwrap_or_default().to_lowercase();
    if let Some(stripped) = host.strip_prefix("www.") {
        host = stripped.to_owned();
    }

    let mut normalized = format!("{host}{}", parsed.path());
    if let Some(query) = normalize_query(&parsed) {
        normalized.push('?');
        normalized.push_str(&query);
    }

    normalized.trim_end_matches('/').to_owned()
}

/// Re-encode the query with ignored parameters dropped and the rest in
/// sorted (key, value) order. Returns `None` when nothing survives.
fn normalize_query(parsed: &Url) -> Option<String> {
    let mut pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(key, _)| !IGNORED_QUERY_PARAMS.contains(&key.as_ref()))
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();

    if pairs.is_empty() {
        return None;
    }
    pairs.sort();

    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (key, value) in &pairs {
        serializer.append_pair(key, value);
    }
    Some(serializer.finish())
}

/// Derive the 16-hex-char cache key for a (URL, locale) pair: the first 16
/// characters of `SHA-256(normalized_url ["|" lowercased_locale])`.
pub fn fingerprint(url: &str, locale: Option<&str>) -> String {
    let normalized = normalize_url(url);
    let input = match locale.map(str::trim).filter(|l| !l.is_empty()) {
        Some(locale) => format!("{normalized}|{}", locale.to_lowercase()),
        None => normalized,
    };

    let digest = Sha256::digest(input.as_bytes());
    hex::encode(digest)[..16].to_owned()
}

/// Detect which platform a URL belongs to, or `None` if unrecognized.
pub fn detect_platform(url: &str) -> Option<Platform> {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return None;
    }

    let candidate = if trimmed.contains("://") {
        trimmed.to_owned()
    } else {
        format!("https://{trimmed}")
    };

    let parsed = Url::parse(&candidate).ok()?;
    let host = parsed.host_str()?.to_lowercase();

    if TIKTOK_DOMAINS.contains(&host.as_str()) {
        Some(Platform::Tiktok)
    } else if INSTAGRAM_DOMAINS.contains(&host.as_str()) {
        Some(Platform::Instagram)
    } else {
        None
    }
}

/// Validate a submitted URL and resolve its platform.
///
/// Instagram only serves posts and reels; anything else on the domain
/// (profiles, stories) is rejected up front rather than after a fetch.
pub fn validate_url(url: &str) -> Result<Platform, ProcessError> {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return Err(ProcessError::Validation("url cannot be empty".to_owned()));
    }

    let platform = detect_platform(trimmed).ok_or_else(|| {
        ProcessError::UnsupportedPlatform(format!(
            "only TikTok and Instagram URLs are supported: {trimmed}"
        ))
    })?;

    let candidate = if trimmed.contains("://") {
        trimmed.to_owned()
    } else {
        format!("https://{trimmed}")
    };
    let parsed = Url::parse(&candidate)
        .map_err(|e| ProcessError::Validation(format!("invalid url: {e}")))?;

    match platform {
        Platform::Tiktok => {
            if parsed.path().is_empty() || parsed.path() == "/" {
                return Err(ProcessError::Validation(
                    "invalid TikTok URL format".to_owned(),
                ));
            }
        }
        Platform::Instagram => {
            let segments: Vec<&str> = parsed
                .path()
                .split('/')
                .filter(|s| !s.is_empty())
                .collect();
            let valid = matches!(segments.as_slice(), [kind, id]
                if matches!(*kind, "p" | "reel" | "reels")
                    && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-'));
            if !valid {
                return Err(ProcessError::Validation(
                    "URL must be an Instagram post or reel".to_owned(),
                ));
            }
        }
    }

    Ok(platform)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_strips_www_scheme_and_trailing_slash() {
        assert_eq!(
            normalize_url("https://www.tiktok.com/@user/video/123/"),
            "tiktok.com/@user/video/123"
        );
        assert_eq!(
            normalize_url("  https://vm.tiktok.com/abc123/  "),
            "vm.tiktok.com/abc123"
        );
    }

    #[test]
    fn test_normalize_drops_tracking_params_and_sorts_the_rest() {
        assert_eq!(
            normalize_url("https://tiktok.com/@u/video/1?utm_source=x&utm_medium=y&lang=en"),
            "tiktok.com/@u/video/1?lang=en"
        );
        assert_eq!(
            normalize_url("https://tiktok.com/@u/video/1?b=2&a=1"),
            normalize_url("https://tiktok.com/@u/video/1?a=1&b=2"),
        );
    }

    #[test]
    fn test_normalize_without_scheme_matches_https_form() {
        assert_eq!(
            normalize_url("tiktok.com/@user/video/123"),
            normalize_url("https://tiktok.com/@user/video/123"),
        );
    }

    #[test]
    fn test_normalize_falls_back_to_lowercase_for_non_urls() {
        assert_eq!(normalize_url("  Not A Url  "), "not a url");
    }

    #[test]
    fn test_fingerprint_is_16_lowercase_hex() {
        let fp = fingerprint("https://www.tiktok.com/@a/video/1", None);
        assert_eq!(fp.len(), 16);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_fingerprint_collides_for_equivalent_urls() {
        let base = fingerprint("https://www.tiktok.com/@a/video/1", None);
        assert_eq!(
            base,
            fingerprint("https://tiktok.com/@a/video/1?utm_source=test", None)
        );
        assert_eq!(
            base,
            fingerprint("tiktok.com/@a/video/1?utm_campaign=share&timestamp=9", None)
        );
        assert_eq!(base, fingerprint(&normalize_url("https://www.tiktok.com/@a/video/1"), None));
    }

    #[test]
    fn test_fingerprint_differs_for_meaningful_params() {
        assert_ne!(
            fingerprint("https://tiktok.com/@a/video/1?lang=en", None),
            fingerprint("https://tiktok.com/@a/video/1?lang=de", None)
        );
    }

    #[test]
    fn test_fingerprint_locale_salt() {
        let url = "https://tiktok.com/@a/video/1";
        assert_ne!(fingerprint(url, None), fingerprint(url, Some("es")));
        assert_eq!(fingerprint(url, Some("es")), fingerprint(url, Some("  ES ")));
        assert_eq!(fingerprint(url, Some("  ")), fingerprint(url, None));
    }

    #[test]
    fn test_detect_platform() {
        assert_eq!(
            detect_platform("https://vm.tiktok.com/ZMabc/"),
            Some(Platform::Tiktok)
        );
        assert_eq!(
            detect_platform("vt.tiktok.com/xyz"),
            Some(Platform::Tiktok)
        );
        assert_eq!(
            detect_platform("https://www.instagram.com/reel/Cxyz123/"),
            Some(Platform::Instagram)
        );
        assert_eq!(detect_platform("https://youtube.com/watch?v=1"), None);
        assert_eq!(detect_platform(""), None);
    }

    #[test]
    fn test_validate_url() {
        assert_eq!(
            validate_url("https://www.tiktok.com/@user/video/123").unwrap(),
            Platform::Tiktok
        );
        assert_eq!(
            validate_url("https://instagram.com/p/Cabc_12-3/").unwrap(),
            Platform::Instagram
        );

        assert!(matches!(
            validate_url("https://tiktok.com/"),
            Err(ProcessError::Validation(_))
        ));
        assert!(matches!(
            validate_url("https://instagram.com/stories/somebody/1/"),
            Err(ProcessError::Validation(_))
        ));
        assert!(matches!(
            validate_url("https://youtube.com/watch?v=1"),
            Err(ProcessError::UnsupportedPlatform(_))
        ));
        assert!(matches!(
            validate_url("   "),
            Err(ProcessError::Validation(_))
        ));
    }
}
