use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

/// Path extensions of manifest-style sources (HLS, DASH, Smooth Streaming).
pub const MANIFEST_EXTENSIONS: &[&str] = &["m3u8", "m3u", "mpd", "ism", "isml"];

const DEFAULT_EXTENSION: &str = "mp4";

/// Identifier of a cached asset, a pure function of its locator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn from_locator(locator: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(normalize_locator(locator).as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True if `s` has the shape of a key: 64 lower-case hex digits.
    pub fn is_valid(s: &str) -> bool {
        s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonical form of a locator: lower-case scheme and host, no default
/// port, no fragment. Strings that are not URLs are only trimmed.
pub fn normalize_locator(locator: &str) -> String {
    let trimmed = locator.trim();
    match Url::parse(trimmed) {
        Ok(mut url) => {
            url.set_fragment(None);
            url.to_string()
        }
        Err(_) => trimmed.to_owned(),
    }
}

fn locator_path(locator: &str) -> String {
    let trimmed = locator.trim();
    match Url::parse(trimmed) {
        Ok(url) => url.path().to_owned(),
        Err(_) => trimmed
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .to_owned(),
    }
}

fn last_extension(path: &str) -> Option<String> {
    let segment = path.trim_end_matches('/').rsplit('/').next()?;
    let (_, ext) = segment.rsplit_once('.')?;
    Some(ext.to_ascii_lowercase())
}

/// True for playlists and manifests, which are not a single downloadable file.
pub fn is_manifest(locator: &str) -> bool {
    let path = locator_path(locator).to_ascii_lowercase();
    if path.trim_end_matches('/').ends_with("/manifest") {
        return true;
    }
    last_extension(&path).is_some_and(|ext| MANIFEST_EXTENSIONS.contains(&ext.as_str()))
}

/// Extension used for the local file, taken from the locator when sane.
pub fn file_extension(locator: &str) -> String {
    last_extension(&locator_path(locator))
        .filter(|ext| !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or_else(|| DEFAULT_EXTENSION.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_deterministic() {
        let a = CacheKey::from_locator("https://cdn.example.com/v/123.mp4");
        let b = CacheKey::from_locator("https://cdn.example.com/v/123.mp4");
        assert_eq!(a, b);
        assert!(CacheKey::is_valid(a.as_str()));
        assert!(!CacheKey::is_valid("holiday"));
    }

    #[test]
    fn equivalent_urls_share_a_key() {
        let a = CacheKey::from_locator("HTTPS://CDN.example.com:443/v/123.mp4#t=10");
        let b = CacheKey::from_locator("  https://cdn.example.com/v/123.mp4 ");
        assert_eq!(a, b);
    }

    #[test]
    fn distinct_sources_have_distinct_keys() {
        let a = CacheKey::from_locator("https://cdn.example.com/v/123.mp4");
        let b = CacheKey::from_locator("https://cdn.example.com/v/124.mp4");
        let c = CacheKey::from_locator("https://cdn.example.com/v/123.mp4?q=720");
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn detects_manifests() {
        assert!(is_manifest("https://cdn.example.com/live/index.m3u8"));
        assert!(is_manifest("https://cdn.example.com/v/stream.MPD?token=x"));
        assert!(is_manifest("https://cdn.example.com/v/video.ism/Manifest"));
        assert!(!is_manifest("https://cdn.example.com/v/123.mp4"));
        assert!(!is_manifest("https://cdn.example.com/v/m3u8-guide.mp4"));
    }

    #[test]
    fn picks_file_extension() {
        assert_eq!(file_extension("https://cdn.example.com/v/123.webm?x=1"), "webm");
        assert_eq!(file_extension("https://cdn.example.com/v/123"), "mp4");
        assert_eq!(file_extension("https://cdn.example.com/v/a.b$d"), "mp4");
    }
}
