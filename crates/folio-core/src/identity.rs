//! Chapter identity
//!
//! A chapter's stable ID is derived from its content, number and title so
//! the same logical chapter resolves to the same identity no matter which
//! URL it was fetched from. URLs themselves are only access keys; they are
//! normalized before being indexed.
//!
//! There is exactly one stable-ID algorithm: SHA-256 over the trimmed
//! content and title, truncated to hex prefixes. Identifiers produced by
//! any other hashing scheme are not interchangeable with these.

use sha2::{Digest, Sha256};
use url::Url;

/// Hex characters kept from the content digest
const CONTENT_HASH_LEN: usize = 16;
/// Hex characters kept from the title digest
const TITLE_HASH_LEN: usize = 8;

/// Compute the stable ID for a chapter
///
/// Format: `ch{number}_{content_hash}_{title_hash}`, with `x` standing in
/// for an unknown chapter number. Pure and deterministic.
pub fn stable_chapter_id(content: &str, chapter_number: Option<i64>, title: &str) -> String {
    let number = chapter_number
        .map(|n| n.to_string())
        .unwrap_or_else(|| "x".to_string());
    format!(
        "ch{}_{}_{}",
        number,
        digest_prefix(content.trim(), CONTENT_HASH_LEN),
        digest_prefix(title.trim(), TITLE_HASH_LEN)
    )
}

/// Deterministic stand-in ID for a translation whose chapter is unknown
///
/// Derived from the normalized chapter URL, so repeated translations of
/// the same URL share one identity until the chapter itself is stored.
pub fn fallback_stable_id(chapter_url: &str) -> String {
    format!(
        "url_{}",
        digest_prefix(&normalize_url(chapter_url), CONTENT_HASH_LEN)
    )
}

/// Normalize a URL for indexing
///
/// Strips the query string, fragment, and trailing slashes. Scheme and host
/// are lower-cased by the parser. Input that does not parse as an absolute
/// URL is returned trimmed but otherwise unchanged.
pub fn normalize_url(raw: &str) -> String {
    let trimmed = raw.trim();
    match Url::parse(trimmed) {
        Ok(mut url) => {
            url.set_query(None);
            url.set_fragment(None);
            url.as_str().trim_end_matches('/').to_string()
        }
        Err(_) => trimmed.to_string(),
    }
}

fn digest_prefix(input: &str, len: usize) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let mut encoded = hex::encode(digest);
    encoded.truncate(len);
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_id_is_deterministic() {
        let a = stable_chapter_id("Once upon a time", Some(3), "Chapter 3");
        let b = stable_chapter_id("Once upon a time", Some(3), "Chapter 3");
        assert_eq!(a, b);
        assert!(a.starts_with("ch3_"));
        assert_eq!(a.len(), "ch3_".len() + CONTENT_HASH_LEN + 1 + TITLE_HASH_LEN);
    }

    #[test]
    fn test_stable_id_known_value() {
        // Pinned so identifiers stay stable across releases
        let id = stable_chapter_id("", None, "");
        assert_eq!(id, "chx_e3b0c44298fc1c14_e3b0c442");
    }

    #[test]
    fn test_stable_id_varies_with_inputs() {
        let base = stable_chapter_id("content", Some(1), "Title");
        assert_ne!(base, stable_chapter_id("content!", Some(1), "Title"));
        assert_ne!(base, stable_chapter_id("content", Some(2), "Title"));
        assert_ne!(base, stable_chapter_id("content", Some(1), "Title 2"));
        assert_ne!(base, stable_chapter_id("content", None, "Title"));
    }

    #[test]
    fn test_stable_id_ignores_surrounding_whitespace() {
        assert_eq!(
            stable_chapter_id("  body \n", Some(1), " Title "),
            stable_chapter_id("body", Some(1), "Title")
        );
    }

    #[test]
    fn test_normalize_strips_query_fragment_and_slash() {
        let expected = "https://example.com/novel/chapter-1";
        assert_eq!(normalize_url("https://example.com/novel/chapter-1"), expected);
        assert_eq!(normalize_url("https://example.com/novel/chapter-1/"), expected);
        assert_eq!(
            normalize_url("https://example.com/novel/chapter-1?ref=home"),
            expected
        );
        assert_eq!(
            normalize_url("https://example.com/novel/chapter-1#comments"),
            expected
        );
        assert_eq!(
            normalize_url("https://example.com/novel/chapter-1/?a=1&b=2#top"),
            expected
        );
    }

    #[test]
    fn test_normalize_lowercases_host() {
        assert_eq!(
            normalize_url("HTTPS://Example.COM/Path"),
            "https://example.com/Path"
        );
    }

    #[test]
    fn test_normalize_root_path() {
        assert_eq!(normalize_url("https://example.com/"), "https://example.com");
        assert_eq!(normalize_url("https://example.com"), "https://example.com");
    }

    #[test]
    fn test_normalize_unparseable_returns_original() {
        assert_eq!(normalize_url("  not a url  "), "not a url");
        assert_eq!(normalize_url("relative/path?x=1"), "relative/path?x=1");
    }

    #[test]
    fn test_fallback_id_shares_normalization() {
        assert_eq!(
            fallback_stable_id("https://example.com/c/1?utm=x"),
            fallback_stable_id("https://example.com/c/1/")
        );
        assert!(fallback_stable_id("https://example.com/c/1").starts_with("url_"));
    }
}
