//! Utility functions for string handling, URL normalisation and file system checks.
//!
//! This module provides helper functions used throughout the application:
//! - String truncation for logging
//! - JSON error detection for handling truncated detector responses
//! - Host/domain normalisation shared by the fetch and budget logic
//! - Pipe-joined note merging for overview rows
//! - File system validation for output directories

use chrono::Local;
use std::error::Error;
use std::fs as stdfs;
use std::path::Path;
use tokio::fs;
use tracing::{info, instrument};
use url::Url;

/// Truncate a string for logging purposes.
///
/// Long strings are cut at a char boundary at or below `max` bytes with an
/// ellipsis and byte count indicator appended.
///
/// # Examples
///
/// ```ignore
/// assert_eq!(truncate_for_log("short", 100), "short");
/// assert_eq!(truncate_for_log(&"a".repeat(500), 10), "aaaaaaaaaa…(+490 bytes)");
/// ```
pub fn truncate_for_log(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let cut = floor_boundary(s, max);
    format!("{}…(+{} bytes)", &s[..cut], s.len() - cut)
}

/// Largest char boundary `<= idx`.
pub fn floor_boundary(s: &str, idx: usize) -> usize {
    if idx >= s.len() {
        return s.len();
    }
    let mut i = idx;
    while !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Detect if a serde_json error indicates truncated/incomplete JSON.
///
/// When the detector response is cut off by token limits the JSON fails to
/// parse with an EOF error; callers re-ask once in that case.
pub fn looks_truncated(e: &serde_json::Error) -> bool {
    use serde_json::error::Category;
    matches!(e.classify(), Category::Eof)
}

/// Lower-cased `host[:port]` of a URL, or an empty string.
pub fn domain_of(url: &str) -> String {
    match Url::parse(url) {
        Ok(u) => {
            let host = u.host_str().unwrap_or_default().to_lowercase();
            match u.port() {
                Some(p) => format!("{host}:{p}"),
                None => host,
            }
        }
        Err(_) => String::new(),
    }
}

/// Lower-cased host without port.
pub fn host_of(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_lowercase()))
        .unwrap_or_default()
}

pub fn strip_www(host: &str) -> &str {
    host.strip_prefix("www.").unwrap_or(host)
}

/// `https://host` root for a seed that may lack a scheme or carry a path.
pub fn normalize_root_url(raw: &str) -> String {
    let trimmed = raw.trim();
    let with_scheme = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed.trim_start_matches('/'))
    };
    match Url::parse(&with_scheme) {
        Ok(u) => match u.host_str() {
            Some(h) => match u.port() {
                Some(p) => format!("{}://{}:{}", u.scheme(), h, p),
                None => format!("{}://{}", u.scheme(), h),
            },
            None => with_scheme.trim_end_matches('/').to_string(),
        },
        Err(_) => with_scheme.trim_end_matches('/').to_string(),
    }
}

/// Merge a note into a ` | `-joined accumulator, deduplicated and capped.
///
/// Notes that do not fit under `max_len` are dropped whole; only a lone
/// first note longer than the cap is cut.
pub fn merge_note(prev: &str, new: &str, max_len: usize) -> String {
    const SEP: &str = " | ";
    let new = new.trim();
    let mut parts: Vec<&str> = prev
        .split(SEP)
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    if !new.is_empty() && !parts.contains(&new) {
        parts.push(new);
    }
    let mut out = String::new();
    for part in parts {
        if out.is_empty() {
            out.push_str(&part[..floor_boundary(part, max_len)]);
        } else if out.len() + SEP.len() + part.len() <= max_len {
            out.push_str(SEP);
            out.push_str(part);
        } else {
            break;
        }
    }
    out
}

/// Local timestamp in the stream's `YYYY-MM-DD HH:MM:SS` form.
pub fn stream_ts() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

pub fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

/// Ensure the parent directory of `path` exists and is writable.
///
/// Creates the directory if needed, then writes and removes a probe file.
#[instrument(level = "info", skip_all, fields(path = %path.display()))]
pub async fn ensure_writable_parent(path: &Path) -> Result<(), Box<dyn Error>> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => Path::new(".").to_path_buf(),
    };
    if let Err(e) = fs::create_dir_all(&dir).await {
        return Err(Box::new(e));
    }
    // Try a small sync write using std fs (simpler error surface)
    let probe_path = dir.join("..__probe_write__");
    match stdfs::File::create(&probe_path) {
        Ok(_) => {
            let _ = stdfs::remove_file(&probe_path);
            info!("Output directory is writable");
            Ok(())
        }
        Err(e) => Err(Box::new(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_for_log_short_string() {
        let s = "Hello, world!";
        assert_eq!(truncate_for_log(s, 100), "Hello, world!");
    }

    #[test]
    fn test_truncate_for_log_long_string() {
        let s = "a".repeat(500);
        let result = truncate_for_log(&s, 100);
        assert!(result.starts_with(&"a".repeat(100)));
        assert!(result.contains("…(+400 bytes)"));
    }

    #[test]
    fn test_truncate_for_log_multibyte() {
        let s = "é".repeat(10);
        let result = truncate_for_log(&s, 3);
        assert!(result.starts_with('é'));
        assert!(result.contains("…(+18 bytes)"));
    }

    #[test]
    fn test_looks_truncated() {
        let json_eof = r#"{"field": "value"#;
        let result: Result<serde_json::Value, _> = serde_json::from_str(json_eof);
        if let Err(e) = result {
            assert!(looks_truncated(&e));
        }
    }

    #[test]
    fn test_domain_and_host() {
        assert_eq!(domain_of("https://WWW.News.test/a?b=1"), "www.news.test");
        assert_eq!(domain_of("http://news.test:8080/x"), "news.test:8080");
        assert_eq!(domain_of("not a url"), "");
        assert_eq!(host_of("http://news.test:8080/x"), "news.test");
        assert_eq!(strip_www("www.news.test"), "news.test");
    }

    #[test]
    fn test_normalize_root_url() {
        assert_eq!(normalize_root_url("news.test/path"), "https://news.test");
        assert_eq!(normalize_root_url("http://news.test/"), "http://news.test");
        assert_eq!(normalize_root_url(" https://news.test:8443/a "), "https://news.test:8443");
    }

    #[test]
    fn test_merge_note_dedupes_and_caps() {
        let merged = merge_note("", "discovery: robots_missing", 300);
        assert_eq!(merged, "discovery: robots_missing");
        let merged = merge_note(&merged, "discovery: robots_missing", 300);
        assert_eq!(merged, "discovery: robots_missing");
        let merged = merge_note(&merged, "extraction: sitemap_zero", 300);
        assert_eq!(merged, "discovery: robots_missing | extraction: sitemap_zero");
        assert_eq!(merge_note(&merged, "x", 10).len(), 10);
    }

    #[test]
    fn test_merge_note_drops_whole_notes_at_the_cap() {
        let mut acc = String::new();
        for _ in 0..5 {
            acc = merge_note(&acc, "alpha beta", 30);
            acc = merge_note(&acc, "gamma delta", 30);
            acc = merge_note(&acc, "epsilon zeta", 30);
        }
        assert_eq!(acc, "alpha beta | gamma delta");
        assert!(acc.len() <= 30);
        assert_eq!(merge_note(&acc, "gamma delta", 30), acc);
    }

    #[test]
    fn test_round3() {
        assert_eq!(round3(1.23456), 1.235);
    }
}
