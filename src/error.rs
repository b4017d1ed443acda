//! Error taxonomy shared by every discovery and extraction stage.
//!
//! Stages return [`CrawlError`]; callers inspect [`CrawlError::kind`] to
//! decide whether to advance to the next fallback. Nothing in here is fatal
//! to a run: the pipeline turns errors into reason strings on the site's
//! record and moves on.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Stable, serialisable error categories written into stream records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RobotsMissing,
    SitemapsMissing,
    NoRecentLeaves,
    SelectorDetectionFailed,
    AccessBlocked,
    HttpError,
    BrowserFetchError,
    EmptyHtml,
    NoSectionsFound,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::RobotsMissing => "robots_missing",
            ErrorKind::SitemapsMissing => "sitemaps_missing",
            ErrorKind::NoRecentLeaves => "no_recent_leaves",
            ErrorKind::SelectorDetectionFailed => "selector_detection_failed",
            ErrorKind::AccessBlocked => "access_blocked",
            ErrorKind::HttpError => "http_error",
            ErrorKind::BrowserFetchError => "browser_fetch_error",
            ErrorKind::EmptyHtml => "empty_html",
            ErrorKind::NoSectionsFound => "no_sections_found",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type Result<T> = std::result::Result<T, CrawlError>;

#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("no sitemaps found for {0}")]
    SitemapsMissing(String),

    #[error("selector detection failed: {0}")]
    SelectorDetection(String),

    #[error("access blocked ({subtype}) for {url}")]
    AccessBlocked { url: String, subtype: String },

    #[error("HTTP {status} for {url}")]
    Status { url: String, status: u16 },

    #[error("network error: {0}")]
    Network(String),

    #[error("browser fetch failed: {0}")]
    Browser(String),

    #[error("rendered page was empty: {0}")]
    EmptyHtml(String),

    #[error("no sections found: {0}")]
    NoSections(String),

    #[error("invalid XML: {0}")]
    Xml(String),

    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("concurrency limiter closed")]
    Closed(#[from] tokio::sync::AcquireError),
}

impl From<reqwest::Error> for CrawlError {
    fn from(err: reqwest::Error) -> Self {
        CrawlError::Network(err.to_string())
    }
}

impl From<quick_xml::Error> for CrawlError {
    fn from(err: quick_xml::Error) -> Self {
        CrawlError::Xml(err.to_string())
    }
}

impl CrawlError {
    /// Map onto the user-visible taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CrawlError::SitemapsMissing(_) => ErrorKind::SitemapsMissing,
            CrawlError::SelectorDetection(_) => ErrorKind::SelectorDetectionFailed,
            CrawlError::AccessBlocked { .. } => ErrorKind::AccessBlocked,
            CrawlError::Browser(_) => ErrorKind::BrowserFetchError,
            CrawlError::EmptyHtml(_) => ErrorKind::EmptyHtml,
            CrawlError::NoSections(_) => ErrorKind::NoSectionsFound,
            CrawlError::Status { .. }
            | CrawlError::Network(_)
            | CrawlError::Xml(_)
            | CrawlError::Url(_)
            | CrawlError::Json(_)
            | CrawlError::Io(_)
            | CrawlError::Closed(_) => ErrorKind::HttpError,
        }
    }

    /// Whether a later attempt on another path may still succeed.
    ///
    /// WAF challenges, redirects, 429 and the usual transient 5xx codes are
    /// retryable; a 401/403 without a WAF signature is terminal.
    pub fn retryable(&self) -> bool {
        match self {
            CrawlError::AccessBlocked { subtype, .. } => !matches!(subtype.as_str(), "401" | "403"),
            CrawlError::Status { status, .. } => {
                (300..400).contains(status) || matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
            }
            CrawlError::Network(_) => true,
            _ => false,
        }
    }
}
