//! robots.txt resolution and `Sitemap:` line parsing.

use crate::context::{BudgetScope, RunContext};
use crate::net::{Fetcher, PageRenderer};
use crate::utils::{host_of, normalize_root_url, truncate_for_log};
use serde::Serialize;
use std::fmt;
use tracing::{info, instrument, warn};
use url::Url;

/// What happened to the one-shot browser retry for robots.txt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BrowserRetryStatus {
    NotAttempted,
    NotNeeded,
    Bypassed,
    Failed,
    Disabled,
}

impl BrowserRetryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrowserRetryStatus::NotAttempted => "not_attempted",
            BrowserRetryStatus::NotNeeded => "not_needed",
            BrowserRetryStatus::Bypassed => "bypassed",
            BrowserRetryStatus::Failed => "failed",
            BrowserRetryStatus::Disabled => "disabled",
        }
    }
}

impl fmt::Display for BrowserRetryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RobotsOutcome {
    /// Normalised `scheme://host` root the file was fetched from.
    pub root: String,
    pub text: String,
    pub found: bool,
    pub browser_retry_status: BrowserRetryStatus,
    pub status: Option<u16>,
}

fn blocks_direct_fetch(status: u16) -> bool {
    (300..400).contains(&status) || status == 401 || status == 403
}

/// Fetch `/robots.txt` for a seed URL.
///
/// Redirects are not followed: a 3xx, 401 or 403 is treated as a block and,
/// when `browser_retry` is on, spends the host's single robots browser
/// attempt. Failures are reported through `found = false`.
#[instrument(level = "info", skip_all, fields(site = %site_url))]
pub async fn resolve<H, B>(
    http: &H,
    browser: &B,
    ctx: &RunContext,
    site_url: &str,
    browser_retry: bool,
) -> RobotsOutcome
where
    H: Fetcher,
    B: PageRenderer,
{
    let root = normalize_root_url(site_url);
    let robots_url = format!("{root}/robots.txt");
    let mut outcome = RobotsOutcome {
        root: root.clone(),
        text: String::new(),
        found: false,
        browser_retry_status: BrowserRetryStatus::NotAttempted,
        status: None,
    };

    let resp = match http.get_no_redirect(&robots_url).await {
        Ok(r) => r,
        Err(e) => {
            warn!(url = %robots_url, error = %e, "robots.txt fetch failed");
            return outcome;
        }
    };
    outcome.status = Some(resp.status);

    if resp.is_success() {
        let text = resp.text();
        if !text.trim().is_empty() {
            outcome.text = text;
            outcome.found = true;
            outcome.browser_retry_status = BrowserRetryStatus::NotNeeded;
            info!(bytes = outcome.text.len(), "robots.txt found");
        }
        return outcome;
    }

    if !blocks_direct_fetch(resp.status) {
        info!(status = resp.status, "robots.txt not available");
        return outcome;
    }
    if !browser_retry {
        outcome.browser_retry_status = BrowserRetryStatus::Disabled;
        return outcome;
    }
    if !ctx.take_browser_attempt(BudgetScope::Robots, &host_of(&root)) {
        info!("robots.txt browser budget already spent for host");
        return outcome;
    }

    match browser.inner_text(&robots_url).await {
        Ok(text) if !text.trim().is_empty() => {
            info!(
                status = resp.status,
                preview = %truncate_for_log(text.trim(), 120),
                "robots.txt retrieved through browser"
            );
            outcome.text = text;
            outcome.found = true;
            outcome.browser_retry_status = BrowserRetryStatus::Bypassed;
        }
        Ok(_) => {
            warn!("Browser returned empty robots.txt");
            outcome.browser_retry_status = BrowserRetryStatus::Failed;
        }
        Err(e) => {
            warn!(error = %e, "Browser robots.txt retry failed");
            outcome.browser_retry_status = BrowserRetryStatus::Failed;
        }
    }
    outcome
}

/// `Sitemap:` values from robots.txt, absolutised against `base` and
/// deduplicated in order of appearance.
pub fn parse_sitemaps(robots_text: &str, base: &str) -> Vec<String> {
    let base_url = Url::parse(base).ok();
    let mut out: Vec<String> = Vec::new();
    for line in robots_text.lines() {
        let line = line.trim();
        let Some(prefix) = line.get(..8) else {
            continue;
        };
        if !prefix.eq_ignore_ascii_case("sitemap:") {
            continue;
        }
        let value = line[8..].trim();
        if value.is_empty() {
            continue;
        }
        let joined = match &base_url {
            Some(b) => b.join(value).map(|u| u.to_string()).unwrap_or_else(|_| value.to_string()),
            None => value.to_string(),
        };
        if !out.contains(&joined) {
            out.push(joined);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::browser::testing::FakeRenderer;
    use crate::net::http::testing::FakeFetcher;

    #[test]
    fn parses_sitemap_lines() {
        let txt = "User-agent: *\nDisallow: /admin\nSitemap: https://a.test/news.xml\nsitemap: /rel.xml\nSITEMAP:https://a.test/news.xml\nSitemap:\n";
        assert_eq!(
            parse_sitemaps(txt, "https://a.test"),
            vec!["https://a.test/news.xml", "https://a.test/rel.xml"]
        );
    }

    #[tokio::test]
    async fn found_directly() {
        let http = FakeFetcher::new().route("https://a.test/robots.txt", 200, "Sitemap: /s.xml\n");
        let browser = FakeRenderer::new();
        let ctx = RunContext::new();
        let out = resolve(&http, &browser, &ctx, "a.test/some/path", true).await;
        assert!(out.found);
        assert_eq!(out.root, "https://a.test");
        assert_eq!(out.browser_retry_status, BrowserRetryStatus::NotNeeded);
        assert_eq!(browser.call_count(), 0);
    }

    #[tokio::test]
    async fn blocked_robots_bypassed_once_per_host() {
        let http = FakeFetcher::new().route("https://a.test/robots.txt", 403, "denied");
        let browser = FakeRenderer::new().page("https://a.test/robots.txt", "Sitemap: https://a.test/s.xml");
        let ctx = RunContext::new();

        let first = resolve(&http, &browser, &ctx, "https://a.test", true).await;
        assert!(first.found);
        assert_eq!(first.browser_retry_status, BrowserRetryStatus::Bypassed);

        let second = resolve(&http, &browser, &ctx, "https://a.test", true).await;
        assert!(!second.found);
        assert_eq!(second.browser_retry_status, BrowserRetryStatus::NotAttempted);
        assert_eq!(browser.call_count(), 1);
    }

    #[tokio::test]
    async fn redirect_with_retry_disabled() {
        let http = FakeFetcher::new().route("https://a.test/robots.txt", 301, "");
        let browser = FakeRenderer::new();
        let ctx = RunContext::new();
        let out = resolve(&http, &browser, &ctx, "https://a.test", false).await;
        assert!(!out.found);
        assert_eq!(out.browser_retry_status, BrowserRetryStatus::Disabled);
    }

    #[tokio::test]
    async fn not_found_is_not_retried() {
        let http = FakeFetcher::new();
        let browser = FakeRenderer::new();
        let ctx = RunContext::new();
        let out = resolve(&http, &browser, &ctx, "https://a.test", true).await;
        assert!(!out.found);
        assert_eq!(out.status, Some(404));
        assert_eq!(browser.call_count(), 0);
    }

    #[tokio::test]
    async fn failed_browser_retry_is_reported() {
        let http = FakeFetcher::new().route("https://a.test/robots.txt", 401, "");
        let browser = FakeRenderer::new();
        let ctx = RunContext::new();
        let out = resolve(&http, &browser, &ctx, "https://a.test", true).await;
        assert_eq!(out.browser_retry_status, BrowserRetryStatus::Failed);
    }
}
