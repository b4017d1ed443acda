//! Homepage navigation crawl for CSS detection.
//!
//! The homepage's primary navigation (`<nav>` blocks, the smallest
//! `<header>`, nav-like containers) is scanned for same-site section links.
//! Each page is then run through single-page detection and the sections are
//! merged, ranked by how many pages they were seen on.

use crate::api::AskAsync;
use crate::detect::ask_json;
use crate::detect::css::{CssDetector, signature};
use crate::error::{CrawlError, Result};
use crate::models::{CssSection, CssSelectorsReport};
use crate::net::{Fetcher, PageRenderer};
use crate::utils::{floor_boundary, strip_www};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, info, instrument, warn};
use url::Url;

pub const DETECTION_METHOD: &str = "css_crawler";

const MAX_SNIPPET_BYTES: usize = 150_000;
const MAX_RULE_DEPTH: usize = 2;
const NAV_CLASS_HINTS: [&str; 7] = ["navbar", "primary-nav", "site-nav", "global-nav", "top-nav", "main-nav", "menu"];

const DENY_TERMS: [&str; 32] = [
    "tourism", "travel", "photo", "photos", "gallery", "lifestyle", "culture", "entertainment", "video", "live",
    "tv", "radio", "weather", "game", "games", "crossword", "puzzle", "horoscope", "cooking", "food", "recipe",
    "recipes", "shop", "store", "classified", "classifieds", "job", "jobs", "career", "careers", "about",
    "contact",
];
const ALLOW_TERMS: [&str; 13] = [
    "stock", "stocks", "market", "markets", "equities", "quote", "quotes", "ticker", "symbol", "index", "indices",
    "invest", "investing",
];

static NAV_ALLOW_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)/(news|world|business|market|markets|tech|science|sport|sports|health|politics|opinion|culture)(/|$)")
        .expect("static regex")
});
static NAV_DENY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(search|login|signin|subscribe|account|cart|shop|store|advert|ads|promo|sponsor|podcast|video|live|tv|radio|newsletter|lang|edition|about|contact|careers|privacy|terms)")
        .expect("static regex")
});

/// Raw navigation hrefs and the markup they came from.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct NavScan {
    pub hrefs: Vec<String>,
    pub snippet: String,
}

fn selector(css: &str) -> Selector {
    Selector::parse(css).expect("static selector")
}

/// Collect navigation hrefs in document order.
pub fn scan_navigation(html: &str) -> NavScan {
    let doc = Html::parse_document(html);
    let anchors = selector("a[href]");
    let mut containers = Vec::new();

    containers.extend(doc.select(&selector("nav")));
    if let Some(header) = doc.select(&selector("header")).min_by_key(|h| h.html().len()) {
        containers.push(header);
    }
    let hinted = NAV_CLASS_HINTS
        .iter()
        .map(|h| format!(r#"[class*="{h}"], [id*="{h}"]"#))
        .collect::<Vec<_>>()
        .join(", ");
    containers.extend(doc.select(&selector(&hinted)));

    let mut scan = NavScan::default();
    for c in containers {
        scan.snippet.push_str(&c.html());
        scan.snippet.push_str("\n\n");
        scan.hrefs
            .extend(c.select(&anchors).filter_map(|a| a.value().attr("href")).map(|h| h.trim().to_string()));
    }
    if scan.snippet.is_empty() {
        scan.snippet = html[..floor_boundary(html, MAX_SNIPPET_BYTES)].to_string();
    } else {
        scan.snippet.truncate(floor_boundary(&scan.snippet, MAX_SNIPPET_BYTES));
    }
    scan
}

/// Absolute same-site form of `href`: `scheme://host[:port]/path`, with the
/// query and fragment dropped. The `www.` prefix is ignored when comparing
/// hosts.
pub fn same_site_link(base: &Url, href: &str) -> Option<Url> {
    let mut u = base.join(href).ok()?;
    if !matches!(u.scheme(), "http" | "https") {
        return None;
    }
    let host = u.host_str()?.to_lowercase();
    let base_host = base.host_str()?.to_lowercase();
    if strip_www(&host) != strip_www(&base_host) {
        return None;
    }
    u.set_query(None);
    u.set_fragment(None);
    Some(u)
}

fn path_depth(u: &Url) -> usize {
    u.path().split('/').filter(|s| !s.is_empty()).count()
}

/// Deny regex rejects; otherwise allowed sections pass at any depth and
/// other links only up to two path segments.
pub fn passes_nav_rules(u: &Url) -> bool {
    let low = u.as_str().to_lowercase();
    if NAV_DENY_RE.is_match(&low) {
        return false;
    }
    NAV_ALLOW_RE.is_match(&low) || path_depth(u) <= MAX_RULE_DEPTH
}

/// Rule-filtered, deduplicated navigation links.
pub fn filter_nav_links(base: &Url, hrefs: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for href in hrefs {
        let Some(u) = same_site_link(base, href) else {
            continue;
        };
        if passes_nav_rules(&u) && !out.iter().any(|o| o == u.as_str()) {
            out.push(u.to_string());
        }
    }
    out
}

pub fn build_nav_prompt(base_url: &str, snippet: &str) -> String {
    format!(
        r#"You are given HTML from the top of a news website.
Return ONLY primary navigation links from the site header or top navbar that lead to STOCKS or MARKETS pages:
market news, quotes, indices, tickers, equities. Ignore generic sections and non-market pages.
Exclude tourism, travel, photos, lifestyle, entertainment, video, live, tv, radio, weather, games, puzzles,
horoscopes, food, recipes, shop, classifieds, jobs, about and contact pages, and utility links such as search,
login, subscribe, account, newsletter, language or edition switches, privacy and terms.

Output JSON ONLY:
{{"links": [{{"label": "...", "href": "https://...", "reason": "markets|stocks news|quotes|indices|tickers"}}]}}

Base URL: {base_url}
HTML:
{snippet}"#
    )
}

/// Links picked by the detector, kept only when they are same-site, pass the
/// navigation rules, avoid the deny terms and mention a market term.
pub fn parse_nav_reply(base: &Url, v: &Value) -> Vec<String> {
    let Some(items) = v.get("links").and_then(Value::as_array) else {
        return Vec::new();
    };
    let mut out: Vec<String> = Vec::new();
    for it in items {
        let text = |k: &str| it.get(k).and_then(Value::as_str).unwrap_or_default().trim().to_lowercase();
        let href = it.get("href").and_then(Value::as_str).unwrap_or_default().trim();
        if href.is_empty() {
            continue;
        }
        let Some(u) = same_site_link(base, href) else {
            continue;
        };
        if !passes_nav_rules(&u) {
            continue;
        }
        let haystacks = [text("label"), u.as_str().to_lowercase(), text("reason")];
        if DENY_TERMS.iter().any(|t| haystacks.iter().any(|h| h.contains(t))) {
            continue;
        }
        if !ALLOW_TERMS.iter().any(|t| haystacks.iter().any(|h| h.contains(t))) {
            continue;
        }
        if !out.iter().any(|o| o == u.as_str()) {
            out.push(u.to_string());
        }
    }
    out
}

/// Merge per-page sections: one per signature with the best confidence,
/// `support` set to the number of pages it was seen on, ranked by support
/// then confidence.
pub fn merge_sections(pages: Vec<Vec<CssSection>>) -> Vec<CssSection> {
    let mut order: Vec<String> = Vec::new();
    let mut by_sig: HashMap<String, (u32, CssSection)> = HashMap::new();
    for page in pages {
        for section in page {
            let sig = signature(&section.selectors);
            match by_sig.get_mut(&sig) {
                Some((count, best)) => {
                    *count += 1;
                    if section.confidence > best.confidence {
                        *best = section;
                    }
                }
                None => {
                    order.push(sig.clone());
                    by_sig.insert(sig, (1, section));
                }
            }
        }
    }
    let mut merged: Vec<CssSection> = order
        .into_iter()
        .filter_map(|sig| by_sig.remove(&sig))
        .map(|(count, mut best)| {
            best.support = Some(count);
            best
        })
        .collect();
    merged.sort_by(|a, b| {
        b.support
            .cmp(&a.support)
            .then(b.confidence.total_cmp(&a.confidence))
    });
    merged
}

/// Runs single-page detection over the homepage and its navigation links.
pub struct NavCrawler<'a, H, B, L> {
    http: &'a H,
    css: &'a CssDetector<'a, B, L>,
    scan_limit: usize,
}

impl<'a, H, B, L> NavCrawler<'a, H, B, L>
where
    H: Fetcher,
    B: PageRenderer,
    L: AskAsync<Response = String>,
{
    pub fn new(http: &'a H, css: &'a CssDetector<'a, B, L>, scan_limit: usize) -> Self {
        Self { http, css, scan_limit }
    }

    async fn homepage_html(&self, url: &str) -> Option<String> {
        match self.http.get(url).await {
            Ok(resp) if resp.is_success() && !resp.body.is_empty() => return Some(resp.text()),
            Ok(resp) => debug!(status = resp.status, "Homepage not fetched directly"),
            Err(e) => debug!(error = %e, "Homepage not fetched directly"),
        }
        match self.css.browser().render(url).await {
            Ok(page) => Some(page.html),
            Err(e) => {
                warn!(error = %e, "Homepage render failed");
                None
            }
        }
    }

    /// Section links from the homepage navigation. The detector's picks win;
    /// when it picks nothing the rule-filtered links are used.
    #[instrument(level = "info", skip(self))]
    pub async fn nav_links(&self, url: &str) -> Vec<String> {
        let Ok(base) = Url::parse(url) else {
            return Vec::new();
        };
        let Some(html) = self.homepage_html(url).await else {
            return Vec::new();
        };
        let scan = scan_navigation(&html);

        if !scan.snippet.trim().is_empty() {
            let prompt = build_nav_prompt(url, &scan.snippet);
            match ask_json(self.css.detector(), &prompt).await {
                Ok(v) => {
                    let picked = parse_nav_reply(&base, &v);
                    if !picked.is_empty() {
                        info!(links = picked.len(), "Navigation links picked by detector");
                        return picked;
                    }
                }
                Err(reason) => debug!(reason = %reason, "Navigation detector reply unusable"),
            }
        }
        let links = filter_nav_links(&base, &scan.hrefs);
        info!(raw = scan.hrefs.len(), kept = links.len(), "Navigation links filtered by rules");
        links
    }

    /// Detect sections on the homepage and every navigation page.
    #[instrument(level = "info", skip(self))]
    pub async fn crawl(&self, url: &str) -> Result<CssSelectorsReport> {
        let mut links = self.nav_links(url).await;
        let total_links = links.len();
        if self.scan_limit > 0 {
            links.truncate(self.scan_limit);
        }
        let home = Url::parse(url).map(|u| u.to_string()).unwrap_or_else(|_| url.to_string());
        let mut targets = vec![url.to_string()];
        targets.extend(links.into_iter().filter(|l| *l != home && l != url));
        info!(total_links, pages = targets.len(), scan_limit = self.scan_limit, "Crawling navigation pages");

        let mut pages = Vec::new();
        let mut chunks_processed = 0;
        let mut html_length = 0;
        for target in &targets {
            match self.css.single_page(target).await {
                Ok(report) => {
                    chunks_processed += report.chunks_processed;
                    html_length += report.html_length;
                    let sections = report
                        .sections
                        .into_iter()
                        .map(|mut s| {
                            s.source_url.get_or_insert_with(|| target.clone());
                            s
                        })
                        .collect();
                    pages.push(sections);
                }
                Err(e) => debug!(page = %target, error = %e, "No sections on page"),
            }
        }

        let sections = merge_sections(pages);
        if sections.is_empty() {
            return Err(CrawlError::NoSections(format!("{url}: no sections from homepage and links")));
        }
        Ok(CssSelectorsReport {
            detection_method: DETECTION_METHOD.to_string(),
            page_url: url.to_string(),
            html_length,
            chunks_processed,
            pages_scanned: targets.len(),
            total_sections: sections.len(),
            sections,
        })
    }
}
