//! Heuristic sitemap discovery for sites whose robots.txt is missing,
//! blocked, or lists nothing usable.
//!
//! Steps run in order and stop at the first one that yields a sitemap:
//! curated default paths, CMS paths, sitemap links on the homepage. When the
//! seed is a subdomain, the same steps are retried on the registrable
//! ("apex") domain.

use crate::context::{BudgetScope, RunContext};
use crate::error::{CrawlError, Result};
use crate::net::http::{classify, fetch_sitemap_bytes, probe};
use crate::net::{Fetcher, PageRenderer};
use crate::sitemap::xml::{DocKind, XmlElement, doc_kind, index_children, parse_document};
use crate::utils::{host_of, normalize_root_url, strip_www};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use tracing::{debug, info, instrument, warn};
use url::Url;

/// Candidate fetches allowed for the default-path step.
pub const MAX_DEFAULT_ATTEMPTS: usize = 150;
/// Homepage sitemap links validated at most.
pub const MAX_HOMEPAGE_LINKS: usize = 25;

const DEFAULT_NAMES: &[&str] = &[
    "sitemap.xml",
    "sitemap_index.xml",
    "sitemap1.xml",
    "sitemap-1.xml",
    "sitemaps/sitemap.xml",
    "sitemap/sitemap.xml",
    "news-sitemap.xml",
    "sitemap-news.xml",
    "video-sitemap.xml",
    "image-sitemap.xml",
    "post-sitemap.xml",
    "page-sitemap.xml",
    "category-sitemap.xml",
    // extended list
    "news",
    "news-sitemap",
    "news_sitemap",
    "newssitemap",
    "sitemap-news",
    "sitemap_news",
    "sitemapnews",
    "googlenews",
    "google-news-sitemap",
    "googlenews-sitemap",
    "sitemap-google-news",
    "sitemap_gnews",
    "sitemap-index",
    "sitemap_index",
    "sitemapindex",
    "index-sitemap",
    "sitemap-main",
    "sitemap-posts",
    "sitemap-sections",
    "sitemap_articles",
    "sitemap",
    "sitemaps",
    "site-map",
    "site_map",
    "siteindex",
    "sitemap1",
    "sitemap2",
    "sitemap-1",
    "sitemap_1",
    "sitemap-01",
    "sitemap_01",
    "google-sitemap",
    "google_sitemap",
    "googlesitemap",
    "xml-sitemap",
    "xml_sitemap",
    "main-sitemap",
    "wp-sitemap",
    "index",
    "main",
    "map",
    "sm",
];

const CMS_NAMES: &[&str] = &["wp-sitemap.xml", "sitemap_index.xml", "sitemap.xml"];

/// Public suffixes with more than one label that matter for apex escalation.
const MULTI_SUFFIXES: &[&str] = &[
    "com.au", "net.au", "org.au", "co.uk", "org.uk", "ac.uk", "gov.uk", "sch.uk", "com.br", "com.mx", "co.in",
    "co.jp", "co.nz", "com.sg", "com.tr", "com.hk",
];

static HREF_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"(?i)href=["']([^"']+)["']"#).expect("static regex"));
static REL_SITEMAP_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)rel=["']sitemap["']\s+href=["']([^"']+)["']"#).expect("static regex"));
static XML_START_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<(\?xml|urlset|sitemapindex|[a-z0-9_]+:urlset|[a-z0-9_]+:sitemapindex)").expect("static regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackStep {
    DefaultPaths,
    CmsPaths,
    HomepageLinks,
}

impl FallbackStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackStep::DefaultPaths => "fallback: default_paths",
            FallbackStep::CmsPaths => "fallback: cms_paths",
            FallbackStep::HomepageLinks => "fallback: homepage_links",
        }
    }
}

impl fmt::Display for FallbackStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sitemaps found by the probe and how they were found.
#[derive(Debug, Clone, PartialEq)]
pub struct FallbackHit {
    pub urls: Vec<String>,
    pub step: FallbackStep,
    /// Root the winning step ran against.
    pub root: String,
    pub apex: bool,
}

/// Counters describing how much probing was done, hit or miss.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbeTally {
    pub attempts: usize,
    pub block_detected: bool,
    pub browser_attempted: bool,
    pub browser_success: bool,
}

/// A candidate that parsed as a sitemap.
#[derive(Debug, Clone, PartialEq)]
enum Validated {
    /// Child `<loc>`s of a sitemap index.
    Index(Vec<String>),
    /// The candidate itself is a urlset.
    Urlset(String),
}

impl Validated {
    fn into_urls(self) -> Vec<String> {
        match self {
            Validated::Index(locs) => locs,
            Validated::Urlset(u) => vec![u],
        }
    }
}

/// `https://host`, `https://www.host`, `http://host` for a root URL.
pub fn base_variants(root: &str) -> Vec<String> {
    let host = host_of(root);
    if host.is_empty() {
        return vec![root.trim_end_matches('/').to_string()];
    }
    let port = Url::parse(root)
        .ok()
        .and_then(|u| u.port())
        .map(|p| format!(":{p}"))
        .unwrap_or_default();
    let bare = strip_www(&host);
    let mut out = Vec::new();
    for v in [
        format!("https://{bare}{port}"),
        format!("https://www.{bare}{port}"),
        format!("http://{bare}{port}"),
    ] {
        if !out.contains(&v) {
            out.push(v);
        }
    }
    out
}

/// Every default-path candidate in probe order, before the attempt cap.
pub fn default_candidates(root: &str) -> Vec<String> {
    let mut out = Vec::new();
    for base in base_variants(root) {
        for name in DEFAULT_NAMES {
            let low = name.to_lowercase();
            out.push(format!("{base}/{name}"));
            if low.ends_with(".xml") {
                out.push(format!("{base}/{name}.gz"));
            } else if !low.ends_with(".xml.gz") {
                out.push(format!("{base}/{name}.xml"));
                out.push(format!("{base}/{name}.xml.gz"));
            }
        }
    }
    out
}

/// Roots to retry discovery on when `url` is a subdomain of a registrable
/// domain. Empty when the host already is (or is `www.` of) that domain.
pub fn apex_roots(url: &str) -> Vec<String> {
    let host = host_of(url);
    let labels: Vec<&str> = host.split('.').filter(|l| !l.is_empty()).collect();
    if labels.len() < 3 {
        return Vec::new();
    }
    let suffix_labels = MULTI_SUFFIXES
        .iter()
        .find(|s| host == **s || host.ends_with(&format!(".{s}")))
        .map(|s| s.split('.').count())
        .unwrap_or(1);
    if labels.len() <= suffix_labels {
        return Vec::new();
    }
    let registrable = labels[labels.len() - suffix_labels - 1..].join(".");
    if host == registrable || host == format!("www.{registrable}") {
        return Vec::new();
    }
    vec![
        format!("https://{registrable}"),
        format!("https://www.{registrable}"),
        format!("http://{registrable}"),
    ]
}

/// Sitemap links advertised in homepage HTML, absolutised, deduplicated
/// and capped.
pub fn homepage_sitemap_links(html: &str, root: &str) -> Vec<String> {
    let base = Url::parse(&format!("{}/", root.trim_end_matches('/'))).ok();
    let mut raw: Vec<&str> = HREF_RE
        .captures_iter(html)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().trim())
        .filter(|h| {
            let low = h.to_lowercase();
            (low.ends_with(".xml") || low.ends_with(".xml.gz")) && low.contains("sitemap")
        })
        .collect();
    raw.extend(REL_SITEMAP_RE.captures_iter(html).filter_map(|c| c.get(1)).map(|m| m.as_str().trim()));

    let mut out: Vec<String> = Vec::new();
    for h in raw {
        let abs = match &base {
            Some(b) => match b.join(h) {
                Ok(u) => u.to_string(),
                Err(_) => continue,
            },
            None => h.to_string(),
        };
        if !out.contains(&abs) {
            out.push(abs);
        }
        if out.len() >= MAX_HOMEPAGE_LINKS {
            break;
        }
    }
    out
}

/// Parse XML out of browser-rendered text, skipping any viewer preamble.
pub fn parse_rendered_xml(text: &str) -> Option<XmlElement> {
    if let Ok(root) = parse_document(text.as_bytes()) {
        return Some(root);
    }
    let start = XML_START_RE.find(text)?.start();
    parse_document(text[start..].as_bytes()).ok()
}

fn validate_root(candidate: &str, root: &XmlElement) -> Option<Validated> {
    match doc_kind(root) {
        DocKind::Index => {
            let locs: Vec<String> = index_children(root).into_iter().map(|(loc, _)| loc).collect();
            (!locs.is_empty()).then_some(Validated::Index(locs))
        }
        DocKind::Urlset => Some(Validated::Urlset(candidate.to_string())),
        DocKind::Other => None,
    }
}

pub struct FallbackProbe<'a, H, B> {
    http: &'a H,
    browser: &'a B,
    ctx: &'a RunContext,
    browser_retry: bool,
}

impl<'a, H: Fetcher, B: PageRenderer> FallbackProbe<'a, H, B> {
    pub fn new(http: &'a H, browser: &'a B, ctx: &'a RunContext, browser_retry: bool) -> Self {
        Self {
            http,
            browser,
            ctx,
            browser_retry,
        }
    }

    /// Run the three steps against `root`.
    #[instrument(level = "info", skip(self, tally))]
    pub async fn discover(&self, root: &str, tally: &mut ProbeTally) -> Result<FallbackHit> {
        let root = normalize_root_url(root);

        for candidate in default_candidates(&root).into_iter().take(MAX_DEFAULT_ATTEMPTS) {
            if let Some(v) = self.validate(&candidate, tally).await {
                return Ok(self.hit(v, FallbackStep::DefaultPaths, &root));
            }
        }

        for base in base_variants(&root) {
            for name in CMS_NAMES {
                if let Some(v) = self.validate(&format!("{base}/{name}"), tally).await {
                    return Ok(self.hit(v, FallbackStep::CmsPaths, &root));
                }
            }
        }

        for candidate in self.homepage_candidates(&root).await {
            if let Some(v) = self.validate(&candidate, tally).await {
                return Ok(self.hit(v, FallbackStep::HomepageLinks, &root));
            }
        }

        info!(attempts = tally.attempts, "Fallback probe found no sitemap");
        Err(CrawlError::SitemapsMissing(root))
    }

    /// [`discover`](Self::discover) on each apex root of `url` in turn.
    #[instrument(level = "info", skip(self, tally))]
    pub async fn discover_apex(&self, url: &str, tally: &mut ProbeTally) -> Result<FallbackHit> {
        for root in apex_roots(url) {
            info!(root = %root, "Escalating to apex domain");
            if let Ok(mut hit) = self.discover(&root, tally).await {
                hit.apex = true;
                return Ok(hit);
            }
        }
        Err(CrawlError::SitemapsMissing(url.to_string()))
    }

    fn hit(&self, v: Validated, step: FallbackStep, root: &str) -> FallbackHit {
        let urls = v.into_urls();
        info!(step = step.as_str(), sitemaps = urls.len(), "Fallback sitemaps discovered");
        FallbackHit {
            urls,
            step,
            root: root.to_string(),
            apex: false,
        }
    }

    async fn homepage_candidates(&self, root: &str) -> Vec<String> {
        let html = match self.http.get(root).await {
            Ok(r) if r.is_success() && !r.body.is_empty() => r.text(),
            _ => {
                if !self.browser_retry || !self.looks_blocked(root).await {
                    return Vec::new();
                }
                match self.browser.render(root).await {
                    Ok(page) => page.html,
                    Err(e) => {
                        warn!(url = root, error = %e, "Homepage browser render failed");
                        return Vec::new();
                    }
                }
            }
        };
        let links = homepage_sitemap_links(&html, root);
        debug!(links = links.len(), "Homepage sitemap links");
        links
    }

    async fn looks_blocked(&self, url: &str) -> bool {
        probe(self.http, url)
            .await
            .as_ref()
            .and_then(classify)
            .is_some_and(|c| c.warrants_browser())
    }

    /// Fetch a candidate and check it is a sitemap; blocked candidates get the
    /// host's one browser attempt.
    async fn validate(&self, candidate: &str, tally: &mut ProbeTally) -> Option<Validated> {
        tally.attempts += 1;
        if let Ok(body) = fetch_sitemap_bytes(self.http, candidate).await {
            if !body.is_empty() {
                match parse_document(&body) {
                    Ok(root) if doc_kind(&root) != DocKind::Other => return validate_root(candidate, &root),
                    _ => debug!(candidate, "Candidate is not a sitemap document"),
                }
            }
        }

        if !self.browser_retry || candidate.to_lowercase().ends_with(".gz") {
            return None;
        }
        if !self.looks_blocked(candidate).await {
            return None;
        }
        tally.block_detected = true;
        if !self.ctx.take_browser_attempt(BudgetScope::SitemapProbe, &host_of(candidate)) {
            debug!(candidate, "Sitemap browser budget spent for host");
            return None;
        }
        tally.browser_attempted = true;
        info!(candidate, "Browser retry for blocked sitemap candidate");
        let text = match self.browser.inner_text(candidate).await {
            Ok(t) => t,
            Err(e) => {
                warn!(candidate, error = %e, "Browser sitemap retry failed");
                return None;
            }
        };
        let root = parse_rendered_xml(&text)?;
        let v = validate_root(candidate, &root)?;
        tally.browser_success = true;
        Some(v)
    }
}
