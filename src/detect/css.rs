//! CSS selector detection on rendered pages.
//!
//! A page is rendered through the browser, cut into character chunks and
//! each chunk is shown to the detector. Candidate selector sets are screened
//! by a strict and a lenient acceptance rule, then deduplicated by a content
//! signature.

use crate::api::AskAsync;
use crate::detect::{ask_json, parse_confidence};
use crate::error::{CrawlError, Result};
use crate::models::{CssSection, CssSelectorsReport};
use crate::net::PageRenderer;
use crate::utils::floor_boundary;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, instrument, warn};

pub const DEFAULT_CHUNK_SIZE: usize = 120_000;
pub const DETECTION_METHOD: &str = "css_fallback_browser";

/// Selector keys beyond `title` and `link` that a section may carry.
pub const OPTIONAL_KEYS: [&str; 5] = ["date", "description", "author", "category", "ticker"];

const SIGNATURE_KEYS: [&str; 7] = ["title", "link", "date", "description", "author", "category", "ticker"];
const MAX_SELECTOR_LEN: usize = 200;
const GENERIC_TAGS: [&str; 6] = ["a", "div", "span", "h1", "h2", "h3"];
const ALLOWED_BARE_TAGS: [&str; 10] = ["time", "article", "h4", "h5", "h6", "p", "li", "figcaption", "cite", "address"];
const BANNED_PSEUDO: [&str; 4] = [":nth-child", ":nth-of-type", ":contains", ":has"];

static SELECTOR_SYNTAX_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^[A-Za-z0-9_\-\s.#\[\]=:"'>+~*(),^$|]+$"#).expect("static regex"));
static ANCHOR_TARGET_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|[\s>+~])a(?:$|[.#\[:\s>])").expect("static regex"));

/// Split `html` into chunks of at most `size` bytes on char boundaries.
pub fn chunk_html(html: &str, size: usize) -> Vec<&str> {
    let size = size.max(crate::config::MIN_CSS_CHUNK_SIZE);
    let mut out = Vec::new();
    let mut rest = html;
    while !rest.is_empty() {
        let mut cut = floor_boundary(rest, size);
        if cut == 0 {
            cut = rest.chars().next().map_or(rest.len(), char::len_utf8);
        }
        let (head, tail) = rest.split_at(cut);
        out.push(head);
        rest = tail;
    }
    out
}

pub fn build_css_prompt(page_url: &str, chunk_idx: usize, chunk_total: usize, chunk: &str) -> String {
    format!(
        r#"You are given part {part} of {chunk_total} of the rendered HTML of a news page.

Page URL: {page_url}

Find CSS selectors for the repeating EDITORIAL lists on this page: headlines,
latest news, market news, top stories. Ignore navigation, footers, ads,
cookie banners, social widgets and "related" or "trending" rails.

Return JSON ONLY, in one of two forms.

Single list:
{{"sectionName": "...", "title": "...", "link": "...", "date": "...", "description": "...", "author": "...", "category": "...", "ticker": "...", "confidence": 0.0}}

Several lists:
{{"sections": [{{"sectionName": "...", "selectors": {{"title": "...", "link": "...", "date": "..."}}, "confidence": 0.0}}]}}

Rules:
- "title" and "link" are required; every other key is optional.
- "link" must select the <a> element of each item.
- Prefer child combinators scoped to the list container, e.g. "ul.latest > li > a".
- Do not use :nth-child, :nth-of-type, :contains or :has.
- Do not answer with a bare tag such as "a", "div", "span" or "h2".

HTML:
{chunk}"#,
        part = chunk_idx + 1,
    )
}

/// Selector sets found in one detector reply.
///
/// Sections without string `title` and `link` are dropped; optional keys that
/// are not strings are ignored.
pub fn parse_candidates(v: &Value, chunk_idx: usize) -> Vec<CssSection> {
    let default_name = format!("Batch {}", chunk_idx + 1);
    let raw: Vec<(&Value, &Value)> = match v.get("sections").and_then(Value::as_array) {
        Some(sections) => sections
            .iter()
            .filter_map(|s| s.get("selectors").map(|sel| (s, sel)))
            .collect(),
        None => vec![(v, v)],
    };

    raw.into_iter()
        .filter_map(|(meta, sel)| {
            let title = sel.get("title")?.as_str()?.trim();
            let link = sel.get("link")?.as_str()?.trim();
            let mut selectors = BTreeMap::from([
                ("title".to_string(), title.to_string()),
                ("link".to_string(), link.to_string()),
            ]);
            for key in OPTIONAL_KEYS {
                if let Some(s) = sel.get(key).and_then(Value::as_str) {
                    if !s.trim().is_empty() {
                        selectors.insert(key.to_string(), s.trim().to_string());
                    }
                }
            }
            let section_name = meta
                .get("sectionName")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map_or_else(|| default_name.clone(), String::from);
            Some(CssSection {
                section_name: Some(section_name),
                selectors,
                confidence: parse_confidence(meta.get("confidence")),
                support: None,
                source_url: None,
            })
        })
        .collect()
}

/// Whether `s` plausibly is a CSS selector the extractor can use.
pub fn looks_like_selector(s: &str) -> bool {
    let s = s.trim();
    if s.is_empty() || s.len() > MAX_SELECTOR_LEN {
        return false;
    }
    let lower = s.to_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") || lower.starts_with("//") {
        return false;
    }
    if lower.starts_with("meta[") || BANNED_PSEUDO.iter().any(|p| lower.contains(p)) {
        return false;
    }
    if GENERIC_TAGS.contains(&lower.as_str()) {
        return false;
    }
    if ALLOWED_BARE_TAGS.contains(&lower.as_str()) {
        return true;
    }
    SELECTOR_SYNTAX_RE.is_match(s) && s.contains(['.', '#', '[', '>', ' ', ':'])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acceptance {
    Strict,
    Lenient,
    Rejected,
}

/// Screen a `title`/`link` pair.
pub fn acceptance(title: &str, link: &str) -> Acceptance {
    if !looks_like_selector(title) || !looks_like_selector(link) {
        return Acceptance::Rejected;
    }
    let (title, link) = (title.trim(), link.trim());
    if ANCHOR_TARGET_RE.is_match(link) && (title.contains('>') || link.contains('>')) {
        return Acceptance::Strict;
    }
    if title.len() > 3 && link.len() > 3 {
        return Acceptance::Lenient;
    }
    Acceptance::Rejected
}

/// Hex sha256 over the selector keys joined by `|`.
pub fn signature(selectors: &BTreeMap<String, String>) -> String {
    let joined = SIGNATURE_KEYS
        .iter()
        .map(|k| selectors.get(*k).map(|s| s.trim()).unwrap_or_default())
        .collect::<Vec<_>>()
        .join("|");
    format!("{:x}", Sha256::digest(joined.as_bytes()))
}

/// One section per signature, the highest confidence winning. First-seen
/// order is kept.
pub fn dedupe_sections(sections: Vec<CssSection>) -> Vec<CssSection> {
    let mut out: Vec<CssSection> = Vec::new();
    let mut slot: HashMap<String, usize> = HashMap::new();
    for section in sections {
        let sig = signature(&section.selectors);
        match slot.get(&sig) {
            Some(&i) => {
                if section.confidence > out[i].confidence {
                    out[i] = section;
                }
            }
            None => {
                slot.insert(sig, out.len());
                out.push(section);
            }
        }
    }
    out
}

/// Sections accepted from a set of candidates: strict ones when any exist,
/// otherwise the lenient ones.
pub fn select_sections(candidates: Vec<CssSection>) -> Vec<CssSection> {
    let mut strict = Vec::new();
    let mut lenient = Vec::new();
    for c in candidates {
        let title = c.selectors.get("title").map(String::as_str).unwrap_or_default();
        let link = c.selectors.get("link").map(String::as_str).unwrap_or_default();
        match acceptance(title, link) {
            Acceptance::Strict => strict.push(c),
            Acceptance::Lenient => lenient.push(c),
            Acceptance::Rejected => debug!(title, link, "Rejected selector candidate"),
        }
    }
    if strict.is_empty() {
        dedupe_sections(lenient)
    } else {
        dedupe_sections(strict)
    }
}

/// Detects editorial list selectors on a rendered page.
pub struct CssDetector<'a, B, L> {
    browser: &'a B,
    detector: &'a L,
    chunk_size: usize,
}

impl<'a, B, L> CssDetector<'a, B, L>
where
    B: PageRenderer,
    L: AskAsync<Response = String>,
{
    pub fn new(browser: &'a B, detector: &'a L, chunk_size: usize) -> Self {
        Self {
            browser,
            detector,
            chunk_size: chunk_size.max(crate::config::MIN_CSS_CHUNK_SIZE),
        }
    }

    pub fn detector(&self) -> &'a L {
        self.detector
    }

    pub fn browser(&self) -> &'a B {
        self.browser
    }

    /// Render `url` and detect its sections.
    #[instrument(level = "info", skip(self))]
    pub async fn single_page(&self, url: &str) -> Result<CssSelectorsReport> {
        let page = self.browser.render(url).await?;
        if page.html.trim().is_empty() {
            return Err(CrawlError::EmptyHtml(url.to_string()));
        }
        self.from_html(url, &page.html).await
    }

    /// Detect sections in already rendered HTML.
    pub async fn from_html(&self, url: &str, html: &str) -> Result<CssSelectorsReport> {
        let chunks = chunk_html(html, self.chunk_size);
        let mut candidates = Vec::new();
        let mut detector_failures = 0usize;
        for (idx, chunk) in chunks.iter().enumerate() {
            let prompt = build_css_prompt(url, idx, chunks.len(), chunk);
            match ask_json(self.detector, &prompt).await {
                Ok(v) => {
                    let found = parse_candidates(&v, idx);
                    debug!(chunk = idx + 1, candidates = found.len(), "Chunk analysed");
                    candidates.extend(found);
                }
                Err(reason) => {
                    detector_failures += 1;
                    warn!(chunk = idx + 1, reason = %reason, "Detector failed on chunk");
                }
            }
        }

        let sections = select_sections(candidates);
        if sections.is_empty() {
            let reason = if detector_failures == chunks.len() {
                format!("{url}: detector failed on every chunk")
            } else {
                format!("{url}: no strict or lenient selectors accepted")
            };
            return Err(CrawlError::NoSections(reason));
        }
        info!(
            sections = sections.len(),
            chunks = chunks.len(),
            html_len = html.len(),
            "CSS sections detected"
        );
        Ok(CssSelectorsReport {
            detection_method: DETECTION_METHOD.to_string(),
            page_url: url.to_string(),
            html_length: html.len(),
            chunks_processed: chunks.len(),
            pages_scanned: 1,
            total_sections: sections.len(),
            sections,
        })
    }
}
