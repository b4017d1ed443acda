//! Item extraction from leaf sitemaps and rendered pages.
//!
//! Both extractors are pure: they take a parsed sitemap or an HTML snapshot
//! plus the detected selectors and return flat string maps. Fetching and
//! the direct/browser escalation live in the orchestrator.

use crate::detect::gateway::apply_fields;
use crate::error::Result;
use crate::models::CssSection;
use crate::sitemap::fallback::parse_rendered_xml;
use crate::sitemap::xml::{DocKind, XmlElement, doc_kind, parse_document};
use itertools::Itertools;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use std::collections::{BTreeMap, HashSet};
use tracing::debug;
use url::Url;

pub type Item = BTreeMap<String, String>;

/// Ancestors searched (the starting element included) for optional fields.
const CLOSEST_DEPTH: usize = 4;

const DATE_ATTRS: [&str; 4] = ["datetime", "content", "data-time", "data-date"];
const TICKER_ATTRS: [&str; 6] = ["alt", "title", "aria-label", "data-symbol", "data-ticker", "data-qa-symbol"];
const TEXT_FIELDS: [&str; 3] = ["description", "author", "category"];

static TICKER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\$?[A-Z]{1,6}$").expect("static regex"));
static EXCHANGE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(NYSE|NASDAQ|LON|EURONEXT|HKEX|TSE|KRX):[A-Z0-9.-]+$").expect("static regex")
});
static SCOPE_SEL: Lazy<Selector> =
    Lazy::new(|| Selector::parse("article, li, div, section").expect("static selector"));
static ANCHOR_SEL: Lazy<Selector> = Lazy::new(|| Selector::parse("a").expect("static selector"));
static TIME_SEL: Lazy<Selector> = Lazy::new(|| Selector::parse("time[datetime]").expect("static selector"));

// ---------------------------------------------------------------------------
// Sitemaps
// ---------------------------------------------------------------------------

/// Items of a parsed leaf sitemap.
///
/// Every `item_tag` element is mapped through the detected field paths;
/// items without a `url` are dropped and the rest deduplicated by url.
/// `max_urls` caps the result (0 = unlimited).
pub fn sitemap_items(root: &XmlElement, item_tag: &str, fields: &BTreeMap<String, String>, max_urls: usize) -> Vec<Item> {
    let tag = item_tag.trim().rsplit(':').next().unwrap_or_default();
    let tag = if tag.is_empty() { "url" } else { tag };
    let cap = if max_urls == 0 { usize::MAX } else { max_urls };
    root.find_all(tag)
        .into_iter()
        .map(|el| apply_fields(el, fields))
        .filter(|item| item.get("url").is_some_and(|u| !u.trim().is_empty()))
        .unique_by(|item| item.get("url").cloned().unwrap_or_default())
        .take(cap)
        .collect()
}

/// Items of a raw (already decompressed) sitemap body.
pub fn sitemap_items_from_bytes(
    body: &[u8],
    item_tag: &str,
    fields: &BTreeMap<String, String>,
    max_urls: usize,
) -> Result<Vec<Item>> {
    let root = parse_document(body)?;
    Ok(sitemap_items(&root, item_tag, fields, max_urls))
}

/// Items of a sitemap read back from a browser's rendered text. Only
/// `urlset` documents count; anything else yields nothing.
pub fn rendered_sitemap_items(
    text: &str,
    item_tag: &str,
    fields: &BTreeMap<String, String>,
    max_urls: usize,
) -> Vec<Item> {
    match parse_rendered_xml(text) {
        Some(root) if doc_kind(&root) == DocKind::Urlset => sitemap_items(&root, item_tag, fields, max_urls),
        _ => Vec::new(),
    }
}

// ---------------------------------------------------------------------------
// CSS pages
// ---------------------------------------------------------------------------

/// Absolute form of `href` against `base` with `utm_*` query parameters
/// removed. Non-http(s) links are dropped.
pub fn canonical_link(base: Option<&Url>, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() {
        return None;
    }
    let mut u = match base {
        Some(b) => b.join(href).ok()?,
        None => Url::parse(href).ok()?,
    };
    if !matches!(u.scheme(), "http" | "https") {
        return None;
    }
    if u.query().is_some() {
        let kept: Vec<(String, String)> = u
            .query_pairs()
            .filter(|(k, _)| !k.to_ascii_lowercase().starts_with("utm_"))
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        if kept.is_empty() {
            u.set_query(None);
        } else {
            u.query_pairs_mut().clear().extend_pairs(kept);
        }
    }
    Some(u.to_string())
}

/// Ticker symbol as displayed, or the first short token upper-cased.
pub fn normalize_ticker(raw: &str) -> Option<String> {
    let cleaned = raw.trim();
    if cleaned.is_empty() {
        return None;
    }
    let upper = cleaned.to_uppercase();
    if TICKER_RE.is_match(&upper) || EXCHANGE_RE.is_match(cleaned) {
        return Some(cleaned.to_string());
    }
    let first = cleaned.split_whitespace().next()?;
    (first.chars().count() <= 8).then(|| first.to_uppercase())
}

fn text_of(el: ElementRef<'_>) -> Option<String> {
    let t = el.text().collect::<Vec<_>>().join(" ");
    let t = t.split_whitespace().join(" ");
    (!t.is_empty()).then_some(t)
}

fn attr_or_text(el: ElementRef<'_>, attrs: &[&str]) -> Option<String> {
    attrs
        .iter()
        .filter_map(|a| el.value().attr(a))
        .map(str::trim)
        .find(|v| !v.is_empty())
        .map(String::from)
        .or_else(|| text_of(el))
}

fn parent_element(el: ElementRef<'_>) -> Option<ElementRef<'_>> {
    el.parent().and_then(ElementRef::wrap)
}

/// First match of `sel` under `base` or one of its nearest ancestors.
fn select_closest<'a>(base: ElementRef<'a>, sel: &Selector) -> Option<ElementRef<'a>> {
    std::iter::successors(Some(base), |e| parent_element(*e))
        .take(CLOSEST_DEPTH)
        .find_map(|n| n.select(sel).next())
}

/// Nearest container (self included) that scopes one list item.
fn closest_scope(el: ElementRef<'_>) -> Option<ElementRef<'_>> {
    std::iter::successors(Some(el), |e| parent_element(*e)).find(|e| SCOPE_SEL.matches(e))
}

fn parse_selector(raw: Option<&String>) -> Option<Selector> {
    let raw = raw?.trim();
    if raw.is_empty() {
        return None;
    }
    match Selector::parse(raw) {
        Ok(s) => Some(s),
        Err(e) => {
            debug!(selector = raw, error = %e, "Unparseable selector skipped");
            None
        }
    }
}

/// Items of one section: the i-th title element is paired with the i-th
/// link element.
fn section_items(doc: &Html, base: Option<&Url>, section: &CssSection) -> Vec<Item> {
    let sel = &section.selectors;
    let (Some(title_sel), Some(link_sel)) = (parse_selector(sel.get("title")), parse_selector(sel.get("link"))) else {
        return Vec::new();
    };
    let optional: Vec<(&str, Selector)> = TEXT_FIELDS
        .iter()
        .chain(["date", "ticker"].iter())
        .filter_map(|k| parse_selector(sel.get(*k)).map(|s| (*k, s)))
        .collect();

    let titles: Vec<ElementRef<'_>> = doc.select(&title_sel).collect();
    let links: Vec<ElementRef<'_>> = doc.select(&link_sel).collect();
    let root = doc.root_element();

    let mut out = Vec::new();
    for i in 0..titles.len().max(links.len()) {
        let t = titles.get(i).copied();
        let a = links.get(i).copied();

        let href = a.and_then(|a| {
            a.value()
                .attr("href")
                .or_else(|| a.select(&ANCHOR_SEL).next().and_then(|n| n.value().attr("href")))
        });
        let title = t
            .and_then(text_of)
            .or_else(|| t.and_then(|t| t.select(&ANCHOR_SEL).next()).and_then(text_of))
            .or_else(|| a.and_then(text_of));
        let (Some(title), Some(link)) = (title, href.and_then(|h| canonical_link(base, h))) else {
            continue;
        };

        let anchor = a.or(t).unwrap_or(root);
        let scope = a
            .and_then(closest_scope)
            .or_else(|| t.and_then(closest_scope))
            .unwrap_or(root);

        let mut item = Item::from([("title".to_string(), title), ("link".to_string(), link)]);
        for (key, s) in &optional {
            let found = select_closest(anchor, s).or_else(|| scope.select(s).next());
            let value = match *key {
                "date" => found
                    .or_else(|| scope.select(&TIME_SEL).next())
                    .and_then(|e| attr_or_text(e, &DATE_ATTRS)),
                "ticker" => found
                    .and_then(|e| attr_or_text(e, &TICKER_ATTRS))
                    .and_then(|v| normalize_ticker(&v)),
                _ => found.and_then(text_of),
            };
            if let Some(v) = value {
                item.insert(key.to_string(), v);
            }
        }
        out.push(item);
    }
    out
}

/// Items of every section on one page, deduplicated by link and capped at
/// `max_items` (0 = unlimited).
pub fn css_items(html: &str, page_url: &str, sections: &[CssSection], max_items: usize) -> Vec<Item> {
    let doc = Html::parse_document(html);
    let base = Url::parse(page_url).ok();
    let cap = if max_items == 0 { usize::MAX } else { max_items };
    let mut seen: HashSet<String> = HashSet::new();
    let mut out = Vec::new();
    for section in sections {
        let items = section_items(&doc, base.as_ref(), section);
        debug!(
            section = section.section_name.as_deref().unwrap_or("Unnamed"),
            items = items.len(),
            "Section extracted"
        );
        for item in items {
            if out.len() >= cap {
                return out;
            }
            if seen.insert(item["link"].clone()) {
                out.push(item);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn section(pairs: &[(&str, &str)]) -> CssSection {
        CssSection {
            section_name: Some("Latest".into()),
            selectors: fields(pairs),
            confidence: 0.8,
            support: None,
            source_url: None,
        }
    }

    const LEAF: &str = r#"<urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9" xmlns:news="http://www.google.com/schemas/sitemap-news/0.9">
<url><loc>https://news.test/a</loc><news:news><news:title>A</news:title></news:news></url>
<url><loc>https://news.test/b</loc><news:news><news:title>B</news:title></news:news></url>
<url><loc>https://news.test/a</loc><news:news><news:title>A again</news:title></news:news></url>
<url><news:news><news:title>No location</news:title></news:news></url>
</urlset>"#;

    #[test]
    fn sitemap_items_use_paths_dedupe_and_cap() {
        let f = fields(&[("title", "news:news/news:title")]);
        let items = sitemap_items_from_bytes(LEAF.as_bytes(), "url", &f, 0).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["url"], "https://news.test/a");
        assert_eq!(items[0]["title"], "A");
        assert_eq!(items[1]["title"], "B");

        let capped = sitemap_items_from_bytes(LEAF.as_bytes(), "url", &f, 1).unwrap();
        assert_eq!(capped.len(), 1);
    }

    #[test]
    fn rendered_text_with_viewer_preamble() {
        let text = format!("This XML file does not appear to have any style information.\n{LEAF}");
        let items = rendered_sitemap_items(&text, "url", &fields(&[("url", "loc")]), 0);
        assert_eq!(items.len(), 2);
        assert!(rendered_sitemap_items("Access denied", "url", &BTreeMap::new(), 0).is_empty());
    }

    #[test]
    fn links_are_absolute_without_tracking() {
        let base = Url::parse("https://news.test/markets/").unwrap();
        assert_eq!(
            canonical_link(Some(&base), "../a?utm_source=x&id=3").as_deref(),
            Some("https://news.test/a?id=3")
        );
        assert_eq!(
            canonical_link(Some(&base), "/b?utm_medium=y").as_deref(),
            Some("https://news.test/b")
        );
        assert_eq!(canonical_link(Some(&base), "javascript:void(0)"), None);
        assert_eq!(canonical_link(None, "/relative"), None);
    }

    #[test]
    fn ticker_normalisation() {
        assert_eq!(normalize_ticker(" AAPL ").as_deref(), Some("AAPL"));
        assert_eq!(normalize_ticker("$tsla").as_deref(), Some("$tsla"));
        assert_eq!(normalize_ticker("NASDAQ:MSFT").as_deref(), Some("NASDAQ:MSFT"));
        assert_eq!(normalize_ticker("brk.b shares").as_deref(), Some("BRK.B"));
        assert_eq!(normalize_ticker("verylongtoken rest"), None);
        assert_eq!(normalize_ticker("  "), None);
    }

    const PAGE: &str = r#"<html><body>
<ul class="latest">
  <li><time datetime="2025-01-02T10:00:00Z">Jan 2</time><a href="/one?utm_source=home">First story</a><span class="by">Ann</span><img class="sym" alt="AAPL"></li>
  <li><a href="https://news.test/two">Second story</a><span class="by">Bob</span></li>
  <li><a href="/one">First story again</a></li>
  <li><a>No link</a></li>
</ul>
<div class="cards"><h3 class="hd"><a href="/three">Third</a></h3></div>
</body></html>"#;

    #[test]
    fn css_items_pair_titles_and_links() {
        let sections = vec![
            section(&[
                ("title", "ul.latest > li > a"),
                ("link", "ul.latest > li > a"),
                ("author", ".by"),
                ("date", "time"),
                ("ticker", "img.sym"),
            ]),
            section(&[("title", ".cards h3"), ("link", ".cards h3")]),
        ];
        let items = css_items(PAGE, "https://news.test/", &sections, 0);
        let links: Vec<&str> = items.iter().map(|i| i["link"].as_str()).collect();
        assert_eq!(
            links,
            vec!["https://news.test/one", "https://news.test/two", "https://news.test/three"]
        );
        assert_eq!(items[0]["title"], "First story");
        assert_eq!(items[0]["author"], "Ann");
        assert_eq!(items[0]["date"], "2025-01-02T10:00:00Z");
        assert_eq!(items[0]["ticker"], "AAPL");
        assert_eq!(items[1]["author"], "Bob");
        assert_eq!(items[2]["title"], "Third");
    }

    #[test]
    fn css_items_respect_cap_and_bad_selectors() {
        let sections = vec![
            section(&[("title", "ul.latest > li > a"), ("link", "ul.latest > li > a")]),
        ];
        assert_eq!(css_items(PAGE, "https://news.test/", &sections, 1).len(), 1);

        let broken = vec![section(&[("title", "li >> a["), ("link", "a")])];
        assert!(css_items(PAGE, "https://news.test/", &broken, 0).is_empty());
    }
}
