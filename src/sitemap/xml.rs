//! Namespace-agnostic sitemap XML model.
//!
//! Sitemaps arrive with every namespace prefix imaginable (`news:`, `image:`,
//! default namespaces, none at all). Everything here matches on *local*
//! names so `news:publication_date` and `{ns}publication_date` are the same
//! thing to callers.

use crate::error::{CrawlError, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use quick_xml::Reader;
use quick_xml::escape::{escape, unescape};
use quick_xml::events::{BytesStart, Event};

/// Root kind of a sitemap document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocKind {
    Index,
    Urlset,
    Other,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct XmlElement {
    /// Qualified name as written (`news:title`).
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub text: String,
    pub children: Vec<XmlElement>,
}

impl XmlElement {
    fn from_start(e: &BytesStart<'_>) -> Self {
        let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
        let attrs = e
            .attributes()
            .flatten()
            .map(|a| {
                let key = String::from_utf8_lossy(a.key.as_ref()).into_owned();
                let raw = String::from_utf8_lossy(&a.value).into_owned();
                let value = unescape(&raw).map(|v| v.into_owned()).unwrap_or(raw);
                (key, value)
            })
            .collect();
        Self {
            name,
            attrs,
            ..Default::default()
        }
    }

    pub fn local_name(&self) -> &str {
        local(&self.name)
    }

    /// First direct child with the given local name.
    pub fn child(&self, local_name: &str) -> Option<&XmlElement> {
        self.children.iter().find(|c| c.local_name() == local_name)
    }

    /// Trimmed text of the first direct child with `local_name` and non-empty text.
    pub fn child_text(&self, local_name: &str) -> Option<&str> {
        self.children
            .iter()
            .filter(|c| c.local_name() == local_name)
            .map(|c| c.text.trim())
            .find(|t| !t.is_empty())
    }

    /// Depth-first descendants, excluding `self`.
    pub fn descendants(&self) -> Vec<&XmlElement> {
        let mut out = Vec::new();
        let mut stack: Vec<&XmlElement> = self.children.iter().rev().collect();
        while let Some(el) = stack.pop() {
            out.push(el);
            stack.extend(el.children.iter().rev());
        }
        out
    }

    /// All descendants with the given local name, in document order.
    pub fn find_all(&self, local_name: &str) -> Vec<&XmlElement> {
        self.descendants()
            .into_iter()
            .filter(|e| e.local_name() == local_name)
            .collect()
    }

    /// Re-serialise this element (used for detector samples).
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write_xml(&mut out);
        out
    }

    fn write_xml(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.name);
        for (k, v) in &self.attrs {
            out.push(' ');
            out.push_str(k);
            out.push_str("=\"");
            out.push_str(&escape(v.as_str()));
            out.push('"');
        }
        if self.children.is_empty() && self.text.trim().is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        out.push_str(&escape(self.text.trim()));
        for c in &self.children {
            c.write_xml(out);
        }
        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }

    /// Value at a slash-separated path of local names (`news:news/news:title`).
    ///
    /// Namespace prefixes in the path are ignored; each segment picks the first
    /// child with that local name.
    pub fn field_by_path(&self, path: &str) -> Option<String> {
        let path = path.trim();
        if path.is_empty() {
            return None;
        }
        if !path.contains('/') {
            return self.child_text(local(path)).map(str::to_string);
        }
        let mut current = self;
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current = current.child(local(part))?;
        }
        let text = current.text.trim();
        (!text.is_empty()).then(|| text.to_string())
    }

    /// `<lastmod>` first, then any descendant `*publication_date`.
    pub fn lastmod_or_publication(&self) -> Option<String> {
        self.child_text("lastmod")
            .map(str::to_string)
            .or_else(|| self.publication_date())
    }

    /// Any descendant `*publication_date` first, then `<lastmod>`.
    pub fn publication_or_lastmod(&self) -> Option<String> {
        self.publication_date()
            .or_else(|| self.child_text("lastmod").map(str::to_string))
    }

    fn publication_date(&self) -> Option<String> {
        self.descendants()
            .into_iter()
            .filter(|d| d.local_name().ends_with("publication_date"))
            .map(|d| d.text.trim())
            .find(|t| !t.is_empty())
            .map(str::to_string)
    }

    /// Whether some descendant named `title`/`headline`/`name` carries text.
    pub fn has_title_like(&self) -> bool {
        self.descendants().into_iter().any(|d| {
            matches!(d.local_name().to_ascii_lowercase().as_str(), "title" | "headline" | "name")
                && !d.text.trim().is_empty()
        })
    }
}

fn local(name: &str) -> &str {
    let name = name.rsplit('}').next().unwrap_or(name);
    name.rsplit(':').next().unwrap_or(name)
}

/// Parse a whole document into its root element.
pub fn parse_document(data: &[u8]) -> Result<XmlElement> {
    // Text is kept untrimmed so entity references split across events keep
    // their surrounding spaces; readers trim on access.
    let mut reader = Reader::from_reader(data);
    let mut buf = Vec::new();
    let mut stack: Vec<XmlElement> = Vec::new();
    let mut root: Option<XmlElement> = None;

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => stack.push(XmlElement::from_start(&e)),
            Event::Empty(e) => {
                let el = XmlElement::from_start(&e);
                match stack.last_mut() {
                    Some(parent) => parent.children.push(el),
                    None => root = Some(el),
                }
            }
            Event::End(_) => {
                let Some(el) = stack.pop() else {
                    return Err(CrawlError::Xml("unbalanced end tag".into()));
                };
                match stack.last_mut() {
                    Some(parent) => parent.children.push(el),
                    None => {
                        root = Some(el);
                        break;
                    }
                }
            }
            Event::Text(t) => {
                if let Some(cur) = stack.last_mut() {
                    let raw = String::from_utf8_lossy(&t).into_owned();
                    let text = unescape(&raw).map(|v| v.into_owned()).unwrap_or(raw);
                    cur.text.push_str(&text);
                }
            }
            Event::GeneralRef(r) => {
                if let Some(cur) = stack.last_mut() {
                    let raw = format!("&{};", String::from_utf8_lossy(&r));
                    let text = unescape(&raw).map(|v| v.into_owned()).unwrap_or(raw);
                    cur.text.push_str(&text);
                }
            }
            Event::CData(c) => {
                if let Some(cur) = stack.last_mut() {
                    cur.text.push_str(&String::from_utf8_lossy(&c));
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    root.ok_or_else(|| CrawlError::Xml("document has no root element".into()))
}

pub fn doc_kind(root: &XmlElement) -> DocKind {
    let name = root.local_name().to_ascii_lowercase();
    if name.ends_with("sitemapindex") {
        DocKind::Index
    } else if name.ends_with("urlset") {
        DocKind::Urlset
    } else {
        DocKind::Other
    }
}

/// Child sitemap `(loc, lastmod)` pairs of an index document.
pub fn index_children(root: &XmlElement) -> Vec<(String, Option<String>)> {
    root.find_all("sitemap")
        .into_iter()
        .filter_map(|sm| {
            let loc = sm.child_text("loc")?.to_string();
            Some((loc, sm.child_text("lastmod").map(str::to_string)))
        })
        .collect()
}

/// Up to `n` leading and `n` trailing items, deduplicated, leading first.
pub fn head_and_tail<T>(items: &[T], n: usize) -> Vec<&T> {
    if items.len() <= n * 2 {
        return items.iter().collect();
    }
    items[..n].iter().chain(items[items.len() - n..].iter()).collect()
}

/// Parse a W3C datetime (ISO 8601 subset used by sitemaps) as UTC.
///
/// Accepts `Z` and numeric offsets, naive datetimes (assumed UTC), date-only
/// values, and falls back to the first ten characters as `YYYY-MM-DD`.
pub fn parse_w3c_datetime(value: &str) -> Option<DateTime<Utc>> {
    let s = value.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M%:z", "%Y-%m-%dT%H:%M:%S%.f%z", "%Y-%m-%dT%H:%M%z"] {
        if let Ok(dt) = DateTime::parse_from_str(s, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(ndt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(ndt.and_utc());
        }
    }
    let head = s.get(..10).unwrap_or(s);
    NaiveDate::parse_from_str(head, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|ndt| ndt.and_utc())
}
