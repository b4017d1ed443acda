//! Field-path detection for accepted leaf sitemaps.
//!
//! A handful of `<url>` items are re-serialised and shown to the detector,
//! which answers with a `{type, item, fields, confidence}` mapping. When the
//! detector fails or answers with something unusable, a structural detector
//! inspects the first item instead.

use crate::api::AskAsync;
use crate::detect::{ask_json, parse_confidence};
use crate::error::{CrawlError, Result};
use crate::models::{DetectionMethod, LeafSelectorRecord};
use crate::net::Fetcher;
use crate::net::http::fetch_sitemap_bytes;
use crate::sitemap::xml::{DocKind, XmlElement, doc_kind, head_and_tail, parse_document};
use futures::stream::{self, StreamExt};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{info, instrument, warn};

/// Items shown to the detector from each end of the urlset.
pub const PROMPT_SAMPLES_EACH_END: usize = 3;
/// Confidence reported for structural detection.
pub const BASIC_CONFIDENCE: f64 = 0.3;

pub const NO_TITLE_LIKE_FIELD: &str = "no_title_like_field";

static SAFE_PATH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][\w.-]*(:[A-Za-z_][\w.-]*)?(/[A-Za-z_][\w.-]*(:[A-Za-z_][\w.-]*)?)*$").expect("static regex")
});

/// Whether a field path is a plain slash-separated list of (prefixed) names.
pub fn is_safe_path(path: &str) -> bool {
    SAFE_PATH_RE.is_match(path)
}

/// Serialized sample items for the prompt.
pub fn sample_items(root: &XmlElement) -> Vec<String> {
    let items = root.find_all("url");
    head_and_tail(&items, PROMPT_SAMPLES_EACH_END)
        .into_iter()
        .map(|u| u.to_xml())
        .collect()
}

pub fn build_prompt(samples: &[String], sitemap_url: &str) -> String {
    let mut prompt = format!(
        "You are analyzing a sitemap XML to discover field mappings.\n\n\
         Sitemap URL: {sitemap_url}\n\n\
         Here are {} sample <url> entries from the sitemap:\n\n",
        samples.len()
    );
    for (idx, sample) in samples.iter().enumerate() {
        prompt.push_str(&format!("\n--- Sample {} ---\n{sample}\n", idx + 1));
    }
    prompt.push_str(
        r#"
Your task: Analyze these samples and identify the XML paths for common fields.

Return ONLY a valid JSON object with this structure:
{
  "type": "urlset" or "index",
  "item": "url" or "sitemap",
  "fields": {
    "url": "path to URL field",
    "date": "path to date field",
    "title": "path to title field (if present)",
    "description": "path to description (if present)"
  },
  "confidence": 0.0 to 1.0
}

Field path format:
- For direct children: "tagname" (e.g., "loc", "lastmod")
- For nested: "parent/child" (e.g., "news:news/news:title")
- Use exact tag names including namespaces

Only include fields that exist in the samples.
"#,
    );
    prompt
}

/// Detector answer after validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedSelectors {
    pub sitemap_type: String,
    pub item: String,
    pub fields: BTreeMap<String, String>,
    pub confidence: f64,
}

/// Validate a detector JSON answer.
///
/// `fields` must be a non-empty object with a `url` entry, and every path
/// must be safe. Non-string field values are ignored.
pub fn parse_reply(v: &Value) -> std::result::Result<ParsedSelectors, String> {
    let obj = v.as_object().ok_or("reply is not an object")?;
    let fields_obj = obj
        .get("fields")
        .and_then(Value::as_object)
        .ok_or("reply has no fields object")?;
    let fields: BTreeMap<String, String> = fields_obj
        .iter()
        .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.trim().to_string())))
        .filter(|(_, p)| !p.is_empty())
        .collect();
    if fields.is_empty() {
        return Err("fields is empty".into());
    }
    if !fields.contains_key("url") {
        return Err("fields has no url mapping".into());
    }
    if let Some((name, path)) = fields.iter().find(|(_, p)| !is_safe_path(p)) {
        return Err(format!("unsafe path for {name}: {path}"));
    }
    let text_or = |key: &str, default: &str| {
        obj.get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(default)
            .to_string()
    };
    Ok(ParsedSelectors {
        sitemap_type: text_or("type", "urlset"),
        item: text_or("item", "url"),
        fields,
        confidence: parse_confidence(obj.get("confidence")),
    })
}

/// Structural detection on the document itself.
pub fn basic_detect(root: &XmlElement) -> Option<ParsedSelectors> {
    let mut fields = BTreeMap::new();
    match doc_kind(root) {
        DocKind::Index => {
            fields.insert("url".to_string(), "loc".to_string());
            fields.insert("date".to_string(), "lastmod".to_string());
            Some(ParsedSelectors {
                sitemap_type: "index".into(),
                item: "sitemap".into(),
                fields,
                confidence: BASIC_CONFIDENCE,
            })
        }
        DocKind::Urlset => {
            let first = root.find_all("url").into_iter().next()?;
            let has = |name: &str| first.descendants().iter().any(|d| d.local_name() == name);
            for (field, tag) in [("url", "loc"), ("date", "lastmod"), ("changefreq", "changefreq"), ("priority", "priority")] {
                if has(tag) {
                    fields.insert(field.to_string(), tag.to_string());
                }
            }
            let news_title = first
                .descendants()
                .iter()
                .any(|d| d.local_name() == "news" && d.child("title").is_some());
            if news_title {
                fields.insert("title".to_string(), "news:news/news:title".to_string());
            }
            Some(ParsedSelectors {
                sitemap_type: "urlset".into(),
                item: "url".into(),
                fields,
                confidence: BASIC_CONFIDENCE,
            })
        }
        DocKind::Other => None,
    }
}

/// Values of `fields` on one item; `url` falls back to `<loc>`.
pub fn apply_fields(item: &XmlElement, fields: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut out: BTreeMap<String, String> = fields
        .iter()
        .filter_map(|(name, path)| item.field_by_path(path).map(|v| (name.clone(), v)))
        .collect();
    if !out.contains_key("url") {
        if let Some(loc) = item.child_text("loc") {
            out.insert("url".to_string(), loc.to_string());
        }
    }
    out
}

/// Detects field paths for leaf sitemaps through the detector, falling back
/// to structural detection.
pub struct SelectorGateway<'a, H, L> {
    http: &'a H,
    detector: &'a L,
    require_title: bool,
}

impl<'a, H, L> SelectorGateway<'a, H, L>
where
    H: Fetcher,
    L: AskAsync<Response = String>,
{
    pub fn new(http: &'a H, detector: &'a L, require_title: bool) -> Self {
        Self {
            http,
            detector,
            require_title,
        }
    }

    #[instrument(level = "info", skip(self))]
    pub async fn detect(&self, leaf_url: &str) -> Result<LeafSelectorRecord> {
        let body = fetch_sitemap_bytes(self.http, leaf_url).await?;
        let root = parse_document(&body)?;

        let samples = sample_items(&root);
        let from_llm = if samples.is_empty() {
            Err("no sample items".to_string())
        } else {
            let prompt = build_prompt(&samples, leaf_url);
            match ask_json(self.detector, &prompt).await {
                Ok(v) => parse_reply(&v),
                Err(e) => Err(e),
            }
        };

        let (parsed, method) = match from_llm {
            Ok(p) => (p, DetectionMethod::Llm),
            Err(reason) => {
                warn!(reason = %reason, "Detector output unusable; using structural detection");
                let basic = basic_detect(&root)
                    .ok_or_else(|| CrawlError::SelectorDetection(format!("{leaf_url}: unrecognised document")))?;
                (basic, DetectionMethod::Basic)
            }
        };

        let record = LeafSelectorRecord {
            leaf_url: leaf_url.to_string(),
            sitemap_type: parsed.sitemap_type,
            item_tag: parsed.item,
            fields: parsed.fields,
            detection_method: method,
            confidence: parsed.confidence,
        };
        if !record.has_url_field() {
            return Err(CrawlError::SelectorDetection(format!("{leaf_url}: no url field")));
        }
        if self.require_title && !record.has_title_like_field() {
            return Err(CrawlError::SelectorDetection(NO_TITLE_LIKE_FIELD.to_string()));
        }
        info!(
            method = ?record.detection_method,
            fields = record.fields.len(),
            confidence = record.confidence,
            "Selectors detected"
        );
        Ok(record)
    }

    /// Detect every leaf with at most `concurrency` in flight. Results keep
    /// the input order.
    #[instrument(level = "info", skip_all, fields(leaves = leaves.len(), concurrency))]
    pub async fn detect_all(&self, leaves: &[String], concurrency: usize) -> Vec<(String, Result<LeafSelectorRecord>)> {
        stream::iter(leaves.iter().cloned())
            .map(|leaf| async move {
                let res = self.detect(&leaf).await;
                (leaf, res)
            })
            .buffered(concurrency.max(1))
            .collect()
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::ScriptedAsk;
    use crate::error::ErrorKind;
    use crate::net::http::testing::FakeFetcher;
    use serde_json::json;

    const LEAF: &str = r#"<urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9" xmlns:news="http://www.google.com/schemas/sitemap-news/0.9">
<url><loc>https://a.test/one</loc><lastmod>2025-05-15</lastmod><news:news><news:title>One</news:title></news:news></url>
<url><loc>https://a.test/two</loc><lastmod>2025-05-15</lastmod><news:news><news:title>Two</news:title></news:news></url>
</urlset>"#;

    const PLAIN_LEAF: &str = r#"<urlset><url><loc>https://a.test/one</loc><changefreq>daily</changefreq></url></urlset>"#;

    #[test]
    fn safe_paths() {
        assert!(is_safe_path("loc"));
        assert!(is_safe_path("news:news/news:title"));
        assert!(is_safe_path("image:image/image:loc"));
        assert!(!is_safe_path("//loc"));
        assert!(!is_safe_path("loc[@x]"));
        assert!(!is_safe_path("news:news/"));
        assert!(!is_safe_path("1loc"));
    }

    #[test]
    fn reply_validation() {
        let ok = parse_reply(&json!({"type": "urlset", "fields": {"url": "loc", "title": "news:news/news:title", "n": 3}})).unwrap();
        assert_eq!(ok.item, "url");
        assert_eq!(ok.confidence, 0.7);
        assert_eq!(ok.fields.len(), 2);
        assert!(parse_reply(&json!({"fields": {}})).is_err());
        assert!(parse_reply(&json!({"fields": {"title": "news:title"}})).is_err());
        assert!(parse_reply(&json!({"fields": {"url": "loc", "x": "a[1]"}})).is_err());
        assert!(parse_reply(&json!([1, 2])).is_err());
    }

    #[test]
    fn url_round_trips_through_loc() {
        let root = parse_document(b"<url><loc>https://x.test/a</loc></url>").unwrap();
        let fields = BTreeMap::from([("url".to_string(), "loc".to_string())]);
        assert_eq!(apply_fields(&root, &fields).get("url").map(String::as_str), Some("https://x.test/a"));

        let odd = BTreeMap::from([("url".to_string(), "link".to_string())]);
        assert_eq!(apply_fields(&root, &odd).get("url").map(String::as_str), Some("https://x.test/a"));
    }

    #[test]
    fn basic_detection_shapes() {
        let root = parse_document(LEAF.as_bytes()).unwrap();
        let b = basic_detect(&root).unwrap();
        assert_eq!(b.fields.get("url").map(String::as_str), Some("loc"));
        assert_eq!(b.fields.get("date").map(String::as_str), Some("lastmod"));
        assert_eq!(b.fields.get("title").map(String::as_str), Some("news:news/news:title"));
        assert_eq!(b.confidence, BASIC_CONFIDENCE);

        let idx = parse_document(b"<sitemapindex><sitemap><loc>x</loc></sitemap></sitemapindex>").unwrap();
        let b = basic_detect(&idx).unwrap();
        assert_eq!((b.sitemap_type.as_str(), b.item.as_str()), ("index", "sitemap"));
    }

    #[test]
    fn prompt_uses_three_from_each_end() {
        let mut xml = String::from("<urlset>");
        for i in 0..10 {
            xml.push_str(&format!("<url><loc>https://a.test/{i}</loc></url>"));
        }
        xml.push_str("</urlset>");
        let root = parse_document(xml.as_bytes()).unwrap();
        let samples = sample_items(&root);
        assert_eq!(samples.len(), 6);
        assert!(samples[0].contains("/0<"));
        assert!(samples[5].contains("/9<"));
        let prompt = build_prompt(&samples, "https://a.test/s.xml");
        assert!(prompt.contains("--- Sample 6 ---"));
    }

    #[tokio::test]
    async fn detector_answer_is_used() {
        let http = FakeFetcher::new().route("https://a.test/leaf.xml", 200, LEAF);
        let det = ScriptedAsk::always(
            r#"```json
{"type":"urlset","item":"url","fields":{"url":"loc","date":"lastmod","title":"news:news/news:title"},"confidence":"high"}
```"#,
        );
        let rec = SelectorGateway::new(&http, &det, true)
            .detect("https://a.test/leaf.xml")
            .await
            .unwrap();
        assert_eq!(rec.detection_method, DetectionMethod::Llm);
        assert_eq!(rec.confidence, 0.9);
        assert!(rec.has_title_like_field());
    }

    #[tokio::test]
    async fn malformed_json_falls_back_to_basic() {
        let http = FakeFetcher::new().route("https://a.test/leaf.xml", 200, LEAF);
        let det = ScriptedAsk::always("Sure! fields: url=loc (sorry, no JSON today)");
        let rec = SelectorGateway::new(&http, &det, true)
            .detect("https://a.test/leaf.xml")
            .await
            .unwrap();
        assert_eq!(rec.detection_method, DetectionMethod::Basic);
        assert_eq!(rec.confidence, BASIC_CONFIDENCE);
        assert_eq!(rec.fields.get("url").map(String::as_str), Some("loc"));
    }

    #[tokio::test]
    async fn garbage_reply_without_loc_fails_detection() {
        let leaf = r#"<urlset><url><link>https://a.test/one</link><guid>one</guid><title>One</title></url></urlset>"#;
        let http = FakeFetcher::new().route("https://a.test/links.xml", 200, leaf);
        let det = ScriptedAsk::always("{{{ not json");
        let err = SelectorGateway::new(&http, &det, false)
            .detect("https://a.test/links.xml")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SelectorDetectionFailed);
        assert!(err.to_string().contains("no url field"));
    }

    #[tokio::test]
    async fn detector_error_falls_back_and_title_policy_applies() {
        let http = FakeFetcher::new().route("https://a.test/plain.xml", 200, PLAIN_LEAF);
        let det = ScriptedAsk::new();
        let strict = SelectorGateway::new(&http, &det, true).detect("https://a.test/plain.xml").await;
        let err = strict.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SelectorDetectionFailed);
        assert!(err.to_string().contains(NO_TITLE_LIKE_FIELD));

        let relaxed = SelectorGateway::new(&http, &det, false)
            .detect("https://a.test/plain.xml")
            .await
            .unwrap();
        assert_eq!(relaxed.detection_method, DetectionMethod::Basic);
    }

    #[tokio::test]
    async fn detect_all_keeps_order() {
        let http = FakeFetcher::new()
            .route("https://a.test/1.xml", 200, LEAF)
            .route("https://a.test/2.xml", 200, LEAF);
        let det = ScriptedAsk::new();
        let leaves = vec![
            "https://a.test/1.xml".to_string(),
            "https://a.test/missing.xml".to_string(),
            "https://a.test/2.xml".to_string(),
        ];
        let out = SelectorGateway::new(&http, &det, true).detect_all(&leaves, 2).await;
        let urls: Vec<&str> = out.iter().map(|(u, _)| u.as_str()).collect();
        assert_eq!(urls, vec!["https://a.test/1.xml", "https://a.test/missing.xml", "https://a.test/2.xml"]);
        assert!(out[0].1.is_ok());
        assert_eq!(out[1].1.as_ref().unwrap_err().kind(), ErrorKind::HttpError);
    }
}
