//! Data models for discovery, detection and extraction records.
//!
//! This module defines the typed records that flow between stages and the
//! JSON shapes written to the output streams:
//! - [`FilterVerdict`]: audit record produced by the filter chain
//! - [`SitemapNode`]: a fetched sitemap during recursive expansion
//! - [`LeafSelectorRecord`]: detected field paths for a leaf sitemap
//! - [`ExtractionTarget`]: a unit of extraction work (sitemap or CSS page)
//! - [`ScrapedItem`] / [`SiteRunStats`]: extraction outputs
//! - [`DiscoveryRecord`]: the per-site discovery stream line
//!
//! Stream records use camelCase field names so downstream consumers keep
//! reading the same JSON they always have.

use crate::error::ErrorKind;
use crate::utils::domain_of;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Which predicate of the filter chain produced a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterKind {
    Word,
    Year,
    Date,
}

/// Outcome of one filter applied to one URL. Never mutated once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterVerdict {
    pub url: String,
    pub filter: FilterKind,
    pub accepted: bool,
    pub reason: String,
}

impl FilterVerdict {
    pub fn accept(url: &str, filter: FilterKind, reason: impl Into<String>) -> Self {
        Self {
            url: url.to_string(),
            filter,
            accepted: true,
            reason: reason.into(),
        }
    }

    pub fn reject(url: &str, filter: FilterKind, reason: impl Into<String>) -> Self {
        Self {
            url: url.to_string(),
            filter,
            accepted: false,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SitemapKind {
    Index,
    Leaf,
}

/// A sitemap seen during traversal. Not persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct SitemapNode {
    pub url: String,
    pub kind: SitemapKind,
    pub lastmod: Option<DateTime<Utc>>,
    pub sampled_item_dates: Vec<DateTime<Utc>>,
}

impl SitemapNode {
    /// Latest of the sampled item dates and the node's own lastmod.
    pub fn latest_date(&self) -> Option<DateTime<Utc>> {
        self.sampled_item_dates
            .iter()
            .copied()
            .chain(self.lastmod)
            .max()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    Llm,
    Basic,
}

/// Field paths detected for one accepted leaf sitemap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeafSelectorRecord {
    pub leaf_url: String,
    /// `index` or `urlset`, as reported by the detector.
    pub sitemap_type: String,
    pub item_tag: String,
    pub fields: BTreeMap<String, String>,
    pub detection_method: DetectionMethod,
    pub confidence: f64,
}

impl LeafSelectorRecord {
    pub fn has_url_field(&self) -> bool {
        self.fields.get("url").is_some_and(|p| !p.trim().is_empty())
    }

    pub fn has_title_like_field(&self) -> bool {
        ["title", "headline", "name", "news:title"]
            .iter()
            .any(|k| self.fields.contains_key(*k))
    }
}

/// One CSS section: a set of selectors for an editorial list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CssSection {
    #[serde(default)]
    pub section_name: Option<String>,
    pub selectors: BTreeMap<String, String>,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    /// Number of crawled pages on which this section was detected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub support: Option<u32>,
    /// Page the section was detected on, when it differs from the target page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
}

pub fn default_confidence() -> f64 {
    0.7
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Sitemap,
    Css,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Sitemap => "sitemap",
            SourceType::Css => "css",
        }
    }
}

/// A unit of extraction work built once per site from discovery output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ExtractionTarget {
    #[serde(rename_all = "camelCase")]
    Sitemap {
        site: String,
        sitemap_url: String,
        item_tag: String,
        fields: BTreeMap<String, String>,
    },
    #[serde(rename_all = "camelCase")]
    Css {
        site: String,
        page_url: String,
        sections: Vec<CssSection>,
    },
}

impl ExtractionTarget {
    pub fn site(&self) -> &str {
        match self {
            ExtractionTarget::Sitemap { site, .. } | ExtractionTarget::Css { site, .. } => site,
        }
    }

    pub fn source_type(&self) -> SourceType {
        match self {
            ExtractionTarget::Sitemap { .. } => SourceType::Sitemap,
            ExtractionTarget::Css { .. } => SourceType::Css,
        }
    }

    /// The URL actually fetched for this target.
    pub fn fetch_url(&self) -> &str {
        match self {
            ExtractionTarget::Sitemap { sitemap_url, .. } => sitemap_url,
            ExtractionTarget::Css { page_url, .. } => page_url,
        }
    }

    pub fn domain(&self) -> String {
        domain_of(self.fetch_url())
    }
}

/// One extracted item, written to the extraction stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrapedItem {
    pub site: String,
    pub source_type: SourceType,
    pub item: BTreeMap<String, String>,
    pub ts: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCounts {
    pub sitemap: u64,
    pub css: u64,
}

impl SourceCounts {
    pub fn total(&self) -> u64 {
        self.sitemap + self.css
    }

    pub fn add(&mut self, source: SourceType, n: u64) {
        match source {
            SourceType::Sitemap => self.sitemap += n,
            SourceType::Css => self.css += n,
        }
    }

    pub fn get(&self, source: SourceType) -> u64 {
        match source {
            SourceType::Sitemap => self.sitemap,
            SourceType::Css => self.css,
        }
    }
}

/// Per-site extraction timing and outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteRunStats {
    pub site: String,
    pub started_at: String,
    pub ended_at: String,
    pub duration_sec: f64,
    pub items_total: u64,
    pub items_by_source: SourceCounts,
    pub approaches_used: Vec<SourceType>,
}

/// Lifecycle of one site inside the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SiteState {
    Pending,
    Running,
    Completed,
    Failed,
}

// ---------------------------------------------------------------------------
// Discovery stream records
// ---------------------------------------------------------------------------

/// One line of the discovery stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryEnvelope {
    pub timestamp: String,
    pub result: DiscoveryRecord,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryRecord {
    pub url: String,
    #[serde(default)]
    pub robots_txt: RobotsStats,
    #[serde(default)]
    pub recursive_expansion: ExpansionStats,
    #[serde(default)]
    pub final_stats: FinalStats,
    #[serde(default)]
    pub llm_detection: LlmDetection,
    #[serde(default)]
    pub css_fallback: CssFallbackReport,
    #[serde(default)]
    pub diagnostics: Diagnostics,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RobotsStats {
    pub found: bool,
    pub sitemaps_total: usize,
    pub after_word_filter: usize,
    pub after_year_filter: usize,
    pub after_date_filter: usize,
    #[serde(default)]
    pub rejected: Vec<FilterVerdict>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpansionStats {
    pub children_found: usize,
    pub children_rejected_word: usize,
    pub children_rejected_year: usize,
    pub children_rejected_date: usize,
    pub children_rejected_title: usize,
    pub leaves_found: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalStats {
    pub total_leaves: usize,
    pub after_word_filter: usize,
    pub after_year_filter: usize,
    pub after_date_filter: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmDetection {
    pub total_leaves: usize,
    pub successful: usize,
    pub failed: usize,
    #[serde(default)]
    pub selectors: Vec<LeafDetection>,
}

/// Detection outcome for one leaf as written to the stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeafDetection {
    pub url: String,
    pub detected_selectors: Option<DetectedSelectors>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<DetectionMethod>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectedSelectors {
    #[serde(rename = "type", default = "default_sitemap_type")]
    pub sitemap_type: String,
    #[serde(default = "default_item_tag")]
    pub item: String,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default = "default_detection_method")]
    pub detection_method: DetectionMethod,
}

fn default_sitemap_type() -> String {
    "urlset".to_string()
}

pub fn default_item_tag() -> String {
    "url".to_string()
}

fn default_detection_method() -> DetectionMethod {
    DetectionMethod::Llm
}

impl From<&LeafSelectorRecord> for DetectedSelectors {
    fn from(r: &LeafSelectorRecord) -> Self {
        Self {
            sitemap_type: r.sitemap_type.clone(),
            item: r.item_tag.clone(),
            fields: r.fields.clone(),
            confidence: r.confidence,
            detection_method: r.detection_method,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CssFallbackReport {
    pub triggered: bool,
    pub success: bool,
    #[serde(default)]
    pub selectors: Option<CssSelectorsReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<ErrorKind>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CssSelectorsReport {
    pub detection_method: String,
    pub page_url: String,
    #[serde(default)]
    pub html_length: usize,
    #[serde(default)]
    pub chunks_processed: usize,
    #[serde(default)]
    pub pages_scanned: usize,
    pub sections: Vec<CssSection>,
    #[serde(default)]
    pub total_sections: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Diagnostics {
    #[serde(default)]
    pub robots_browser_retry_status: String,
    #[serde(default)]
    pub sitemap_source: String,
    #[serde(default)]
    pub fallback_step: Option<String>,
    #[serde(default)]
    pub fallback_attempts: usize,
    #[serde(default)]
    pub apex_escalated: bool,
    #[serde(default)]
    pub heuristic_block_detected: bool,
    #[serde(default)]
    pub heuristic_browser_retry_status: String,
    #[serde(default)]
    pub css_fallback_status: String,
    #[serde(default)]
    pub errors: Vec<ErrorKind>,
    #[serde(default)]
    pub notes: Vec<String>,
    #[serde(default)]
    pub elapsed_sec: f64,
}

// ---------------------------------------------------------------------------
// Targets file
// ---------------------------------------------------------------------------

/// One entry of the targets hand-off file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetsFileEntry {
    pub source: String,
    pub source_type: SourceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leaf_sitemaps: Option<Vec<LeafSitemapEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sections: Option<Vec<CssSection>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeafSitemapEntry {
    pub url: String,
    pub selectors: LeafSelectors,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeafSelectors {
    #[serde(default = "default_item_tag")]
    pub item: String,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(fields: &[(&str, &str)]) -> LeafSelectorRecord {
        LeafSelectorRecord {
            leaf_url: "https://news.test/sitemap-news.xml".into(),
            sitemap_type: "urlset".into(),
            item_tag: "url".into(),
            fields: fields.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            detection_method: DetectionMethod::Llm,
            confidence: 0.9,
        }
    }

    #[test]
    fn test_leaf_record_field_checks() {
        assert!(record(&[("url", "loc")]).has_url_field());
        assert!(!record(&[("url", " ")]).has_url_field());
        assert!(!record(&[("date", "lastmod")]).has_url_field());
        assert!(record(&[("url", "loc"), ("headline", "h")]).has_title_like_field());
        assert!(!record(&[("url", "loc")]).has_title_like_field());
    }

    #[test]
    fn test_extraction_target_serialises_tagged() {
        let t = ExtractionTarget::Sitemap {
            site: "https://news.test".into(),
            sitemap_url: "https://news.test/s.xml".into(),
            item_tag: "url".into(),
            fields: BTreeMap::from([("url".to_string(), "loc".to_string())]),
        };
        let v = serde_json::to_value(&t).unwrap();
        assert_eq!(v["type"], "sitemap");
        assert_eq!(v["sitemapUrl"], "https://news.test/s.xml");
        assert_eq!(t.domain(), "news.test");
        assert_eq!(t.source_type(), SourceType::Sitemap);
    }

    #[test]
    fn test_scraped_item_schema() {
        let item = ScrapedItem {
            site: "https://a.test".into(),
            source_type: SourceType::Css,
            item: BTreeMap::from([("title".to_string(), "Hello".to_string())]),
            ts: "2025-01-01 00:00:00".into(),
        };
        let v = serde_json::to_value(&item).unwrap();
        assert_eq!(v["sourceType"], "css");
        assert_eq!(v["item"]["title"], "Hello");
    }

    #[test]
    fn test_node_latest_date() {
        let a = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let b = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();
        let node = SitemapNode {
            url: "u".into(),
            kind: SitemapKind::Leaf,
            lastmod: Some(a),
            sampled_item_dates: vec![b, a],
        };
        assert_eq!(node.latest_date(), Some(b));
    }

    #[test]
    fn test_detected_selectors_defaults() {
        let d: DetectedSelectors = serde_json::from_str(r#"{"fields":{"url":"loc"}}"#).unwrap();
        assert_eq!(d.item, "url");
        assert_eq!(d.sitemap_type, "urlset");
        assert!((d.confidence - 0.7).abs() < f64::EPSILON);
    }
}
