//! Per-site overview rows.
//!
//! [`OverviewStore`] is the seam; [`JsonOverviewStore`] keeps the rows in a
//! JSON file keyed by site. Error details and explanations accumulate as
//! ` | `-joined, deduplicated notes.

use crate::context::lock;
use crate::error::Result;
use crate::utils::merge_note;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::fs;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, instrument, warn};

pub const MAX_NOTE_LEN: usize = 300;

/// How a site ended up producing items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PathUsed {
    Both,
    Sitemap,
    #[serde(rename = "CSS")]
    Css,
    Neither,
}

impl PathUsed {
    pub fn from_counts(sitemap: u64, css: u64) -> Self {
        match (sitemap > 0, css > 0) {
            (true, true) => PathUsed::Both,
            (true, false) => PathUsed::Sitemap,
            (false, true) => PathUsed::Css,
            (false, false) => PathUsed::Neither,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverviewRow {
    pub site: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_used: Option<PathUsed>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items_total: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scrape_time_sec: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sitemap_leaves: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub css_sections: Option<usize>,
    #[serde(default)]
    pub zero_items_reason: String,
    #[serde(default)]
    pub error_details: String,
    #[serde(default)]
    pub explanation: String,
    #[serde(default)]
    pub updated_at: String,
}

/// Partial update for one row. `None` leaves a field untouched; notes are
/// merged rather than replaced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OverviewUpdate {
    pub path_used: Option<PathUsed>,
    pub items_total: Option<u64>,
    pub scrape_time_sec: Option<f64>,
    pub sitemap_leaves: Option<usize>,
    pub css_sections: Option<usize>,
    /// Replaces the previous reason; an empty string clears it.
    pub zero_items_reason: Option<String>,
    pub error_detail: Option<String>,
    pub explanation: Option<String>,
}

impl OverviewRow {
    fn apply(&mut self, u: &OverviewUpdate) {
        if u.path_used.is_some() {
            self.path_used = u.path_used;
        }
        if u.items_total.is_some() {
            self.items_total = u.items_total;
        }
        if u.scrape_time_sec.is_some() {
            self.scrape_time_sec = u.scrape_time_sec;
        }
        if u.sitemap_leaves.is_some() {
            self.sitemap_leaves = u.sitemap_leaves;
        }
        if u.css_sections.is_some() {
            self.css_sections = u.css_sections;
        }
        if let Some(r) = &u.zero_items_reason {
            self.zero_items_reason = r.clone();
        }
        if let Some(d) = &u.error_detail {
            self.error_details = merge_note(&self.error_details, d, MAX_NOTE_LEN);
        }
        if let Some(e) = &u.explanation {
            self.explanation = merge_note(&self.explanation, e, MAX_NOTE_LEN);
        }
        self.updated_at = crate::utils::stream_ts();
    }
}

pub trait OverviewStore {
    async fn upsert(&self, key: &str, update: OverviewUpdate) -> Result<()>;

    async fn export_snapshot(&self) -> Result<Vec<OverviewRow>>;
}

/// Overview rows persisted as one pretty-printed JSON object.
#[derive(Debug)]
pub struct JsonOverviewStore {
    path: PathBuf,
    rows: Mutex<BTreeMap<String, OverviewRow>>,
    /// Held across snapshot, write and rename so replacements never overlap
    /// and the file never goes back to an older snapshot.
    persist: AsyncMutex<()>,
}

impl JsonOverviewStore {
    /// Load existing rows from `path`; a missing or unreadable file starts
    /// an empty store.
    #[instrument(level = "info", skip_all, fields(path = %path.display()))]
    pub async fn open(path: &Path) -> Self {
        let rows = match fs::read_to_string(path).await {
            Ok(text) => serde_json::from_str::<BTreeMap<String, OverviewRow>>(&text).unwrap_or_else(|e| {
                warn!(error = %e, "Overview file unreadable; starting empty");
                BTreeMap::new()
            }),
            Err(_) => BTreeMap::new(),
        };
        info!(rows = rows.len(), "Overview store opened");
        Self {
            path: path.to_path_buf(),
            rows: Mutex::new(rows),
            persist: AsyncMutex::new(()),
        }
    }

    async fn persist(&self) -> Result<()> {
        let _guard = self.persist.lock().await;
        let json = {
            let rows = lock(&self.rows);
            serde_json::to_string_pretty(&*rows)?
        };
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

impl OverviewStore for JsonOverviewStore {
    async fn upsert(&self, key: &str, update: OverviewUpdate) -> Result<()> {
        {
            let mut rows = lock(&self.rows);
            let row = rows.entry(key.to_string()).or_insert_with(|| OverviewRow {
                site: key.to_string(),
                ..Default::default()
            });
            row.apply(&update);
        }
        self.persist().await
    }

    async fn export_snapshot(&self) -> Result<Vec<OverviewRow>> {
        Ok(lock(&self.rows).values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_used_from_counts() {
        assert_eq!(PathUsed::from_counts(1, 1), PathUsed::Both);
        assert_eq!(PathUsed::from_counts(0, 2), PathUsed::Css);
        assert_eq!(PathUsed::from_counts(0, 0), PathUsed::Neither);
        assert_eq!(serde_json::to_string(&PathUsed::Css).unwrap(), "\"CSS\"");
    }

    #[tokio::test]
    async fn upsert_merges_notes_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("overview.json");
        let store = JsonOverviewStore::open(&path).await;

        store
            .upsert(
                "https://a.test",
                OverviewUpdate {
                    sitemap_leaves: Some(2),
                    error_detail: Some("discovery: no_recent_leaves".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store
            .upsert(
                "https://a.test",
                OverviewUpdate {
                    path_used: Some(PathUsed::Neither),
                    items_total: Some(0),
                    error_detail: Some("discovery: no_recent_leaves".into()),
                    explanation: Some("sitemap_zero".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let reopened = JsonOverviewStore::open(&path).await;
        let rows = reopened.export_snapshot().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].sitemap_leaves, Some(2));
        assert_eq!(rows[0].path_used, Some(PathUsed::Neither));
        assert_eq!(rows[0].error_details, "discovery: no_recent_leaves");
        assert_eq!(rows[0].explanation, "sitemap_zero");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_upserts_all_land_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("o.json");
        let store = JsonOverviewStore::open(&path).await;

        let keys: Vec<String> = (0..60).map(|i| format!("https://s{i}.test")).collect();
        let results = futures::future::join_all(keys.iter().map(|k| {
            store.upsert(
                k,
                OverviewUpdate {
                    items_total: Some(1),
                    ..Default::default()
                },
            )
        }))
        .await;
        assert!(results.iter().all(|r| r.is_ok()));

        let reopened = JsonOverviewStore::open(&path).await;
        assert_eq!(reopened.export_snapshot().await.unwrap().len(), 60);
        assert!(!dir.path().join("o.json.tmp").exists());
    }

    #[tokio::test]
    async fn notes_are_capped() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonOverviewStore::open(&dir.path().join("o.json")).await;
        for i in 0..40 {
            store
                .upsert(
                    "k",
                    OverviewUpdate {
                        error_detail: Some(format!("error number {i}")),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        }
        let rows = store.export_snapshot().await.unwrap();
        assert!(rows[0].error_details.len() <= MAX_NOTE_LEN);
    }
}
