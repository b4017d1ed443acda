//! Per-site timing log and run summary for extraction.
//!
//! Totals live behind one short-lived lock; the per-site log line is
//! appended after the lock is released. The summary file is replaced
//! atomically (temp file + rename) every `interval` sites and at the end.

use crate::context::lock;
use crate::error::Result;
use crate::models::{SiteRunStats, SourceCounts, SourceType};
use crate::utils::round3;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, instrument};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApproachCounts {
    pub sitemap_only: u64,
    pub css_only: u64,
    pub both: u64,
    pub none: u64,
}

impl ApproachCounts {
    fn add(&mut self, approaches: &[SourceType]) {
        let sitemap = approaches.contains(&SourceType::Sitemap);
        let css = approaches.contains(&SourceType::Css);
        match (sitemap, css) {
            (true, true) => self.both += 1,
            (true, false) => self.sitemap_only += 1,
            (false, true) => self.css_only += 1,
            (false, false) => self.none += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub total_duration_sec: f64,
    pub total_sites_processed: u64,
    pub total_articles: u64,
    pub articles_by_source: SourceCounts,
    pub sites_by_approach: ApproachCounts,
}

#[derive(Debug, Default)]
struct Totals {
    sites: u64,
    articles: SourceCounts,
    by_approach: ApproachCounts,
}

#[derive(Debug)]
pub struct StatsCollector {
    sites_log: PathBuf,
    summary_path: PathBuf,
    interval: usize,
    started: Instant,
    totals: Mutex<Totals>,
    /// Serialises summary replacement across concurrently finishing sites.
    persist: AsyncMutex<()>,
}

impl StatsCollector {
    /// Truncate the per-site log and start the run clock.
    pub async fn start(sites_log: &Path, summary_path: &Path, interval: usize) -> Result<Self> {
        for p in [sites_log, summary_path] {
            if let Some(dir) = p.parent().filter(|d| !d.as_os_str().is_empty()) {
                fs::create_dir_all(dir).await?;
            }
        }
        fs::write(sites_log, b"").await?;
        Ok(Self {
            sites_log: sites_log.to_path_buf(),
            summary_path: summary_path.to_path_buf(),
            interval,
            started: Instant::now(),
            totals: Mutex::new(Totals::default()),
            persist: AsyncMutex::new(()),
        })
    }

    /// Fold one finished site into the totals and append its log line.
    #[instrument(level = "debug", skip_all, fields(site = %stats.site))]
    pub async fn record_site(&self, stats: &SiteRunStats) -> Result<()> {
        let due = {
            let mut t = lock(&self.totals);
            t.sites += 1;
            t.articles.add(SourceType::Sitemap, stats.items_by_source.sitemap);
            t.articles.add(SourceType::Css, stats.items_by_source.css);
            t.by_approach.add(&stats.approaches_used);
            self.interval > 0 && t.sites % self.interval as u64 == 0
        };

        let mut line = serde_json::to_string(stats)?;
        line.push('\n');
        let mut f = OpenOptions::new().create(true).append(true).open(&self.sites_log).await?;
        f.write_all(line.as_bytes()).await?;

        if due {
            self.write_summary().await?;
        }
        Ok(())
    }

    pub fn summary(&self) -> RunSummary {
        let t = lock(&self.totals);
        RunSummary {
            total_duration_sec: round3(self.started.elapsed().as_secs_f64()),
            total_sites_processed: t.sites,
            total_articles: t.articles.total(),
            articles_by_source: t.articles,
            sites_by_approach: t.by_approach,
        }
    }

    /// Replace the summary file with the current totals.
    pub async fn write_summary(&self) -> Result<RunSummary> {
        let _guard = self.persist.lock().await;
        let summary = self.summary();
        let json = serde_json::to_string_pretty(&summary)?;
        let tmp = self.summary_path.with_extension("json.tmp");
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &self.summary_path).await?;
        info!(
            sites = summary.total_sites_processed,
            articles = summary.total_articles,
            path = %self.summary_path.display(),
            "Summary written"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site(name: &str, sitemap: u64, css: u64) -> SiteRunStats {
        let mut approaches = Vec::new();
        if sitemap > 0 {
            approaches.push(SourceType::Sitemap);
        }
        if css > 0 {
            approaches.push(SourceType::Css);
        }
        SiteRunStats {
            site: name.into(),
            started_at: "2025-01-01 00:00:00".into(),
            ended_at: "2025-01-01 00:00:01".into(),
            duration_sec: 1.0,
            items_total: sitemap + css,
            items_by_source: SourceCounts { sitemap, css },
            approaches_used: approaches,
        }
    }

    #[tokio::test]
    async fn totals_and_files() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("sites.jsonl");
        let summary = dir.path().join("summary.json");
        std::fs::write(&log, "old\n").unwrap();

        let stats = StatsCollector::start(&log, &summary, 2).await.unwrap();
        stats.record_site(&site("a", 3, 0)).await.unwrap();
        assert!(!summary.exists());
        stats.record_site(&site("b", 2, 4)).await.unwrap();
        assert!(summary.exists());
        stats.record_site(&site("c", 0, 0)).await.unwrap();
        stats.record_site(&site("d", 0, 1)).await.unwrap();

        let s = stats.write_summary().await.unwrap();
        assert_eq!(s.total_sites_processed, 4);
        assert_eq!(s.total_articles, 10);
        assert_eq!(s.articles_by_source, SourceCounts { sitemap: 5, css: 5 });
        assert_eq!(
            s.sites_by_approach,
            ApproachCounts { sitemap_only: 1, css_only: 1, both: 1, none: 1 }
        );

        let lines: Vec<String> = std::fs::read_to_string(&log).unwrap().lines().map(String::from).collect();
        assert_eq!(lines.len(), 4);
        let on_disk: RunSummary = serde_json::from_str(&std::fs::read_to_string(&summary).unwrap()).unwrap();
        assert_eq!(on_disk.sites_by_approach.both, 1);
        assert!(!dir.path().join("summary.json.tmp").exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_sites_keep_the_summary_whole() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("sites.jsonl");
        let summary = dir.path().join("summary.json");
        let stats = StatsCollector::start(&log, &summary, 1).await.unwrap();

        let names: Vec<String> = (0..40).map(|i| format!("site-{i}")).collect();
        let sites: Vec<SiteRunStats> = names.iter().map(|n| site(n, 1, 0)).collect();
        let results = futures::future::join_all(sites.iter().map(|s| stats.record_site(s))).await;
        assert!(results.iter().all(|r| r.is_ok()));

        let on_disk: RunSummary = serde_json::from_str(&std::fs::read_to_string(&summary).unwrap()).unwrap();
        assert_eq!(on_disk.total_sites_processed, 40);
        assert_eq!(std::fs::read_to_string(&log).unwrap().lines().count(), 40);
        assert!(!dir.path().join("summary.json.tmp").exists());
    }
}
