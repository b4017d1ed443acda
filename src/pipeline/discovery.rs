//! Per-site discovery: robots.txt, filter chain, recursive expansion,
//! heuristic fallback, selector detection and the CSS fallback.
//!
//! Every stage is fail-open. A stage that finds nothing records an
//! [`ErrorKind`] on the site's diagnostics and hands over to the next one;
//! the run itself never stops because of one site.

use crate::api::AskAsync;
use crate::config::DiscoverySettings;
use crate::context::RunContext;
use crate::detect::nav::NavCrawler;
use crate::detect::{CssDetector, SelectorGateway};
use crate::error::{ErrorKind, Result};
use crate::models::{
    CssFallbackReport, CssSelectorsReport, DetectedSelectors, DiscoveryEnvelope, DiscoveryRecord, LeafDetection,
};
use crate::net::{Fetcher, PageRenderer};
use crate::outputs::{OverviewStore, OverviewUpdate, StreamWriter};
use crate::sitemap::filters::StagedOutcome;
use crate::sitemap::robots::{self, parse_sitemaps};
use crate::sitemap::{Expander, Expansion, FallbackProbe, FilterChain, ProbeTally};
use crate::utils::round3;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::time::Instant;
use tracing::{error, info, instrument, warn};

/// `https://` added when the seed has no scheme; path kept.
fn seed_page_url(seed: &str) -> String {
    let seed = seed.trim();
    if seed.starts_with("http://") || seed.starts_with("https://") {
        seed.to_string()
    } else {
        format!("https://{}", seed.trim_start_matches('/'))
    }
}

fn leaf_detection(url: String, res: Result<crate::models::LeafSelectorRecord>) -> LeafDetection {
    match res {
        Ok(rec) => LeafDetection {
            url,
            field_count: Some(rec.fields.len()),
            method: Some(rec.detection_method),
            confidence: Some(rec.confidence),
            detected_selectors: Some(DetectedSelectors::from(&rec)),
            error: None,
        },
        Err(e) => LeafDetection {
            url,
            detected_selectors: None,
            field_count: None,
            method: None,
            confidence: None,
            error: Some(e.to_string()),
        },
    }
}

fn push_error(record: &mut DiscoveryRecord, kind: ErrorKind) {
    if !record.diagnostics.errors.contains(&kind) {
        record.diagnostics.errors.push(kind);
    }
}

pub struct Discovery<'a, H, B, L> {
    http: &'a H,
    browser: &'a B,
    detector: &'a L,
    ctx: &'a RunContext,
    settings: &'a DiscoverySettings,
}

impl<'a, H, B, L> Discovery<'a, H, B, L>
where
    H: Fetcher,
    B: PageRenderer,
    L: AskAsync<Response = String>,
{
    pub fn new(http: &'a H, browser: &'a B, detector: &'a L, ctx: &'a RunContext, settings: &'a DiscoverySettings) -> Self {
        Self {
            http,
            browser,
            detector,
            ctx,
            settings,
        }
    }

    /// Run every discovery stage for one seed.
    #[instrument(level = "info", skip(self))]
    pub async fn discover_site(&self, seed: &str) -> DiscoveryRecord {
        let t0 = Instant::now();
        let mut record = DiscoveryRecord {
            url: seed.trim().to_string(),
            ..Default::default()
        };
        record.diagnostics.css_fallback_status = "not_attempted".into();
        record.diagnostics.robots_browser_retry_status = robots::BrowserRetryStatus::NotAttempted.to_string();
        record.diagnostics.heuristic_browser_retry_status = "not_attempted".into();

        let usable = if self.settings.sitemap_enabled {
            self.sitemap_stage(&mut record).await
        } else {
            record.diagnostics.sitemap_source = "disabled".into();
            record.diagnostics.notes.push("sitemap discovery disabled".into());
            0
        };

        if usable > 0 {
            record.diagnostics.css_fallback_status = "not_needed".into();
        } else {
            let page_url = seed_page_url(seed);
            self.css_stage(&page_url, &mut record).await;
        }

        record.diagnostics.elapsed_sec = round3(t0.elapsed().as_secs_f64());
        info!(
            leaves = record.final_stats.after_date_filter,
            selectors = record.llm_detection.successful,
            css = record.css_fallback.success,
            elapsed_sec = record.diagnostics.elapsed_sec,
            "Site discovery finished"
        );
        record
    }

    /// Sitemap stages; returns the number of leaves with usable selectors.
    async fn sitemap_stage(&self, record: &mut DiscoveryRecord) -> usize {
        let chain = FilterChain::new(self.settings.recent_hours, Utc::now());
        let expander = Expander::new(
            self.http,
            self.ctx,
            chain,
            self.settings.max_depth,
            self.settings.require_title,
        );

        let robots = robots::resolve(
            self.http,
            self.browser,
            self.ctx,
            &record.url,
            self.settings.robots_browser_retry,
        )
        .await;
        record.robots_txt.found = robots.found;
        record.diagnostics.robots_browser_retry_status = robots.browser_retry_status.to_string();
        if !robots.found {
            push_error(record, ErrorKind::RobotsMissing);
        }

        let listed = if robots.found {
            parse_sitemaps(&robots.text, &robots.root)
        } else {
            Vec::new()
        };
        let mut expansion: Option<Expansion> = None;
        if !listed.is_empty() {
            record.diagnostics.sitemap_source = "robots".into();
            let staged = chain.run_staged(&listed, |_| None);
            self.note_staged(record, listed.len(), &staged);
            if !staged.accepted.is_empty() {
                expansion = Some(expander.expand(&staged.accepted).await);
            }
        }

        if expansion.as_ref().is_none_or(|e| e.leaves.is_empty()) {
            if let Some(found) = self.fallback_stage(record, &robots.root, &chain, &expander, listed.is_empty()).await {
                expansion = Some(found);
            }
        }

        let Some(expansion) = expansion else {
            if record.diagnostics.sitemap_source.is_empty() {
                push_error(record, ErrorKind::SitemapsMissing);
            } else {
                push_error(record, ErrorKind::NoRecentLeaves);
            }
            return 0;
        };
        record.recursive_expansion = expansion.stats.clone();
        record.final_stats = expansion.final_stats.clone();
        if expansion.leaves.is_empty() {
            push_error(record, ErrorKind::NoRecentLeaves);
            return 0;
        }

        let gateway = SelectorGateway::new(self.http, self.detector, self.settings.require_title);
        let results = gateway
            .detect_all(&expansion.leaves, self.settings.llm_concurrency)
            .await;
        let detections: Vec<LeafDetection> = results.into_iter().map(|(u, r)| leaf_detection(u, r)).collect();
        let successful = detections.iter().filter(|d| d.detected_selectors.is_some()).count();
        record.llm_detection.total_leaves = detections.len();
        record.llm_detection.successful = successful;
        record.llm_detection.failed = detections.len() - successful;
        record.llm_detection.selectors = detections;
        if successful == 0 {
            push_error(record, ErrorKind::SelectorDetectionFailed);
        }
        successful
    }

    fn note_staged(&self, record: &mut DiscoveryRecord, total: usize, staged: &StagedOutcome) {
        for v in &staged.rejected {
            self.ctx.record_rejection(v.filter);
        }
        let r = &mut record.robots_txt;
        r.sitemaps_total = total;
        r.after_word_filter = staged.after_word;
        r.after_year_filter = staged.after_year;
        r.after_date_filter = staged.after_date;
        r.rejected.extend(staged.rejected.iter().cloned());
    }

    /// Heuristic probe on the site's root, then on its apex domain. Returns
    /// the expansion of whatever the probe found.
    async fn fallback_stage(
        &self,
        record: &mut DiscoveryRecord,
        root: &str,
        chain: &FilterChain,
        expander: &Expander<'a, H>,
        fill_counts: bool,
    ) -> Option<Expansion> {
        let probe = FallbackProbe::new(self.http, self.browser, self.ctx, self.settings.sitemap_browser_retry);
        let mut tally = ProbeTally::default();
        let hit = match probe.discover(root, &mut tally).await {
            Ok(hit) => Ok(hit),
            Err(_) => probe.discover_apex(root, &mut tally).await,
        };

        let d = &mut record.diagnostics;
        d.fallback_attempts = tally.attempts;
        d.heuristic_block_detected = tally.block_detected;
        d.heuristic_browser_retry_status = match (tally.browser_attempted, tally.browser_success) {
            (_, true) => "bypassed",
            (true, false) => "failed",
            (false, false) => "not_attempted",
        }
        .into();

        let hit = match hit {
            Ok(hit) => hit,
            Err(e) => {
                info!(attempts = tally.attempts, "No sitemaps from fallback probe");
                push_error(record, e.kind());
                return None;
            }
        };
        d.sitemap_source = hit.step.as_str().into();
        d.fallback_step = Some(hit.step.as_str().into());
        d.apex_escalated = hit.apex;

        let staged = chain.run_staged(&hit.urls, |_| None);
        if fill_counts {
            self.note_staged(record, hit.urls.len(), &staged);
        } else {
            for v in &staged.rejected {
                self.ctx.record_rejection(v.filter);
            }
        }
        if staged.accepted.is_empty() {
            return None;
        }
        Some(expander.expand(&staged.accepted).await)
    }

    async fn detect_css(&self, page_url: &str) -> Result<CssSelectorsReport> {
        let css = CssDetector::new(self.browser, self.detector, self.settings.css_chunk_size);
        if self.settings.crawler_enabled {
            NavCrawler::new(self.http, &css, self.settings.nav_scan_limit)
                .crawl(page_url)
                .await
        } else {
            css.single_page(page_url).await
        }
    }

    async fn css_stage(&self, page_url: &str, record: &mut DiscoveryRecord) {
        if !self.settings.css_fallback {
            record.css_fallback = CssFallbackReport {
                reason: Some("disabled".into()),
                ..Default::default()
            };
            record.diagnostics.css_fallback_status = "skipped".into();
            return;
        }
        let reason = if self.settings.sitemap_enabled {
            "no usable leaf sitemaps"
        } else {
            "sitemap disabled"
        };
        info!(page = %page_url, reason, "Running CSS fallback");

        match self.detect_css(page_url).await {
            Ok(report) => {
                record.css_fallback = CssFallbackReport {
                    triggered: true,
                    success: true,
                    selectors: Some(report),
                    reason: Some(reason.into()),
                    failure: None,
                };
                record.diagnostics.css_fallback_status = "success".into();
            }
            Err(e) => {
                warn!(error = %e, "CSS fallback failed");
                record.css_fallback = CssFallbackReport {
                    triggered: true,
                    success: false,
                    selectors: None,
                    reason: Some(e.to_string()),
                    failure: Some(e.kind()),
                };
                record.diagnostics.css_fallback_status = "error".into();
                push_error(record, e.kind());
            }
        }
    }

    /// Discover every seed with bounded concurrency, streaming each record as
    /// it completes.
    #[instrument(level = "info", skip_all, fields(sites = seeds.len(), concurrency = self.settings.concurrency))]
    pub async fn discover_all(&self, seeds: &[String], writer: &StreamWriter) -> Vec<DiscoveryRecord> {
        stream::iter(seeds.iter())
            .map(|seed| async move {
                let record = self.discover_site(seed).await;
                let envelope = DiscoveryEnvelope {
                    timestamp: Utc::now().to_rfc3339(),
                    result: record,
                };
                if let Err(e) = writer.send(&envelope).await {
                    error!(site = %seed, error = %e, "Failed to queue discovery record");
                }
                envelope.result
            })
            .buffer_unordered(self.settings.concurrency.max(1))
            .collect()
            .await
    }
}

/// Overview row update describing a site's discovery outcome.
pub fn overview_update(record: &DiscoveryRecord) -> OverviewUpdate {
    let detail = record
        .diagnostics
        .errors
        .iter()
        .map(|k| format!("discovery: {k}"))
        .collect::<Vec<_>>()
        .join(" | ");
    OverviewUpdate {
        sitemap_leaves: Some(record.llm_detection.successful),
        css_sections: Some(
            record
                .css_fallback
                .selectors
                .as_ref()
                .map_or(0, |s| s.total_sections),
        ),
        error_detail: (!detail.is_empty()).then_some(detail),
        ..Default::default()
    }
}

/// Push every record's outcome into the overview store.
pub async fn record_overview<S: OverviewStore>(store: &S, records: &[DiscoveryRecord]) {
    for r in records {
        if let Err(e) = store.upsert(&r.url, overview_update(r)).await {
            warn!(site = %r.url, error = %e, "Overview update failed");
        }
    }
}
