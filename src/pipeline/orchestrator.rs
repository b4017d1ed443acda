//! Extraction orchestrator.
//!
//! Sites run in a bounded pool; each site runs its targets in a second
//! bounded pool. Every target holds a permit from its kind's semaphore
//! (sitemap or css), then the shared HTTP semaphore, then its domain's
//! semaphore, always in that order. Browser renders additionally take a
//! render permit, sized by the css limit, held only around the render call.
//!
//! # Fetch paths
//!
//! A target is first fetched directly (plain HTTP). When that yields nothing
//! and a probe of the URL looks blocked, the target is retried once through
//! the browser; a successful retry promotes the domain. Promoted domains go
//! browser-first for the rest of the run with one direct fallback.

use crate::cli::Mode;
use crate::config::{ExtractSettings, Limits};
use crate::context::{RunContext, lock};
use crate::error::{CrawlError, ErrorKind, Result};
use crate::models::{ExtractionTarget, ScrapedItem, SiteRunStats, SiteState, SourceCounts, SourceType};
use crate::net::http::{BlockClass, classify, fetch_sitemap_bytes, probe};
use crate::net::{Fetcher, PageRenderer};
use crate::outputs::{OverviewStore, OverviewUpdate, PathUsed, StatsCollector, StreamWriter};
use crate::pipeline::extract::{Item, css_items, rendered_sitemap_items, sitemap_items_from_bytes};
use crate::utils::{round3, stream_ts};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchPath {
    Direct,
    Browser,
}

/// What one site produced.
#[derive(Debug, Clone, PartialEq)]
pub struct SiteOutcome {
    pub stats: SiteRunStats,
    pub state: SiteState,
    /// Targets scheduled under the run's mode.
    pub scheduled: usize,
    pub had_sitemap: bool,
    pub had_css: bool,
    /// Error kinds of targets that failed outright.
    pub failures: Vec<ErrorKind>,
    /// Failed targets whose error another attempt may still clear.
    pub retryable_failures: usize,
}

impl SiteOutcome {
    fn zero_reasons(&self) -> Vec<String> {
        let by = &self.stats.items_by_source;
        let mut reasons = Vec::new();
        if self.scheduled == 0 {
            reasons.push("selection_not_run_or_no_targets".to_string());
            return reasons;
        }
        if self.had_sitemap && by.sitemap == 0 {
            reasons.push("sitemap_zero".to_string());
        }
        if self.had_css && by.css == 0 {
            reasons.push("css_zero".to_string());
        }
        reasons
    }

    /// Overview row update for this site's extraction.
    pub fn overview_update(&self) -> OverviewUpdate {
        let by = self.stats.items_by_source;
        let mut reasons = self.zero_reasons();
        let kinds: Vec<&str> = self.failures.iter().map(|k| k.as_str()).collect();
        if !kinds.is_empty() {
            reasons.push(format!("target_exceptions: {}", kinds.join(",")));
        }
        let error_detail = (!reasons.is_empty()).then(|| {
            let mut detail = format!(
                "extraction: {}; targets={}; sitemapItems={}; cssItems={}",
                reasons.join(", "),
                self.scheduled,
                by.sitemap,
                by.css
            );
            if !self.failures.is_empty() {
                detail.push_str(&format!("; retryableFailures={}", self.retryable_failures));
            }
            detail
        });

        let zero_items_reason = if self.stats.items_total > 0 {
            String::new()
        } else if self.scheduled == 0 {
            "selection_not_run_or_no_targets".to_string()
        } else {
            let mut parts = Vec::new();
            if self.had_sitemap {
                parts.push("sitemap_zero");
            }
            if self.had_css {
                parts.push("css_zero");
            }
            if !self.failures.is_empty() {
                parts.push("target_exceptions");
            }
            if parts.is_empty() { "unknown".to_string() } else { parts.join(", ") }
        };

        let explanation = if self.scheduled == 0 {
            Some("Extraction: selection produced no targets to scrape.".to_string())
        } else {
            let mut msgs = Vec::new();
            if self.had_sitemap && by.sitemap == 0 {
                msgs.push("sitemap extraction returned 0 items".to_string());
            }
            if self.had_css && by.css == 0 {
                msgs.push("CSS extraction returned 0 items".to_string());
            }
            if !kinds.is_empty() {
                msgs.push(format!("errors occurred ({})", kinds.join(", ")));
            }
            (!msgs.is_empty()).then(|| format!("Extraction: {}.", msgs.join("; ")))
        };

        OverviewUpdate {
            path_used: Some(PathUsed::from_counts(by.sitemap, by.css)),
            items_total: Some(self.stats.items_total),
            scrape_time_sec: Some(self.stats.duration_sec),
            zero_items_reason: Some(zero_items_reason),
            error_detail,
            explanation,
            ..Default::default()
        }
    }
}

pub struct Orchestrator<'a, H, B> {
    http: &'a H,
    browser: &'a B,
    ctx: &'a RunContext,
    settings: &'a ExtractSettings,
    limits: Limits,
    sitemap_sem: Semaphore,
    css_sem: Semaphore,
    http_sem: Semaphore,
    render_sem: Semaphore,
    domain_sems: Mutex<HashMap<String, Arc<Semaphore>>>,
    states: Mutex<HashMap<String, SiteState>>,
}

impl<'a, H, B> Orchestrator<'a, H, B>
where
    H: Fetcher,
    B: PageRenderer,
{
    /// Limits come from `settings`, auto-tuned by `site_count` when enabled.
    pub fn new(http: &'a H, browser: &'a B, ctx: &'a RunContext, settings: &'a ExtractSettings, site_count: usize) -> Self {
        let limits = settings.effective_limits(site_count);
        info!(
            sites = limits.sites,
            targets = limits.targets,
            sitemap = limits.sitemap,
            css = limits.css,
            http = limits.http,
            per_domain = limits.per_domain,
            "Extraction limits"
        );
        Self {
            http,
            browser,
            ctx,
            settings,
            limits,
            sitemap_sem: Semaphore::new(limits.sitemap),
            css_sem: Semaphore::new(limits.css),
            http_sem: Semaphore::new(limits.http),
            render_sem: Semaphore::new(limits.css),
            domain_sems: Mutex::new(HashMap::new()),
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    pub fn site_state(&self, site: &str) -> Option<SiteState> {
        lock(&self.states).get(site).copied()
    }

    fn set_state(&self, site: &str, state: SiteState) {
        lock(&self.states).insert(site.to_string(), state);
    }

    fn domain_sem(&self, domain: &str) -> Arc<Semaphore> {
        let mut sems = lock(&self.domain_sems);
        Arc::clone(
            sems.entry(domain.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(self.limits.per_domain))),
        )
    }

    fn selected(&self, target: &ExtractionTarget) -> bool {
        match self.settings.mode {
            Mode::Auto | Mode::Both => true,
            Mode::Sitemap => target.source_type() == SourceType::Sitemap,
            Mode::Css => target.source_type() == SourceType::Css,
        }
    }

    async fn attempt(&self, target: &ExtractionTarget, path: FetchPath) -> Result<Vec<Item>> {
        match (target, path) {
            (
                ExtractionTarget::Sitemap {
                    sitemap_url,
                    item_tag,
                    fields,
                    ..
                },
                FetchPath::Direct,
            ) => {
                let body = fetch_sitemap_bytes(self.http, sitemap_url).await?;
                sitemap_items_from_bytes(&body, item_tag, fields, self.settings.sitemap_max_urls)
            }
            (
                ExtractionTarget::Sitemap {
                    sitemap_url,
                    item_tag,
                    fields,
                    ..
                },
                FetchPath::Browser,
            ) => {
                let _render = self.render_sem.acquire().await?;
                let text = self.browser.inner_text(sitemap_url).await?;
                Ok(rendered_sitemap_items(&text, item_tag, fields, self.settings.sitemap_max_urls))
            }
            (ExtractionTarget::Css { page_url, sections, .. }, FetchPath::Direct) => {
                let resp = self.http.get(page_url).await?;
                if !resp.is_success() {
                    return Err(CrawlError::Status {
                        url: page_url.clone(),
                        status: resp.status,
                    });
                }
                Ok(css_items(&resp.text(), page_url, sections, self.settings.max_items))
            }
            (ExtractionTarget::Css { page_url, sections, .. }, FetchPath::Browser) => {
                let _render = self.render_sem.acquire().await?;
                let page = self.browser.render(page_url).await?;
                Ok(css_items(&page.html, page_url, sections, self.settings.max_items))
            }
        }
    }

    /// Run one target under its semaphores, escalating to the browser when
    /// the direct path looks blocked.
    #[instrument(level = "info", skip_all, fields(url = %target.fetch_url(), source = target.source_type().as_str()))]
    pub async fn run_target(&self, target: &ExtractionTarget) -> Result<Vec<Item>> {
        let domain = target.domain();
        let kind_sem = match target.source_type() {
            SourceType::Sitemap => &self.sitemap_sem,
            SourceType::Css => &self.css_sem,
        };
        let domain_sem = self.domain_sem(&domain);
        let _kind = kind_sem.acquire().await?;
        let _http = self.http_sem.acquire().await?;
        let _domain = domain_sem.acquire().await?;

        if self.ctx.is_promoted(&domain) {
            match self.attempt(target, FetchPath::Browser).await {
                Ok(items) if !items.is_empty() => return Ok(items),
                Ok(_) => debug!("Browser-first attempt empty; trying direct"),
                Err(e) => debug!(error = %e, "Browser-first attempt failed; trying direct"),
            }
            return self.attempt(target, FetchPath::Direct).await;
        }

        let direct = self.attempt(target, FetchPath::Direct).await;
        if matches!(&direct, Ok(items) if !items.is_empty()) {
            return direct;
        }

        let Some(class) = probe(self.http, target.fetch_url())
            .await
            .as_ref()
            .and_then(classify)
            .filter(BlockClass::warrants_browser)
        else {
            return direct;
        };
        info!(subtype = %class.subtype(), "Direct fetch looks blocked; retrying through the browser");
        match self.attempt(target, FetchPath::Browser).await {
            Ok(items) if !items.is_empty() => {
                info!(items = items.len(), "Browser retry succeeded");
                self.ctx.promote(&domain);
                Ok(items)
            }
            Ok(_) => {
                warn!("Browser retry returned no items");
                Err(class.into_error(target.fetch_url()))
            }
            Err(e) => {
                warn!(error = %e, "Browser retry failed");
                Err(class.into_error(target.fetch_url()))
            }
        }
    }

    /// Run every scheduled target of one site, streaming items as targets
    /// finish.
    #[instrument(level = "info", skip_all, fields(site = %site, targets = targets.len()))]
    pub async fn run_site(&self, site: &str, targets: &[ExtractionTarget], writer: &StreamWriter) -> SiteOutcome {
        self.set_state(site, SiteState::Running);
        let started_at = Utc::now().to_rfc3339();
        let t0 = Instant::now();

        let scheduled: Vec<&ExtractionTarget> = targets.iter().filter(|t| self.selected(t)).collect();
        let mut approaches: Vec<SourceType> = scheduled.iter().map(|t| t.source_type()).collect();
        approaches.sort();
        approaches.dedup();

        let mut counts = SourceCounts::default();
        let mut failures: Vec<ErrorKind> = Vec::new();
        let mut failed_targets = 0usize;
        let mut retryable_failures = 0usize;

        let mut results = stream::iter(scheduled.iter().copied())
            .map(|t| async move { (t, self.run_target(t).await) })
            .buffer_unordered(self.limits.targets.max(1));
        while let Some((target, res)) = results.next().await {
            match res {
                Ok(items) => {
                    let source = target.source_type();
                    counts.add(source, items.len() as u64);
                    for item in items {
                        let record = ScrapedItem {
                            site: site.to_string(),
                            source_type: source,
                            item,
                            ts: stream_ts(),
                        };
                        if let Err(e) = writer.send(&record).await {
                            error!(error = %e, "Failed to queue item");
                        }
                    }
                }
                Err(e) => {
                    warn!(url = %target.fetch_url(), kind = %e.kind(), retryable = e.retryable(), error = %e, "Target failed");
                    failed_targets += 1;
                    if e.retryable() {
                        retryable_failures += 1;
                    }
                    if !failures.contains(&e.kind()) {
                        failures.push(e.kind());
                    }
                }
            }
        }

        let state = if !scheduled.is_empty() && failed_targets == scheduled.len() {
            SiteState::Failed
        } else {
            SiteState::Completed
        };
        self.set_state(site, state);

        let stats = SiteRunStats {
            site: site.to_string(),
            started_at,
            ended_at: Utc::now().to_rfc3339(),
            duration_sec: round3(t0.elapsed().as_secs_f64()),
            items_total: counts.total(),
            items_by_source: counts,
            approaches_used: approaches,
        };
        info!(
            items = stats.items_total,
            sitemap = counts.sitemap,
            css = counts.css,
            duration_sec = stats.duration_sec,
            state = ?state,
            "Site finished"
        );
        SiteOutcome {
            stats,
            state,
            scheduled: scheduled.len(),
            had_sitemap: scheduled.iter().any(|t| t.source_type() == SourceType::Sitemap),
            had_css: scheduled.iter().any(|t| t.source_type() == SourceType::Css),
            failures,
            retryable_failures,
        }
    }

    /// Run every site. Each finished site is folded into `stats` and its
    /// overview row updated as soon as it completes; both sinks serialise
    /// their own file replacement.
    #[instrument(level = "info", skip_all, fields(sites = sites.len(), mode = ?self.settings.mode))]
    pub async fn run<S: OverviewStore>(
        &self,
        sites: &[(String, Vec<ExtractionTarget>)],
        writer: &StreamWriter,
        stats: &StatsCollector,
        store: &S,
    ) -> Vec<SiteOutcome> {
        for (site, _) in sites {
            self.set_state(site, SiteState::Pending);
        }
        let outcomes: Vec<SiteOutcome> = stream::iter(sites.iter())
            .map(|(site, targets)| async move {
                let outcome = self.run_site(site, targets, writer).await;
                if let Err(e) = stats.record_site(&outcome.stats).await {
                    warn!(site = %site, error = %e, "Failed to record site stats");
                }
                if let Err(e) = store.upsert(site, outcome.overview_update()).await {
                    warn!(site = %site, error = %e, "Overview update failed");
                }
                outcome
            })
            .buffer_unordered(self.limits.sites.max(1))
            .collect()
            .await;

        let failed = outcomes.iter().filter(|o| o.state == SiteState::Failed).count();
        info!(
            sites = outcomes.len(),
            failed,
            promoted = self.ctx.promoted_domains().len(),
            "Extraction finished"
        );
        outcomes
    }
}
