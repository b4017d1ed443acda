//! Runtime settings assembled from the CLI and an optional YAML file.
//!
//! The CLI (with its environment fallbacks) provides the base values; a
//! `--settings` YAML file may override any discovery tunable. Extraction
//! limits can be auto-tuned from the number of sites.

use crate::cli::{DiscoverArgs, ExtractArgs, Mode, SharedArgs};
use serde::Deserialize;
use std::error::Error;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Smallest CSS chunk accepted; smaller values are raised to this.
pub const MIN_CSS_CHUNK_SIZE: usize = 10_000;

/// Discovery tunables.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoverySettings {
    pub timeout: Duration,
    pub recent_hours: i64,
    pub max_depth: usize,
    pub concurrency: usize,
    pub llm_concurrency: usize,
    pub robots_browser_retry: bool,
    pub sitemap_browser_retry: bool,
    pub require_title: bool,
    pub sitemap_enabled: bool,
    pub css_fallback: bool,
    pub crawler_enabled: bool,
    pub nav_scan_limit: usize,
    pub css_chunk_size: usize,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            recent_hours: 24,
            max_depth: 3,
            concurrency: 4,
            llm_concurrency: 1,
            robots_browser_retry: true,
            sitemap_browser_retry: true,
            require_title: true,
            sitemap_enabled: true,
            css_fallback: true,
            crawler_enabled: false,
            nav_scan_limit: 0,
            css_chunk_size: 120_000,
        }
    }
}

/// Optional overrides read from the `--settings` YAML file.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SettingsOverrides {
    pub timeout_secs: Option<u64>,
    pub recent_hours: Option<i64>,
    pub max_depth: Option<usize>,
    pub concurrency: Option<usize>,
    pub llm_concurrency: Option<usize>,
    pub robots_browser_retry: Option<bool>,
    pub sitemap_browser_retry: Option<bool>,
    pub require_title: Option<bool>,
    pub disable_sitemap: Option<bool>,
    pub disable_css_fallback: Option<bool>,
    pub crawler_enabled: Option<bool>,
    pub nav_scan_limit: Option<usize>,
    pub css_chunk_size: Option<usize>,
}

impl DiscoverySettings {
    pub fn from_args(args: &DiscoverArgs, shared: &SharedArgs) -> Self {
        Self {
            timeout: Duration::from_secs(shared.timeout_secs.max(1)),
            recent_hours: args.recent_hours,
            max_depth: args.max_depth,
            concurrency: args.concurrency.max(1),
            llm_concurrency: args.llm_concurrency.max(1),
            robots_browser_retry: args.robots_browser_retry,
            sitemap_browser_retry: args.sitemap_browser_retry,
            require_title: args.require_title,
            sitemap_enabled: !args.disable_sitemap,
            css_fallback: !args.disable_css_fallback,
            crawler_enabled: args.crawler_enabled,
            nav_scan_limit: args.nav_scan_limit,
            css_chunk_size: args.css_chunk_size.max(MIN_CSS_CHUNK_SIZE),
        }
    }

    pub fn apply(&mut self, o: &SettingsOverrides) {
        if let Some(v) = o.timeout_secs {
            self.timeout = Duration::from_secs(v.max(1));
        }
        if let Some(v) = o.recent_hours {
            self.recent_hours = v;
        }
        if let Some(v) = o.max_depth {
            self.max_depth = v;
        }
        if let Some(v) = o.concurrency {
            self.concurrency = v.max(1);
        }
        if let Some(v) = o.llm_concurrency {
            self.llm_concurrency = v.max(1);
        }
        if let Some(v) = o.robots_browser_retry {
            self.robots_browser_retry = v;
        }
        if let Some(v) = o.sitemap_browser_retry {
            self.sitemap_browser_retry = v;
        }
        if let Some(v) = o.require_title {
            self.require_title = v;
        }
        if let Some(v) = o.disable_sitemap {
            self.sitemap_enabled = !v;
        }
        if let Some(v) = o.disable_css_fallback {
            self.css_fallback = !v;
        }
        if let Some(v) = o.crawler_enabled {
            self.crawler_enabled = v;
        }
        if let Some(v) = o.nav_scan_limit {
            self.nav_scan_limit = v;
        }
        if let Some(v) = o.css_chunk_size {
            self.css_chunk_size = v.max(MIN_CSS_CHUNK_SIZE);
        }
    }
}

/// Read a YAML overrides file.
pub fn load_overrides(path: &Path) -> Result<SettingsOverrides, Box<dyn Error>> {
    let raw = std::fs::read_to_string(path)?;
    let overrides: SettingsOverrides = serde_yaml::from_str(&raw)?;
    info!(path = %path.display(), "Loaded settings overrides");
    Ok(overrides)
}

/// Seed URLs from a file: a YAML list of strings, or one URL per line
/// (blank lines and `#` comments ignored).
pub fn load_seed_urls(path: &Path) -> Result<Vec<String>, Box<dyn Error>> {
    let raw = std::fs::read_to_string(path)?;
    Ok(parse_seed_urls(&raw))
}

fn parse_seed_urls(raw: &str) -> Vec<String> {
    if let Ok(list) = serde_yaml::from_str::<Vec<String>>(raw) {
        return list
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }
    raw.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(String::from)
        .collect()
}

/// Concurrency limits for the extraction run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub sites: usize,
    pub targets: usize,
    pub sitemap: usize,
    pub css: usize,
    pub http: usize,
    pub per_domain: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            sites: 1,
            targets: 6,
            sitemap: 12,
            css: 1,
            http: 24,
            per_domain: 1,
        }
    }
}

impl Limits {
    /// Tiered limits by number of sites.
    pub fn autotune(site_count: usize) -> Self {
        let (sites, targets, sitemap, css, http, per_domain) = match site_count {
            0..=10 => (3, 6, 12, 1, 24, 1),
            11..=100 => (4, 6, 12, 2, 24, 1),
            101..=500 => (6, 8, 16, 2, 32, 1),
            _ => (8, 8, 24, 2, 32, 1),
        };
        Self {
            sites,
            targets,
            sitemap,
            css,
            http,
            per_domain,
        }
    }

    fn clamped(self) -> Self {
        Self {
            sites: self.sites.max(1),
            targets: self.targets.max(1),
            sitemap: self.sitemap.max(1),
            css: self.css.max(1),
            http: self.http.max(1),
            per_domain: self.per_domain.max(1),
        }
    }
}

/// Extraction tunables.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractSettings {
    pub timeout: Duration,
    pub mode: Mode,
    pub limits: Limits,
    pub autotune: bool,
    pub queue_size: usize,
    pub sitemap_max_urls: usize,
    pub max_items: usize,
    pub summary_interval_sites: usize,
}

impl Default for ExtractSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            mode: Mode::Auto,
            limits: Limits::default(),
            autotune: false,
            queue_size: 100,
            sitemap_max_urls: 0,
            max_items: 500,
            summary_interval_sites: 10,
        }
    }
}

impl ExtractSettings {
    pub fn from_args(args: &ExtractArgs, shared: &SharedArgs) -> Self {
        Self {
            timeout: Duration::from_secs(shared.timeout_secs.max(1)),
            mode: args.mode,
            limits: Limits {
                sites: args.site_concurrency,
                targets: args.target_concurrency,
                sitemap: args.sitemap_concurrency,
                css: args.css_concurrency,
                http: args.http_concurrency,
                per_domain: args.per_domain_max,
            }
            .clamped(),
            autotune: args.autotune,
            queue_size: args.queue_size.max(1),
            sitemap_max_urls: args.sitemap_max_urls,
            max_items: args.max_items,
            summary_interval_sites: args.summary_interval_sites,
        }
    }

    /// Limits in effect for a run over `site_count` sites.
    pub fn effective_limits(&self, site_count: usize) -> Limits {
        if self.autotune {
            Limits::autotune(site_count)
        } else {
            self.limits.clamped()
        }
    }
}
