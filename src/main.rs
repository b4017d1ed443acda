//! # News Sitemap Scout
//!
//! Finds fresh news sitemaps for arbitrary sites, detects how to read their
//! items, and streams the extracted items to disk.
//!
//! ## Features
//!
//! - Resolves robots.txt (with a one-shot browser retry for blocked hosts)
//!   and probes default, CMS and homepage-linked sitemap locations
//! - Filters sitemap URLs by keyword, year and recency, and recursively
//!   expands sitemap indexes down to fresh leaves
//! - Detects per-leaf field paths through an OpenAI-compatible model, with a
//!   structural fallback
//! - Falls back to CSS selector detection on rendered pages (optionally
//!   crawling navigation links) when a site has no usable sitemap
//! - Extracts items under bounded concurrency with per-domain proxy promotion
//!
//! ## Usage
//!
//! ```sh
//! news_sitemap_scout discover -u https://news.example --targets-out targets.json
//! news_sitemap_scout extract --targets targets.json --autotune true
//! ```
//!
//! ## Architecture
//!
//! 1. **Discovery**: seeds → robots/fallback → filter chain → expansion →
//!    selector detection → CSS fallback, one JSON line per site
//! 2. **Targets**: discovery records (or a targets file) → extraction targets
//! 3. **Extraction**: targets → items stream, per-site log, run summary and
//!    overview rows

use awful_aj::{config_dir, template};
use clap::Parser;
use itertools::Itertools;
use std::error::Error;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, error, info, instrument};
use tracing_subscriber::{EnvFilter, fmt as tfmt};

mod api;
mod cli;
mod config;
mod context;
mod detect;
mod error;
mod models;
mod net;
mod outputs;
mod pipeline;
mod sitemap;
mod utils;

use api::{AskFnWrapper, RetryAsk};
use cli::{Cli, Command, DiscoverArgs, ExtractArgs, SharedArgs};
use config::{DiscoverySettings, ExtractSettings, load_overrides, load_seed_urls};
use context::RunContext;
use models::ExtractionTarget;
use net::{BrowserlessRenderer, HttpFetcher};
use outputs::{JsonOverviewStore, StatsCollector, StreamWriter};
use pipeline::discovery::record_overview;
use pipeline::targets::{
    group_by_site, load_discovery_stream, load_targets_file, targets_from_record, targets_from_records,
    write_targets_file,
};
use pipeline::{Discovery, Orchestrator};
use utils::ensure_writable_parent;

/// Queue capacity of the discovery stream writer.
const DISCOVERY_QUEUE_SIZE: usize = 100;
const DETECTOR_MAX_RETRIES: usize = 3;
const DETECTOR_BASE_DELAY: Duration = Duration::from_secs(1);

#[tokio::main]
#[instrument]
async fn main() -> Result<(), Box<dyn Error>> {
    // --- Tracing init ---
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();

    let start_time = std::time::Instant::now();
    info!("news_sitemap_scout starting up");

    let args = Cli::parse();
    debug!(?args.command, "Parsed CLI arguments");

    let timeout = Duration::from_secs(args.shared.timeout_secs.max(1));
    let http = HttpFetcher::new(timeout)?;
    let browser = BrowserlessRenderer::new(
        args.shared.browserless_url.as_deref(),
        args.shared.browserless_token.as_deref(),
        args.shared.proxy_server.as_deref(),
        timeout,
    )?;
    if !browser.is_configured() {
        info!("No rendering service configured; browser retries and CSS fallback will fail open");
    }

    let res = match &args.command {
        Command::Discover(d) => run_discover(&args.shared, d, &http, &browser).await,
        Command::Extract(e) => run_extract(&args.shared, e, &http, &browser).await,
    };
    if let Err(e) = &res {
        error!(error = %e, "Run failed");
    }

    let elapsed = start_time.elapsed();
    info!(
        ?elapsed,
        secs = elapsed.as_secs(),
        millis = elapsed.subsec_millis(),
        "Execution complete"
    );
    res
}

#[instrument(level = "info", skip_all)]
async fn run_discover(
    shared: &SharedArgs,
    args: &DiscoverArgs,
    http: &HttpFetcher,
    browser: &BrowserlessRenderer,
) -> Result<(), Box<dyn Error>> {
    let mut seeds = args.urls.clone();
    if let Some(path) = &args.urls_file {
        seeds.extend(load_seed_urls(path)?);
    }
    let seeds: Vec<String> = seeds
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unique()
        .collect();
    if seeds.is_empty() {
        return Err("no seed URLs given (use --url or --urls-file)".into());
    }

    let mut settings = DiscoverySettings::from_args(args, shared);
    if let Some(path) = &args.settings {
        settings.apply(&load_overrides(path)?);
    }
    debug!(?settings, "Discovery settings");

    // Early check: the stream must be writable before any site is crawled
    if let Err(e) = ensure_writable_parent(&args.out).await {
        error!(
            path = %args.out.display(),
            error = %e,
            "Discovery output directory is not writable (fix perms or choose a different path)"
        );
        return Err(e);
    }

    // ---- Load detector template & config ----
    let template = template::load_template(&shared.template).await?;
    info!(template = %shared.template, "Loaded template");
    let conf_file = match &shared.config {
        Some(p) => PathBuf::from(p),
        None => config_dir()?.join("config.yaml"),
    };
    let detector_config = awful_aj::config::load_config(&conf_file.to_string_lossy())?;
    info!(config_path = %conf_file.display(), "Loaded configuration");
    let detector = RetryAsk::new(
        AskFnWrapper {
            config: &detector_config,
            template: &template,
        },
        DETECTOR_MAX_RETRIES,
        DETECTOR_BASE_DELAY,
    );

    let ctx = RunContext::new();
    let writer = StreamWriter::start(&args.out, DISCOVERY_QUEUE_SIZE).await?;
    let records = Discovery::new(http, browser, &detector, &ctx, &settings)
        .discover_all(&seeds, &writer)
        .await;
    let lines = writer.close().await?;
    info!(sites = records.len(), lines, path = %args.out.display(), "Discovery stream written");

    let store = JsonOverviewStore::open(&shared.overview).await;
    record_overview(&store, &records).await;

    if let Some(path) = &args.targets_out {
        let targets = targets_from_records(&records);
        write_targets_file(path, &targets).await?;
    }

    let with_leaves = records.iter().filter(|r| r.llm_detection.successful > 0).count();
    let with_css = records.iter().filter(|r| r.css_fallback.success).count();
    info!(
        sites = records.len(),
        with_leaves,
        with_css,
        promoted = ctx.promoted_domains().len(),
        "Discovery complete"
    );
    Ok(())
}

#[instrument(level = "info", skip_all)]
async fn run_extract(
    shared: &SharedArgs,
    args: &ExtractArgs,
    http: &HttpFetcher,
    browser: &BrowserlessRenderer,
) -> Result<(), Box<dyn Error>> {
    let sites: Vec<(String, Vec<ExtractionTarget>)> = match (&args.stream, &args.targets) {
        (Some(stream), _) => load_discovery_stream(stream)
            .await?
            .iter()
            .map(|r| (r.url.clone(), targets_from_record(r)))
            .collect(),
        (None, Some(path)) => group_by_site(load_targets_file(path).await?),
        (None, None) => return Err("either --stream or --targets is required".into()),
    };
    let target_count: usize = sites.iter().map(|(_, t)| t.len()).sum();
    info!(sites = sites.len(), targets = target_count, "Targets loaded");

    if let Err(e) = ensure_writable_parent(&args.out).await {
        error!(
            path = %args.out.display(),
            error = %e,
            "Extraction output directory is not writable (fix perms or choose a different path)"
        );
        return Err(e);
    }

    let settings = ExtractSettings::from_args(args, shared);
    let ctx = RunContext::new();
    let writer = StreamWriter::start(&args.out, settings.queue_size).await?;
    let stats = StatsCollector::start(&args.sites_log, &args.summary, settings.summary_interval_sites).await?;
    let store = JsonOverviewStore::open(&shared.overview).await;

    let orchestrator = Orchestrator::new(http, browser, &ctx, &settings, sites.len());
    let outcomes = orchestrator.run(&sites, &writer, &stats, &store).await;

    let lines = writer.close().await?;
    let summary = stats.write_summary().await?;
    info!(
        sites = outcomes.len(),
        items = summary.total_articles,
        sitemap_items = summary.articles_by_source.sitemap,
        css_items = summary.articles_by_source.css,
        lines,
        promoted = ?ctx.promoted_domains(),
        "Extraction complete"
    );
    Ok(())
}
