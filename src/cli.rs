//! Command-line interface definitions for the sitemap scout.
//!
//! This module defines the CLI arguments and options using the `clap` crate.
//! Every tunable can be provided via a command-line flag or an environment
//! variable; boolean switches accept `1/0`, `true/false`, `yes/no`, `on/off`.

use clap::builder::BoolishValueParser;
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Command-line arguments for the sitemap scout.
///
/// # Examples
///
/// ```sh
/// # Discover sitemaps and selectors for two sites
/// news_sitemap_scout discover --url https://news.example --url example.org
///
/// # Extract items from the discovery stream
/// news_sitemap_scout extract --stream selection_extraction_report_stream.jsonl
///
/// # Extract from a hand-edited targets file, sitemap targets only
/// news_sitemap_scout extract --targets targets.json --mode sitemap
/// ```
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    #[command(flatten)]
    pub shared: SharedArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Resolve robots.txt, expand sitemaps, detect selectors
    Discover(DiscoverArgs),
    /// Run extraction targets and stream items to disk
    Extract(ExtractArgs),
}

/// Options shared by every subcommand.
#[derive(Args, Debug, Clone)]
pub struct SharedArgs {
    /// Per-request timeout in seconds for HTTP, XML and browser fetches
    #[arg(long, global = true, env = "SCOUT_TIMEOUT_SECS", default_value_t = 15)]
    pub timeout_secs: u64,

    /// Base URL of a Browserless-compatible rendering service
    #[arg(long, global = true, env = "BROWSERLESS_URL")]
    pub browserless_url: Option<String>,

    /// Token for the rendering service
    #[arg(long, global = true, env = "BROWSERLESS_TOKEN")]
    pub browserless_token: Option<String>,

    /// Proxy server handed to the headless browser
    #[arg(long, global = true, env = "PROXY_SERVER")]
    pub proxy_server: Option<String>,

    /// Optional path to the detector's config.yaml
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Chat template used for selector detection
    #[arg(long, global = true, env = "SCOUT_TEMPLATE", default_value = "selector_detector")]
    pub template: String,

    /// JSON file backing the per-site overview rows
    #[arg(long, global = true, env = "SCOUT_OVERVIEW", default_value = "pipelines_overview.json")]
    pub overview: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct DiscoverArgs {
    /// Seed site URL (repeatable)
    #[arg(short, long = "url")]
    pub urls: Vec<String>,

    /// File with one seed URL per line, or a YAML list
    #[arg(long)]
    pub urls_file: Option<PathBuf>,

    /// Discovery stream output (JSON lines)
    #[arg(short, long, default_value = "selection_extraction_report_stream.jsonl")]
    pub out: PathBuf,

    /// Also write a targets file for the extract step
    #[arg(long)]
    pub targets_out: Option<PathBuf>,

    /// YAML file overriding discovery tunables
    #[arg(long)]
    pub settings: Option<PathBuf>,

    /// Recency window in hours
    #[arg(long, env = "RECENT_HOURS", default_value_t = 24)]
    pub recent_hours: i64,

    /// Maximum sitemap index depth
    #[arg(long, default_value_t = 3)]
    pub max_depth: usize,

    /// Sites processed concurrently
    #[arg(long, default_value_t = 4)]
    pub concurrency: usize,

    /// Leaves sent to the detector concurrently
    #[arg(long, default_value_t = 1)]
    pub llm_concurrency: usize,

    /// Retry blocked robots.txt through the browser
    #[arg(long, env = "ROBOTS_BROWSER_RETRY", action = ArgAction::Set, value_parser = BoolishValueParser::new(), default_value = "true")]
    pub robots_browser_retry: bool,

    /// Retry blocked sitemap candidates through the browser
    #[arg(long, env = "SITEMAP_BROWSER_RETRY", action = ArgAction::Set, value_parser = BoolishValueParser::new(), default_value = "true")]
    pub sitemap_browser_retry: bool,

    /// Require a title-like field in accepted leaves
    #[arg(long, env = "SITEMAP_REQUIRE_ANY_TITLE", action = ArgAction::Set, value_parser = BoolishValueParser::new(), default_value = "true")]
    pub require_title: bool,

    /// Skip sitemap discovery and go straight to CSS fallback
    #[arg(long, env = "DISABLE_SITEMAP", action = ArgAction::Set, value_parser = BoolishValueParser::new(), default_value = "false")]
    pub disable_sitemap: bool,

    /// Never run the CSS fallback
    #[arg(long, env = "DISABLE_CSS_FALLBACK", action = ArgAction::Set, value_parser = BoolishValueParser::new(), default_value = "false")]
    pub disable_css_fallback: bool,

    /// Use the nav-link crawler for CSS fallback
    #[arg(long, env = "CRAWLER_ENABLED", action = ArgAction::Set, value_parser = BoolishValueParser::new(), default_value = "false")]
    pub crawler_enabled: bool,

    /// Maximum nav links scanned by the crawler (0 = all)
    #[arg(long, env = "NAV_SCAN_LIMIT", default_value_t = 0)]
    pub nav_scan_limit: usize,

    /// HTML chunk size in characters for CSS detection
    #[arg(long, env = "CSS_CHUNK_SIZE", default_value_t = 120_000)]
    pub css_chunk_size: usize,
}

/// What kinds of targets to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Each target runs as its own type
    Auto,
    Sitemap,
    Css,
    Both,
}

#[derive(Args, Debug, Clone)]
pub struct ExtractArgs {
    /// Discovery stream to read targets from
    #[arg(long, conflicts_with = "targets", required_unless_present = "targets")]
    pub stream: Option<PathBuf>,

    /// Targets file to read instead of the discovery stream
    #[arg(long)]
    pub targets: Option<PathBuf>,

    /// Extracted items output (JSON lines)
    #[arg(short, long, default_value = "stream_scraped_articles.jsonl")]
    pub out: PathBuf,

    /// Per-site timing log (JSON lines)
    #[arg(long, default_value = "stream_sites_log.jsonl")]
    pub sites_log: PathBuf,

    /// Run summary (rewritten atomically)
    #[arg(long, default_value = "stream_summary.json")]
    pub summary: PathBuf,

    /// Rewrite the summary after this many completed sites (0 = only at the end)
    #[arg(long, default_value_t = 10)]
    pub summary_interval_sites: usize,

    #[arg(long, value_enum, default_value_t = Mode::Auto)]
    pub mode: Mode,

    /// Pick concurrency limits from the number of sites
    #[arg(long, action = ArgAction::Set, value_parser = BoolishValueParser::new(), default_value = "false")]
    pub autotune: bool,

    #[arg(long, default_value_t = 1)]
    pub site_concurrency: usize,

    #[arg(long, default_value_t = 6)]
    pub target_concurrency: usize,

    #[arg(long, default_value_t = 12)]
    pub sitemap_concurrency: usize,

    #[arg(long, default_value_t = 1)]
    pub css_concurrency: usize,

    #[arg(long, default_value_t = 24)]
    pub http_concurrency: usize,

    #[arg(long, default_value_t = 1)]
    pub per_domain_max: usize,

    /// Writer queue capacity
    #[arg(long, default_value_t = 100)]
    pub queue_size: usize,

    /// Cap on items taken from one leaf sitemap (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    pub sitemap_max_urls: usize,

    /// Cap on items taken from one CSS page
    #[arg(long, default_value_t = 500)]
    pub max_items: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discover_parsing() {
        let cli = Cli::parse_from([
            "news_sitemap_scout",
            "discover",
            "--url",
            "https://news.test",
            "-u",
            "other.test",
            "--recent-hours",
            "48",
            "--disable-css-fallback",
            "yes",
        ]);
        let Command::Discover(args) = cli.command else {
            panic!("expected discover");
        };
        assert_eq!(args.urls, vec!["https://news.test", "other.test"]);
        assert_eq!(args.recent_hours, 48);
        assert!(args.disable_css_fallback);
        assert_eq!(args.max_depth, 3);
        assert_eq!(args.css_chunk_size, 120_000);
    }

    #[test]
    fn test_extract_defaults() {
        let cli = Cli::parse_from(["news_sitemap_scout", "extract", "--stream", "s.jsonl"]);
        let Command::Extract(args) = cli.command else {
            panic!("expected extract");
        };
        assert_eq!(args.mode, Mode::Auto);
        assert_eq!(args.site_concurrency, 1);
        assert_eq!(args.target_concurrency, 6);
        assert_eq!(args.sitemap_concurrency, 12);
        assert_eq!(args.http_concurrency, 24);
        assert_eq!(args.max_items, 500);
        assert_eq!(cli.shared.timeout_secs, 15);
    }

    #[test]
    fn test_extract_requires_an_input() {
        assert!(Cli::try_parse_from(["news_sitemap_scout", "extract"]).is_err());
        assert!(
            Cli::try_parse_from([
                "news_sitemap_scout",
                "extract",
                "--stream",
                "a",
                "--targets",
                "b"
            ])
            .is_err()
        );
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::parse_from([
            "news_sitemap_scout",
            "extract",
            "--targets",
            "t.json",
            "--mode",
            "both",
            "--timeout-secs",
            "30",
        ]);
        assert_eq!(cli.shared.timeout_secs, 30);
        let Command::Extract(args) = cli.command else {
            panic!("expected extract");
        };
        assert_eq!(args.mode, Mode::Both);
    }
}
