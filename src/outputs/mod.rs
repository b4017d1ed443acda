//! Output sinks for discovery and extraction runs.
//!
//! # Submodules
//!
//! - [`stream`]: batched, fsync'd JSON-lines writer shared by both streams
//! - [`stats`]: per-site timing log and run summary
//! - [`overview`]: per-site overview rows behind the [`overview::OverviewStore`] seam
//!
//! # Output Files
//!
//! ```text
//! selection_extraction_report_stream.jsonl   # discovery records
//! stream_scraped_articles.jsonl              # extracted items
//! stream_sites_log.jsonl                     # one line per finished site
//! stream_summary.json                        # run totals
//! pipelines_overview.json                    # per-site overview rows
//! ```

pub mod overview;
pub mod stats;
pub mod stream;

pub use overview::{JsonOverviewStore, OverviewStore, OverviewUpdate, PathUsed};
pub use stats::StatsCollector;
pub use stream::StreamWriter;
