//! Sitemap discovery: robots.txt, the filter chain, recursive expansion and
//! the heuristic fallback probe.

pub mod expander;
pub mod fallback;
pub mod filters;
pub mod robots;
pub mod xml;

pub use expander::{Expander, Expansion};
pub use fallback::{FallbackHit, FallbackProbe, ProbeTally};
pub use filters::FilterChain;
pub use robots::{BrowserRetryStatus, RobotsOutcome};
