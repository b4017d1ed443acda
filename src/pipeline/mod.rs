//! The two run stages.
//!
//! - [`discovery`]: seeds in, discovery records out
//! - [`targets`]: discovery records or a targets file in, extraction targets out
//! - [`extract`]: item extraction from sitemaps and rendered pages
//! - [`orchestrator`]: runs targets under the concurrency limits

pub mod discovery;
pub mod extract;
pub mod orchestrator;
pub mod targets;

pub use discovery::Discovery;
pub use orchestrator::{Orchestrator, SiteOutcome};
