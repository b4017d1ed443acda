//! Network access: plain HTTP through [`http::Fetcher`] and rendered pages
//! through [`browser::PageRenderer`].

pub mod browser;
pub mod http;

pub use browser::{BrowserlessRenderer, PageRenderer, RenderedPage};
pub use http::{FetchResponse, Fetcher, HttpFetcher};
