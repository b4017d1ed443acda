//! Plain HTTP fetching, gzip handling and block classification.
//!
//! [`Fetcher`] is the seam every stage fetches through; [`HttpFetcher`] is
//! the reqwest-backed implementation. Probing a URL and classifying the
//! response decides whether a browser-rendered retry is worth spending.

use crate::error::{CrawlError, Result};
use flate2::read::GzDecoder;
use rand::seq::IndexedRandom;
use reqwest::redirect::Policy;
use std::io::Read;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/128.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_5) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.5 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/127.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:129.0) Gecko/20100101 Firefox/129.0",
];

const ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";

pub fn random_user_agent() -> &'static str {
    USER_AGENTS
        .choose(&mut rand::rng())
        .copied()
        .unwrap_or(USER_AGENTS[0])
}

/// A fully-read HTTP response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchResponse {
    pub url: String,
    pub status: u16,
    /// Header names are lower-cased.
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl FetchResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Anything that can GET a URL.
pub trait Fetcher {
    /// GET following redirects.
    async fn get(&self, url: &str) -> Result<FetchResponse>;

    /// GET without following redirects; 3xx comes back as-is.
    async fn get_no_redirect(&self, url: &str) -> Result<FetchResponse>;
}

/// reqwest-backed [`Fetcher`] with a per-request timeout.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    follow: reqwest::Client,
    no_follow: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let follow = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(random_user_agent())
            .redirect(Policy::limited(10))
            .build()?;
        let no_follow = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(random_user_agent())
            .redirect(Policy::none())
            .build()?;
        Ok(Self { follow, no_follow })
    }

    async fn send(client: &reqwest::Client, url: &str) -> Result<FetchResponse> {
        let t0 = Instant::now();
        let resp = client.get(url).header("Accept", ACCEPT).send().await?;
        let status = resp.status().as_u16();
        let final_url = resp.url().to_string();
        let headers = resp
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_ascii_lowercase(),
                    v.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect();
        let body = resp.bytes().await?.to_vec();
        debug!(
            url,
            status,
            bytes = body.len(),
            elapsed_ms = t0.elapsed().as_millis() as u64,
            "Fetched"
        );
        Ok(FetchResponse {
            url: final_url,
            status,
            headers,
            body,
        })
    }
}

impl Fetcher for HttpFetcher {
    async fn get(&self, url: &str) -> Result<FetchResponse> {
        Self::send(&self.follow, url).await
    }

    async fn get_no_redirect(&self, url: &str) -> Result<FetchResponse> {
        Self::send(&self.no_follow, url).await
    }
}

fn is_gzip(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] == 0x1f && data[1] == 0x8b
}

/// Decompress `.gz` payloads. Servers that already decoded the body for a
/// `.gz` URL get their bytes passed through untouched.
pub fn maybe_decompress(url: &str, data: Vec<u8>) -> Result<Vec<u8>> {
    let path_gz = url.split(['?', '#']).next().unwrap_or(url).ends_with(".gz");
    if !is_gzip(&data) {
        return Ok(data);
    }
    let mut out = Vec::new();
    match GzDecoder::new(&data[..]).read_to_end(&mut out) {
        Ok(_) => Ok(out),
        Err(e) if path_gz => Err(CrawlError::Io(e)),
        Err(_) => Ok(data),
    }
}

/// Fetch a sitemap body, following redirects and transparently gunzipping.
#[instrument(level = "debug", skip(http))]
pub async fn fetch_sitemap_bytes<F: Fetcher>(http: &F, url: &str) -> Result<Vec<u8>> {
    let resp = http.get(url).await?;
    if resp.status >= 400 {
        return Err(CrawlError::Status {
            url: url.to_string(),
            status: resp.status,
        });
    }
    maybe_decompress(url, resp.body)
}

/// Status, headers and a short body snippet of a single GET.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeReport {
    pub url: String,
    pub status: u16,
    pub server: String,
    pub has_cf_ray: bool,
    pub body_snippet: String,
}

impl ProbeReport {
    pub fn from_response(url: &str, resp: &FetchResponse) -> Self {
        let snippet_len = resp.body.len().min(1024);
        let snippet = String::from_utf8_lossy(&resp.body[..snippet_len])
            .replace('\n', " ")
            .chars()
            .take(512)
            .collect();
        Self {
            url: url.to_string(),
            status: resp.status,
            server: resp.header("server").unwrap_or_default().to_lowercase(),
            has_cf_ray: resp.header("cf-ray").is_some(),
            body_snippet: snippet,
        }
    }
}

/// Probe `url` without following redirects. Network failures yield `None`.
pub async fn probe<F: Fetcher>(http: &F, url: &str) -> Option<ProbeReport> {
    match http.get_no_redirect(url).await {
        Ok(resp) => Some(ProbeReport::from_response(url, &resp)),
        Err(e) => {
            warn!(url, error = %e, "Probe failed");
            None
        }
    }
}

/// Why a probed URL looks unreachable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockClass {
    /// WAF / CDN challenge page.
    Waf,
    Redirect(u16),
    Status(u16),
}

impl BlockClass {
    pub fn subtype(&self) -> String {
        match self {
            BlockClass::Waf => "cloudflare".to_string(),
            BlockClass::Redirect(s) | BlockClass::Status(s) => s.to_string(),
        }
    }

    /// Redirects, 401, 403, 429 and WAF pages justify a browser retry.
    pub fn warrants_browser(&self) -> bool {
        match self {
            BlockClass::Waf | BlockClass::Redirect(_) => true,
            BlockClass::Status(s) => matches!(s, 401 | 403 | 429),
        }
    }

    /// The error a target reports when it stayed blocked. Statuses that do
    /// not warrant a browser stay plain HTTP errors.
    pub fn into_error(self, url: &str) -> CrawlError {
        match self {
            BlockClass::Status(status) if !matches!(status, 401 | 403 | 429) => CrawlError::Status {
                url: url.to_string(),
                status,
            },
            class => CrawlError::AccessBlocked {
                url: url.to_string(),
                subtype: class.subtype(),
            },
        }
    }
}

pub fn has_waf_signature(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("cloudflare") || lower.contains("attention required")
}

/// Classify a probe; `None` means nothing looks wrong.
pub fn classify(probe: &ProbeReport) -> Option<BlockClass> {
    let body = probe.body_snippet.to_lowercase();
    if probe.server.contains("cloudflare") || probe.has_cf_ray || body.contains("attention required") {
        return Some(BlockClass::Waf);
    }
    match probe.status {
        300..=399 => Some(BlockClass::Redirect(probe.status)),
        400..=599 => Some(BlockClass::Status(probe.status)),
        _ => None,
    }
}

#[cfg(test)]
pub mod testing {
    //! In-memory [`Fetcher`] used across the crate's tests.

    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    pub struct FakeFetcher {
        routes: HashMap<String, FetchResponse>,
        pub hits: Mutex<Vec<String>>,
    }

    impl FakeFetcher {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn route(mut self, url: &str, status: u16, body: &str) -> Self {
            self.routes.insert(
                url.to_string(),
                FetchResponse {
                    url: url.to_string(),
                    status,
                    headers: vec![],
                    body: body.as_bytes().to_vec(),
                },
            );
            self
        }

        pub fn route_with_headers(mut self, url: &str, status: u16, headers: &[(&str, &str)], body: &str) -> Self {
            self.routes.insert(
                url.to_string(),
                FetchResponse {
                    url: url.to_string(),
                    status,
                    headers: headers
                        .iter()
                        .map(|(k, v)| (k.to_ascii_lowercase(), v.to_string()))
                        .collect(),
                    body: body.as_bytes().to_vec(),
                },
            );
            self
        }

        pub fn hit_count(&self, url: &str) -> usize {
            crate::context::lock(&self.hits).iter().filter(|u| *u == url).count()
        }

        fn lookup(&self, url: &str) -> Result<FetchResponse> {
            crate::context::lock(&self.hits).push(url.to_string());
            match self.routes.get(url) {
                Some(r) => Ok(r.clone()),
                None => Ok(FetchResponse {
                    url: url.to_string(),
                    status: 404,
                    headers: vec![],
                    body: b"not found".to_vec(),
                }),
            }
        }
    }

    impl Fetcher for FakeFetcher {
        async fn get(&self, url: &str) -> Result<FetchResponse> {
            self.lookup(url)
        }

        async fn get_no_redirect(&self, url: &str) -> Result<FetchResponse> {
            self.lookup(url)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeFetcher;
    use super::*;
    use crate::error::ErrorKind;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;

    fn report(status: u16, server: &str, cf_ray: bool, body: &str) -> ProbeReport {
        ProbeReport {
            url: "https://a.test".into(),
            status,
            server: server.into(),
            has_cf_ray: cf_ray,
            body_snippet: body.into(),
        }
    }

    #[test]
    fn classification_table() {
        assert_eq!(classify(&report(403, "cloudflare", false, "")), Some(BlockClass::Waf));
        assert_eq!(classify(&report(200, "nginx", true, "")), Some(BlockClass::Waf));
        assert_eq!(
            classify(&report(403, "", false, "<title>Attention Required!</title>")),
            Some(BlockClass::Waf)
        );
        assert_eq!(classify(&report(429, "", false, "")), Some(BlockClass::Status(429)));
        assert_eq!(classify(&report(301, "", false, "")), Some(BlockClass::Redirect(301)));
        assert_eq!(classify(&report(200, "nginx", false, "ok")), None);

        assert!(BlockClass::Status(403).warrants_browser());
        assert!(!BlockClass::Status(503).warrants_browser());
    }

    #[test]
    fn blocked_classes_become_access_blocked() {
        let url = "https://a.test/s.xml";
        let waf = BlockClass::Waf.into_error(url);
        assert_eq!(waf.kind(), ErrorKind::AccessBlocked);
        assert!(waf.retryable());
        assert!(BlockClass::Status(429).into_error(url).retryable());
        assert!(BlockClass::Redirect(302).into_error(url).retryable());

        let forbidden = BlockClass::Status(403).into_error(url);
        assert_eq!(forbidden.kind(), ErrorKind::AccessBlocked);
        assert!(!forbidden.retryable());

        let gone = BlockClass::Status(410).into_error(url);
        assert_eq!(gone.kind(), ErrorKind::HttpError);
    }

    #[test]
    fn gzip_payloads_are_decoded() {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(b"<urlset/>").unwrap();
        let gz = enc.finish().unwrap();
        assert_eq!(maybe_decompress("https://a.test/s.xml.gz", gz.clone()).unwrap(), b"<urlset/>");
        // magic bytes win even without the extension
        assert_eq!(maybe_decompress("https://a.test/s.xml", gz).unwrap(), b"<urlset/>");
        // already-decoded bodies pass through
        assert_eq!(
            maybe_decompress("https://a.test/s.xml.gz", b"<urlset/>".to_vec()).unwrap(),
            b"<urlset/>"
        );
    }

    #[tokio::test]
    async fn sitemap_fetch_maps_errors() {
        let http = FakeFetcher::new()
            .route("https://a.test/ok.xml", 200, "<urlset/>")
            .route("https://a.test/gone.xml", 410, "");
        assert_eq!(fetch_sitemap_bytes(&http, "https://a.test/ok.xml").await.unwrap(), b"<urlset/>");
        let err = fetch_sitemap_bytes(&http, "https://a.test/gone.xml").await.unwrap_err();
        assert!(matches!(err, CrawlError::Status { status: 410, .. }));
    }

    #[tokio::test]
    async fn probe_reads_headers() {
        let http = FakeFetcher::new().route_with_headers(
            "https://a.test/x",
            403,
            &[("Server", "cloudflare"), ("CF-RAY", "abc")],
            "Just a moment...",
        );
        let p = probe(&http, "https://a.test/x").await.unwrap();
        assert_eq!(p.status, 403);
        assert_eq!(p.server, "cloudflare");
        assert!(p.has_cf_ray);
        assert_eq!(classify(&p), Some(BlockClass::Waf));
    }

    #[test]
    fn user_agent_is_from_pool() {
        assert!(USER_AGENTS.contains(&random_user_agent()));
    }
}
