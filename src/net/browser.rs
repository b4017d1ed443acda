//! Headless-browser rendering through a Browserless-compatible service.
//!
//! [`PageRenderer`] is the seam; [`BrowserlessRenderer`] posts a small
//! puppeteer function to the service's `/function` endpoint. Rendering runs
//! a readiness loop (scroll, wait, measure) until the page stops growing,
//! then snapshots the DOM.

use crate::error::{CrawlError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use std::time::{Duration, Instant};
use tracing::{info, instrument, warn};

/// Readiness loop parameters.
pub const MAX_SCROLL_CYCLES: u32 = 8;
pub const SCROLL_SLEEP_MS: u64 = 250;

static SCRIPT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<script[\s\S]*?</script>").expect("static regex"));
static HANDLER_DQ_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#" on[a-zA-Z]+="[^"]*""#).expect("static regex"));
static HANDLER_SQ_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r" on[a-zA-Z]+='[^']*'").expect("static regex"));

/// Strip `<script>` blocks and inline `on*=` handlers.
pub fn sanitize_html(html: &str) -> String {
    let s = SCRIPT_RE.replace_all(html, "");
    let s = HANDLER_DQ_RE.replace_all(&s, "");
    HANDLER_SQ_RE.replace_all(&s, "").into_owned()
}

/// A rendered, sanitised page snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderedPage {
    pub url: String,
    pub html: String,
    pub text_length: usize,
    pub link_count: usize,
}

pub trait PageRenderer {
    /// Rendered `document.body.innerText`, used to read robots.txt and XML
    /// bodies that only a real browser gets past.
    async fn inner_text(&self, url: &str) -> Result<String>;

    /// Render after the readiness loop and return sanitised HTML.
    async fn render(&self, url: &str) -> Result<RenderedPage>;
}

const TEXT_FN: &str = r#"export default async function ({ page, context }) {
  await page.goto(context.url, { waitUntil: "domcontentloaded", timeout: context.timeoutMs });
  const text = await page.evaluate(() => (document.body && document.body.innerText) ? document.body.innerText : (document.documentElement ? document.documentElement.innerText : ""));
  return { data: { text: text || "" }, type: "application/json" };
}"#;

const RENDER_FN: &str = r#"export default async function ({ page, context }) {
  await page.setViewport({ width: context.width, height: context.height });
  await page.goto(context.url, { waitUntil: "domcontentloaded", timeout: context.timeoutMs });
  let lastText = 0;
  let lastLinks = 0;
  for (let i = 0; i < context.maxCycles; i++) {
    await page.evaluate(() => window.scrollBy(0, Math.floor(window.innerHeight * 0.8)));
    await new Promise((r) => setTimeout(r, context.sleepMs));
    const m = await page.evaluate(() => ({
      t: (document.body && document.body.innerText) ? document.body.innerText.length : 0,
      l: document.querySelectorAll("a").length,
    }));
    if (m.t <= lastText && m.l <= lastLinks) break;
    lastText = m.t;
    lastLinks = m.l;
  }
  const html = await page.evaluate(() => document.documentElement.outerHTML);
  return { data: { html: html || "", textLength: lastText, linkMatches: lastLinks }, type: "application/json" };
}"#;

#[derive(Debug, Deserialize)]
struct TextPayload {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RenderPayload {
    #[serde(default)]
    html: String,
    #[serde(default)]
    text_length: usize,
    #[serde(default)]
    link_matches: usize,
}

/// Browserless `/function` client. Without a base URL every call fails with
/// `browser_fetch_error`, which callers treat like any other failed retry.
#[derive(Debug, Clone)]
pub struct BrowserlessRenderer {
    client: reqwest::Client,
    base_url: Option<String>,
    token: Option<String>,
    proxy_server: Option<String>,
    timeout: Duration,
}

impl BrowserlessRenderer {
    pub fn new(
        base_url: Option<&str>,
        token: Option<&str>,
        proxy_server: Option<&str>,
        timeout: Duration,
    ) -> Result<Self> {
        // The service needs headroom beyond the page timeout for the readiness loop.
        let client = reqwest::Client::builder()
            .timeout(timeout + Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url
                .map(|u| u.trim_end_matches('/').to_string())
                .filter(|u| !u.is_empty()),
            token: token.map(String::from).filter(|t| !t.is_empty()),
            proxy_server: proxy_server.map(String::from).filter(|p| !p.trim().is_empty()),
            timeout,
        })
    }

    pub fn is_configured(&self) -> bool {
        self.base_url.is_some()
    }

    fn endpoint(&self) -> Result<String> {
        let Some(base) = &self.base_url else {
            return Err(CrawlError::Browser("browser rendering is not configured".into()));
        };
        let mut params = Vec::new();
        if let Some(token) = &self.token {
            params.push(format!("token={}", urlencoding::encode(token)));
        }
        if let Some(proxy) = &self.proxy_server {
            let launch = json!({ "args": [format!("--proxy-server={proxy}")] }).to_string();
            params.push(format!("launch={}", urlencoding::encode(&launch)));
        }
        let mut endpoint = format!("{base}/function");
        if !params.is_empty() {
            endpoint.push('?');
            endpoint.push_str(&params.join("&"));
        }
        Ok(endpoint)
    }

    async fn call<T: for<'de> Deserialize<'de>>(&self, code: &str, context: serde_json::Value) -> Result<T> {
        let endpoint = self.endpoint()?;
        let body = json!({ "code": code, "context": context });
        let resp = self
            .client
            .post(&endpoint)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| CrawlError::Browser(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(CrawlError::Browser(format!(
                "service returned {}: {}",
                status.as_u16(),
                crate::utils::truncate_for_log(&message, 200)
            )));
        }
        resp.json::<T>()
            .await
            .map_err(|e| CrawlError::Browser(e.to_string()))
    }

    fn timeout_ms(&self) -> u64 {
        self.timeout.as_millis().max(5_000) as u64
    }
}

impl PageRenderer for BrowserlessRenderer {
    #[instrument(level = "info", skip(self))]
    async fn inner_text(&self, url: &str) -> Result<String> {
        let t0 = Instant::now();
        let payload: TextPayload = self
            .call(TEXT_FN, json!({ "url": url, "timeoutMs": self.timeout_ms() }))
            .await?;
        info!(
            chars = payload.text.len(),
            elapsed_ms = t0.elapsed().as_millis() as u64,
            "Browser text fetched"
        );
        Ok(payload.text)
    }

    #[instrument(level = "info", skip(self))]
    async fn render(&self, url: &str) -> Result<RenderedPage> {
        let t0 = Instant::now();
        let (width, height) = {
            use rand::Rng;
            let mut rng = rand::rng();
            (rng.random_range(1200..=1440), rng.random_range(800..=1000))
        };
        let payload: RenderPayload = self
            .call(
                RENDER_FN,
                json!({
                    "url": url,
                    "timeoutMs": self.timeout_ms(),
                    "maxCycles": MAX_SCROLL_CYCLES,
                    "sleepMs": SCROLL_SLEEP_MS,
                    "width": width,
                    "height": height,
                }),
            )
            .await?;
        let html = sanitize_html(&payload.html);
        if html.trim().is_empty() {
            warn!("Rendered page is empty");
            return Err(CrawlError::EmptyHtml(url.to_string()));
        }
        info!(
            html_len = html.len(),
            text_length = payload.text_length,
            links = payload.link_matches,
            elapsed_ms = t0.elapsed().as_millis() as u64,
            "Page rendered"
        );
        Ok(RenderedPage {
            url: url.to_string(),
            html,
            text_length: payload.text_length,
            link_count: payload.link_matches,
        })
    }
}
