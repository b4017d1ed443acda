//! Word, year and date predicates applied to candidate sitemap URLs.
//!
//! The three filters are independent: each yields a [`FilterVerdict`] and a
//! URL is dropped as soon as one of them rejects it. Every check takes the
//! evaluation instant explicitly so verdicts are reproducible.

use crate::models::{FilterKind, FilterVerdict};
use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

static NON_EDITORIAL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(?:^|[/_-])(video|videos|image|images|audio|photo|photos|gallery|galleries|multimedia|media|sport|sports|score|scores|match|matches|fixture|fixtures|team|teams|league|leagues|food|cooking|menu|restaurant|weather|forecast|climate|temperature|puzzle|puzzles|game|games|quiz|quizzes|crossword|sudoku|horoscope|lottery|recipe|recipes|taxonomy|label|labels|keyword|keywords|page|pages|static|template|templates|product|products|shop|store|stores|cart|ecommerce|shopping|event|events|calendar|webinar|webinars|schedule|archive|archives|old|backup|legacy|location|locations|place|places|city|cities|country|countries|region|regions|forum|forums|discussion|comment|comments|feedback|testimonial|testimonials|review|reviews|portfolio|project|projects|partner|partners|client|clients|sponsor|sponsors|career|careers|job|jobs|vacancy|vacancies)(?:[/_.-]|$)",
    )
    .expect("static regex")
});

static YEAR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(19[5-9]\d|20[0-3]\d)").expect("static regex"));

static Q_YEAR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[?&]year=(\d{4})").expect("static regex"));
static Q_DATE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[?&]date=(\d{4})-(\d{2})-(\d{2})").expect("static regex"));
static COMPACT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[-_/](\d{4})(\d{2})(\d{2})(?:[-_.]|$)").expect("static regex"));
static DASHED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[-_](\d{4})-(\d{2})-(\d{2})").expect("static regex"));
static PATH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/(\d{4})/(\d{1,2})/(\d{1,2})(?:/|$)").expect("static regex"));
static Q_YMD_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[?&]yyyy=(\d{4}).*?mm=(\d{1,2}).*?dd=(\d{1,2})").expect("static regex")
});
static MONTH_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[-_/](\d{4})-(\d{2})").expect("static regex"));

/// Future dates up to this far ahead are treated as clock skew.
const FUTURE_TOLERANCE_HOURS: f64 = 24.0;

/// Reject URLs whose path carries a non-editorial segment.
pub fn word_filter(url: &str) -> FilterVerdict {
    match NON_EDITORIAL_RE.captures(url) {
        Some(caps) => {
            let token = caps.get(1).map(|m| m.as_str().to_lowercase()).unwrap_or_default();
            FilterVerdict::reject(url, FilterKind::Word, format!("non-editorial segment '{token}'"))
        }
        None => FilterVerdict::accept(url, FilterKind::Word, "no non-editorial segment"),
    }
}

/// Reject URLs mentioning any year in 1950..=2039 other than `current_year`.
pub fn year_filter(url: &str, current_year: i32) -> FilterVerdict {
    let mut old: Vec<i32> = YEAR_RE
        .find_iter(url)
        .filter_map(|m| m.as_str().parse::<i32>().ok())
        .filter(|y| *y != current_year)
        .collect();
    old.sort_unstable();
    old.dedup();
    if old.is_empty() {
        return FilterVerdict::accept(url, FilterKind::Year, "no old year tokens");
    }
    let listed = old.iter().map(i32::to_string).collect::<Vec<_>>().join(", ");
    FilterVerdict::reject(url, FilterKind::Year, format!("old years: {listed}"))
}

fn ymd(y: &str, m: &str, d: &str) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(y.parse().ok()?, m.parse().ok()?, d.parse().ok()?)
}

fn from_captures(re: &Regex, url: &str) -> Option<NaiveDate> {
    let c = re.captures(url)?;
    ymd(c.get(1)?.as_str(), c.get(2)?.as_str(), c.get(3)?.as_str())
}

fn last_day_of_month(year: i32, month: u32) -> Option<NaiveDate> {
    let (ny, nm) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(ny, nm, 1)?.pred_opt()
}

/// `YYYY-MM` not followed by `-DD`, followed by `-`, `_`, `.` or the end.
///
/// Same year and month as `now` infers today's day; any other month infers
/// its last day. This leans ambiguous current-month URLs towards "recent".
fn month_only(url: &str, now: DateTime<Utc>) -> Option<NaiveDate> {
    for c in MONTH_RE.captures_iter(url) {
        let (Some(whole), Some(y), Some(m)) = (c.get(0), c.get(1), c.get(2)) else {
            continue;
        };
        let rest = &url[whole.end()..];
        let rb = rest.as_bytes();
        if rb.len() >= 3 && rb[0] == b'-' && rb[1].is_ascii_digit() && rb[2].is_ascii_digit() {
            continue;
        }
        let boundary = rest.is_empty() || matches!(rb[0], b'-' | b'_' | b'.');
        if !boundary {
            continue;
        }
        let (Ok(year), Ok(month)) = (y.as_str().parse::<i32>(), m.as_str().parse::<u32>()) else {
            continue;
        };
        if !(1..=12).contains(&month) {
            continue;
        }
        if year == now.year() && month == now.month() {
            return NaiveDate::from_ymd_opt(year, month, now.day());
        }
        return last_day_of_month(year, month);
    }
    None
}

/// Extract a date from the URL, trying patterns in priority order.
///
/// A pattern that matches an impossible calendar date falls through to the
/// next pattern.
pub fn extract_url_date(url: &str, now: DateTime<Utc>) -> Option<NaiveDate> {
    if let Some(c) = Q_YEAR_RE.captures(url) {
        if let Some(d) = c.get(1).and_then(|y| ymd(y.as_str(), "1", "1")) {
            return Some(d);
        }
    }
    from_captures(&Q_DATE_RE, url)
        .or_else(|| from_captures(&COMPACT_RE, url))
        .or_else(|| from_captures(&DASHED_RE, url))
        .or_else(|| from_captures(&PATH_RE, url))
        .or_else(|| from_captures(&Q_YMD_RE, url))
        .or_else(|| month_only(url, now))
}

fn age_verdict(
    url: &str,
    label: &str,
    dt: DateTime<Utc>,
    hours_threshold: i64,
    now: DateTime<Utc>,
) -> FilterVerdict {
    let age_h = (now - dt).num_seconds() as f64 / 3600.0;
    if age_h < 0.0 {
        let ahead = -age_h;
        if ahead <= FUTURE_TOLERANCE_HOURS {
            return FilterVerdict::accept(
                url,
                FilterKind::Date,
                format!("Near-future {label} ({ahead:.1}h ahead, clock skew)"),
            );
        }
        return FilterVerdict::reject(url, FilterKind::Date, format!("Future {label} ({ahead:.1}h ahead)"));
    }
    if age_h <= hours_threshold as f64 {
        FilterVerdict::accept(url, FilterKind::Date, format!("Recent {label} ({age_h:.1}h old)"))
    } else {
        FilterVerdict::reject(
            url,
            FilterKind::Date,
            format!("Old {label} ({age_h:.1}h > {hours_threshold}h)"),
        )
    }
}

/// Age check against the URL date, else `lastmod`, else conservative accept.
pub fn date_filter(
    url: &str,
    lastmod: Option<DateTime<Utc>>,
    hours_threshold: i64,
    now: DateTime<Utc>,
) -> FilterVerdict {
    if let Some(d) = extract_url_date(url, now) {
        if let Some(ndt) = d.and_hms_opt(0, 0, 0) {
            return age_verdict(url, "URL date", ndt.and_utc(), hours_threshold, now);
        }
    }
    if let Some(lm) = lastmod {
        return age_verdict(url, "lastmod", lm, hours_threshold, now);
    }
    FilterVerdict::accept(url, FilterKind::Date, "No date found (conservative keep)")
}

/// Counts of survivors after each stage plus the rejection audit trail.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StagedOutcome {
    pub accepted: Vec<String>,
    pub after_word: usize,
    pub after_year: usize,
    pub after_date: usize,
    pub rejected: Vec<FilterVerdict>,
}

/// The three filters bound to one recency window and one instant.
#[derive(Debug, Clone, Copy)]
pub struct FilterChain {
    pub hours_threshold: i64,
    pub now: DateTime<Utc>,
}

impl FilterChain {
    pub fn new(hours_threshold: i64, now: DateTime<Utc>) -> Self {
        Self { hours_threshold, now }
    }

    pub fn word(&self, url: &str) -> FilterVerdict {
        word_filter(url)
    }

    pub fn year(&self, url: &str) -> FilterVerdict {
        year_filter(url, self.now.year())
    }

    pub fn date(&self, url: &str, lastmod: Option<DateTime<Utc>>) -> FilterVerdict {
        date_filter(url, lastmod, self.hours_threshold, self.now)
    }

    /// First rejecting verdict in word → year → date order, if any.
    pub fn first_rejection(&self, url: &str, lastmod: Option<DateTime<Utc>>) -> Option<FilterVerdict> {
        [self.word(url), self.year(url), self.date(url, lastmod)]
            .into_iter()
            .find(|v| !v.accepted)
    }

    /// Run every URL through the stages, keeping per-stage survivor counts.
    pub fn run_staged<F>(&self, urls: &[String], lastmod_of: F) -> StagedOutcome
    where
        F: Fn(&str) -> Option<DateTime<Utc>>,
    {
        let mut out = StagedOutcome::default();
        let mut after_word = Vec::new();
        for u in urls {
            let v = self.word(u);
            if v.accepted {
                after_word.push(u.clone());
            } else {
                out.rejected.push(v);
            }
        }
        out.after_word = after_word.len();

        let mut after_year = Vec::new();
        for u in after_word {
            let v = self.year(&u);
            if v.accepted {
                after_year.push(u);
            } else {
                out.rejected.push(v);
            }
        }
        out.after_year = after_year.len();

        for u in after_year {
            let v = self.date(&u, lastmod_of(&u));
            if v.accepted {
                out.accepted.push(u);
            } else {
                out.rejected.push(v);
            }
        }
        out.after_date = out.accepted.len();
        out
    }
}

/// Hours between `dt` and `now` (negative for future dates).
pub fn age_hours(dt: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    (now - dt).num_seconds() as f64 / 3600.0
}

/// Whether `dt` lies inside the recency window, tolerating small clock skew.
pub fn within_window(dt: DateTime<Utc>, hours_threshold: i64, now: DateTime<Utc>) -> bool {
    let age = age_hours(dt, now);
    if age < 0.0 {
        return -age <= FUTURE_TOLERANCE_HOURS;
    }
    now - dt <= Duration::hours(hours_threshold)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 5, 15, 12, 0, 0).unwrap()
    }

    #[test]
    fn word_filter_matches_segment_boundaries() {
        assert!(!word_filter("https://a.test/video-sitemap.xml").accepted);
        assert!(!word_filter("https://a.test/sitemaps/sports/1.xml").accepted);
        assert!(!word_filter("https://a.test/SITEMAP_Weather.xml").accepted);
        assert!(word_filter("https://a.test/news-sitemap.xml").accepted);
        // substring inside a word is not a segment
        assert!(word_filter("https://a.test/videogamer-news.xml").accepted);
        let v = word_filter("https://a.test/sitemap-recipes.xml");
        assert_eq!(v.reason, "non-editorial segment 'recipes'");
        assert_eq!(v.filter, FilterKind::Word);
    }

    #[test]
    fn year_filter_rejects_iff_foreign_year_present() {
        let cases = [
            ("https://a.test/sitemap-2025-05.xml", true),
            ("https://a.test/2019/sitemap.xml", false),
            ("https://a.test/sitemap.xml", true),
            ("https://a.test/s-1949.xml", true),
            ("https://a.test/s-2040.xml", true),
            ("https://a.test/s-1950.xml", false),
            ("https://a.test/2025/2024/x.xml", false),
        ];
        for (url, ok) in cases {
            assert_eq!(year_filter(url, 2025).accepted, ok, "{url}");
        }
        let v = year_filter("https://a.test/2020/2019/2020.xml", 2025);
        assert_eq!(v.reason, "old years: 2019, 2020");
    }

    #[test]
    fn url_date_priority_order() {
        let n = now();
        assert_eq!(
            extract_url_date("https://a.test/s.xml?year=2025", n),
            NaiveDate::from_ymd_opt(2025, 1, 1)
        );
        assert_eq!(
            extract_url_date("https://a.test/s.xml?date=2025-05-14", n),
            NaiveDate::from_ymd_opt(2025, 5, 14)
        );
        assert_eq!(
            extract_url_date("https://a.test/sitemap-20250514.xml", n),
            NaiveDate::from_ymd_opt(2025, 5, 14)
        );
        assert_eq!(
            extract_url_date("https://a.test/sitemap_2025-05-13.xml", n),
            NaiveDate::from_ymd_opt(2025, 5, 13)
        );
        assert_eq!(
            extract_url_date("https://a.test/2025/5/2/sitemap.xml", n),
            NaiveDate::from_ymd_opt(2025, 5, 2)
        );
        assert_eq!(
            extract_url_date("https://a.test/s.xml?yyyy=2025&mm=4&dd=30", n),
            NaiveDate::from_ymd_opt(2025, 4, 30)
        );
        assert_eq!(extract_url_date("https://a.test/sitemap.xml", n), None);
    }

    #[test]
    fn invalid_dates_fall_through() {
        let n = now();
        // 20251399 is not a date; the path pattern still applies
        assert_eq!(
            extract_url_date("https://a.test/2025/05/10/x-20251399.xml", n),
            NaiveDate::from_ymd_opt(2025, 5, 10)
        );
    }

    #[test]
    fn month_only_inference_keeps_current_month_bias() {
        let n = now();
        assert_eq!(
            extract_url_date("https://a.test/sitemap-2025-05.xml", n),
            NaiveDate::from_ymd_opt(2025, 5, 15)
        );
        assert_eq!(
            extract_url_date("https://a.test/sitemap-2025-02.xml", n),
            NaiveDate::from_ymd_opt(2025, 2, 28)
        );
        assert_eq!(
            extract_url_date("https://a.test/sitemap-2024-12", n),
            NaiveDate::from_ymd_opt(2024, 12, 31)
        );
        // a current-month URL is always "recent" under a 24h window
        assert!(date_filter("https://a.test/sitemap-2025-05.xml", None, 24, n).accepted);
        assert!(!date_filter("https://a.test/sitemap-2025-04.xml", None, 24, n).accepted);
    }

    #[test]
    fn date_filter_age_logic() {
        let n = now();
        let v = date_filter("https://a.test/2025/05/15/x.xml", None, 24, n);
        assert!(v.accepted);
        assert_eq!(v.reason, "Recent URL date (12.0h old)");

        let v = date_filter("https://a.test/2025/05/13/x.xml", None, 24, n);
        assert!(!v.accepted);
        assert_eq!(v.reason, "Old URL date (60.0h > 24h)");

        // tomorrow is within skew, three days ahead is not
        assert!(date_filter("https://a.test/2025/05/16/x.xml", None, 24, n).accepted);
        assert!(!date_filter("https://a.test/2025/05/18/x.xml", None, 24, n).accepted);
    }

    #[test]
    fn date_filter_lastmod_and_conservative_keep() {
        let n = now();
        let fresh = Some(n - Duration::hours(2));
        let stale = Some(n - Duration::hours(72));
        assert!(date_filter("https://a.test/news.xml", fresh, 24, n).accepted);
        let v = date_filter("https://a.test/news.xml", stale, 24, n);
        assert!(!v.accepted);
        assert!(v.reason.starts_with("Old lastmod"));
        let v = date_filter("https://a.test/news.xml", None, 24, n);
        assert!(v.accepted);
        assert_eq!(v.reason, "No date found (conservative keep)");
        // URL date wins over lastmod
        assert!(!date_filter("https://a.test/2025/01/01/n.xml", fresh, 24, n).accepted);
    }

    #[test]
    fn date_filter_is_idempotent() {
        let n = now();
        for url in [
            "https://a.test/sitemap-2025-05.xml",
            "https://a.test/2025/05/14/x.xml",
            "https://a.test/s.xml",
        ] {
            assert_eq!(date_filter(url, None, 24, n), date_filter(url, None, 24, n));
        }
    }

    #[test]
    fn staged_counts_and_rejections() {
        let chain = FilterChain::new(24, now());
        let urls: Vec<String> = [
            "https://a.test/news-sitemap.xml",
            "https://a.test/video-sitemap.xml",
            "https://a.test/2019/sitemap.xml",
            "https://a.test/sitemap-2025-03.xml",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let out = chain.run_staged(&urls, |_| None);
        assert_eq!(out.after_word, 3);
        assert_eq!(out.after_year, 2);
        assert_eq!(out.after_date, 1);
        assert_eq!(out.accepted, vec!["https://a.test/news-sitemap.xml".to_string()]);
        let filters: Vec<FilterKind> = out.rejected.iter().map(|v| v.filter).collect();
        assert_eq!(filters, vec![FilterKind::Word, FilterKind::Year, FilterKind::Date]);
        assert!(chain.first_rejection("https://a.test/2019/video.xml", None).is_some_and(|v| v.filter == FilterKind::Word));
    }

    #[test]
    fn window_check() {
        let n = now();
        assert!(within_window(n - Duration::hours(23), 24, n));
        assert!(!within_window(n - Duration::hours(25), 24, n));
        assert!(within_window(n + Duration::hours(3), 24, n));
        assert!(!within_window(n + Duration::hours(30), 24, n));
    }
}
