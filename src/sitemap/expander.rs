//! Recursive sitemap expansion with per-level filtering.
//!
//! Index documents are walked child by child through the filter chain;
//! urlset documents are sampled (first and last five items) to decide
//! whether they carry fresh, titled entries. Accepted leaves go through the
//! chain once more using the latest sampled item date as their lastmod.

use crate::context::RunContext;
use crate::models::{ExpansionStats, FilterKind, FilterVerdict, FinalStats, SitemapKind, SitemapNode};
use crate::net::Fetcher;
use crate::net::http::fetch_sitemap_bytes;
use crate::sitemap::filters::{FilterChain, within_window};
use crate::sitemap::xml::{DocKind, doc_kind, head_and_tail, index_children, parse_document, parse_w3c_datetime};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use tracing::{debug, info, instrument, warn};

/// Index children that may expand to nothing in a row before the rest of
/// that index is skipped.
pub const MAX_CONSECUTIVE_EMPTY: usize = 10;
/// Items sampled from each end of a urlset.
pub const LEAF_SAMPLE_EACH_END: usize = 5;

/// Latest sampled item date per accepted leaf.
pub type LeafDateCache = HashMap<String, Option<DateTime<Utc>>>;

/// Why a urlset was not accepted as a leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafRejection {
    NoRecentItems,
    NoTitleField,
}

impl LeafRejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeafRejection::NoRecentItems => "no_recent_items",
            LeafRejection::NoTitleField => "no_title_field",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Expansion {
    /// Leaves that survived the final filter pass, in discovery order.
    pub leaves: Vec<String>,
    /// Accepted urlsets before the final pass.
    pub nodes: Vec<SitemapNode>,
    pub stats: ExpansionStats,
    pub final_stats: FinalStats,
    pub rejected: Vec<FilterVerdict>,
    pub leaf_rejections: Vec<(String, LeafRejection)>,
    pub leaf_dates: LeafDateCache,
}

#[derive(Debug, Default)]
struct Walk {
    visited: HashSet<String>,
    accepted: Vec<SitemapNode>,
    cache: LeafDateCache,
    stats: ExpansionStats,
    rejected: Vec<FilterVerdict>,
    leaf_rejections: Vec<(String, LeafRejection)>,
}

pub struct Expander<'a, H> {
    http: &'a H,
    ctx: &'a RunContext,
    chain: FilterChain,
    max_depth: usize,
    require_title: bool,
}

impl<'a, H: Fetcher> Expander<'a, H> {
    pub fn new(http: &'a H, ctx: &'a RunContext, chain: FilterChain, max_depth: usize, require_title: bool) -> Self {
        Self {
            http,
            ctx,
            chain,
            max_depth,
            require_title,
        }
    }

    /// Expand every root and run the final filter pass over the leaves.
    #[instrument(level = "info", skip_all, fields(roots = roots.len(), max_depth = self.max_depth))]
    pub async fn expand(&self, roots: &[String]) -> Expansion {
        let mut walk = Walk::default();
        for root in roots {
            self.visit(root.clone(), 0, &mut walk).await;
        }

        let leaf_urls: Vec<String> = walk.accepted.iter().map(|n| n.url.clone()).collect();
        let staged = self
            .chain
            .run_staged(&leaf_urls, |u| walk.cache.get(u).copied().flatten());
        for v in &staged.rejected {
            self.ctx.record_rejection(v.filter);
        }

        let final_stats = FinalStats {
            total_leaves: leaf_urls.len(),
            after_word_filter: staged.after_word,
            after_year_filter: staged.after_year,
            after_date_filter: staged.after_date,
        };
        info!(
            children = walk.stats.children_found,
            leaves = final_stats.total_leaves,
            kept = final_stats.after_date_filter,
            "Expansion finished"
        );

        let mut rejected = walk.rejected;
        rejected.extend(staged.rejected);
        Expansion {
            leaves: staged.accepted,
            nodes: walk.accepted,
            stats: walk.stats,
            final_stats,
            rejected,
            leaf_rejections: walk.leaf_rejections,
            leaf_dates: walk.cache,
        }
    }

    /// Visit one sitemap; returns how many new leaves it contributed.
    fn visit<'s>(&'s self, url: String, depth: usize, walk: &'s mut Walk) -> Pin<Box<dyn Future<Output = usize> + 's>> {
        Box::pin(async move {
            if depth >= self.max_depth || !walk.visited.insert(url.clone()) {
                return 0;
            }
            let body = match fetch_sitemap_bytes(self.http, &url).await {
                Ok(b) if !b.is_empty() => b,
                Ok(_) => {
                    debug!(url, "Empty sitemap body");
                    return 0;
                }
                Err(e) => {
                    warn!(url, error = %e, "Sitemap fetch failed");
                    return 0;
                }
            };
            let root = match parse_document(&body) {
                Ok(r) => r,
                Err(e) => {
                    warn!(url, error = %e, "Sitemap is not valid XML");
                    return 0;
                }
            };

            match doc_kind(&root) {
                DocKind::Index => {
                    let children = index_children(&root);
                    walk.stats.children_found += children.len();
                    debug!(url, depth, children = children.len(), "Index");
                    let mut produced = 0;
                    let mut empty_run = 0;
                    for (loc, lastmod) in children {
                        if empty_run >= MAX_CONSECUTIVE_EMPTY {
                            info!(url, empty_run, "Skipping rest of index after consecutive empty children");
                            break;
                        }
                        let lastmod = lastmod.as_deref().and_then(parse_w3c_datetime);
                        if let Some(v) = self.chain.first_rejection(&loc, lastmod) {
                            match v.filter {
                                FilterKind::Word => walk.stats.children_rejected_word += 1,
                                FilterKind::Year => walk.stats.children_rejected_year += 1,
                                FilterKind::Date => walk.stats.children_rejected_date += 1,
                            }
                            self.ctx.record_rejection(v.filter);
                            debug!(child = %loc, reason = %v.reason, "Child rejected");
                            walk.rejected.push(v);
                            continue;
                        }
                        let got = self.visit(loc, depth + 1, walk).await;
                        if got == 0 {
                            empty_run += 1;
                        } else {
                            empty_run = 0;
                        }
                        produced += got;
                    }
                    produced
                }
                DocKind::Urlset => {
                    let items = root.find_all("url");
                    let sample = head_and_tail(&items, LEAF_SAMPLE_EACH_END);
                    let dates: Vec<DateTime<Utc>> = sample
                        .iter()
                        .filter_map(|u| u.lastmod_or_publication())
                        .filter_map(|d| parse_w3c_datetime(&d))
                        .collect();
                    let recent = dates
                        .iter()
                        .any(|d| within_window(*d, self.chain.hours_threshold, self.chain.now));
                    let titled = !self.require_title || sample.iter().any(|u| u.has_title_like());

                    let verdict = if !recent {
                        Err(LeafRejection::NoRecentItems)
                    } else if !titled {
                        Err(LeafRejection::NoTitleField)
                    } else {
                        Ok(())
                    };
                    match verdict {
                        Ok(()) => {
                            let node = SitemapNode {
                                url: url.clone(),
                                kind: SitemapKind::Leaf,
                                lastmod: None,
                                sampled_item_dates: dates,
                            };
                            walk.cache.insert(url.clone(), node.latest_date());
                            walk.stats.leaves_found += 1;
                            debug!(url, items = items.len(), "Leaf accepted");
                            walk.accepted.push(node);
                            1
                        }
                        Err(reason) => {
                            if reason == LeafRejection::NoTitleField {
                                walk.stats.children_rejected_title += 1;
                            }
                            debug!(url, reason = reason.as_str(), sampled = sample.len(), "Leaf rejected");
                            walk.leaf_rejections.push((url, reason));
                            0
                        }
                    }
                }
                DocKind::Other => {
                    debug!(url, root = root.local_name(), "Unrecognised sitemap root");
                    0
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::http::testing::FakeFetcher;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 5, 15, 12, 0, 0).unwrap()
    }

    fn urlset(dates: &[&str], titled: bool) -> String {
        let mut s = String::from(
            r#"<urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9" xmlns:news="http://www.google.com/schemas/sitemap-news/0.9">"#,
        );
        for (i, d) in dates.iter().enumerate() {
            s.push_str(&format!("<url><loc>https://a.test/story-{i}</loc>"));
            if titled {
                s.push_str(&format!(
                    "<news:news><news:publication_date>{d}</news:publication_date><news:title>Story {i}</news:title></news:news>"
                ));
            } else {
                s.push_str(&format!("<lastmod>{d}</lastmod>"));
            }
            s.push_str("</url>");
        }
        s.push_str("</urlset>");
        s
    }

    fn index(children: &[(&str, Option<&str>)]) -> String {
        let mut s = String::from(r#"<sitemapindex xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">"#);
        for (loc, lm) in children {
            s.push_str(&format!("<sitemap><loc>{loc}</loc>"));
            if let Some(lm) = lm {
                s.push_str(&format!("<lastmod>{lm}</lastmod>"));
            }
            s.push_str("</sitemap>");
        }
        s.push_str("</sitemapindex>");
        s
    }

    fn expander<'a>(http: &'a FakeFetcher, ctx: &'a RunContext) -> Expander<'a, FakeFetcher> {
        Expander::new(http, ctx, FilterChain::new(24, now()), 3, true)
    }

    #[tokio::test]
    async fn index_children_filtered_and_leaves_sampled() {
        let http = FakeFetcher::new()
            .route(
                "https://a.test/index.xml",
                200,
                &index(&[
                    ("https://a.test/news.xml", Some("2025-05-15T10:00:00Z")),
                    ("https://a.test/2019/news-sitemap.xml", None),
                    ("https://a.test/video-sitemap.xml", None),
                    ("https://a.test/politics.xml", Some("2025-05-01T00:00:00Z")),
                    ("https://a.test/untitled.xml", None),
                ]),
            )
            .route("https://a.test/news.xml", 200, &urlset(&["2025-05-15T08:00:00Z"], true))
            .route("https://a.test/untitled.xml", 200, &urlset(&["2025-05-15T08:00:00Z"], false));
        let ctx = RunContext::new();
        let out = expander(&http, &ctx).expand(&["https://a.test/index.xml".to_string()]).await;

        assert_eq!(out.leaves, vec!["https://a.test/news.xml"]);
        assert_eq!(out.stats.children_found, 5);
        assert_eq!(out.stats.children_rejected_word, 1);
        assert_eq!(out.stats.children_rejected_year, 1);
        assert_eq!(out.stats.children_rejected_date, 1);
        assert_eq!(out.stats.children_rejected_title, 1);
        assert_eq!(out.stats.leaves_found, 1);
        assert_eq!(out.final_stats.total_leaves, 1);
        assert_eq!(out.final_stats.after_date_filter, 1);

        let year = out
            .rejected
            .iter()
            .find(|v| v.url.contains("/2019/"))
            .expect("2019 child rejected");
        assert_eq!(year.filter, FilterKind::Year);
        assert_eq!(ctx.rejection_count(FilterKind::Year), 1);
        assert_eq!(ctx.rejection_count(FilterKind::Word), 1);
    }

    #[tokio::test]
    async fn old_year_child_is_rejected_by_year_filter() {
        let http = FakeFetcher::new().route(
            "https://a.test/index.xml",
            200,
            &index(&[("https://a.test/2019/sitemap.xml", None)]),
        );
        let ctx = RunContext::new();
        let out = expander(&http, &ctx).expand(&["https://a.test/index.xml".to_string()]).await;
        assert!(out.leaves.is_empty());
        assert_eq!(out.rejected.len(), 1);
        assert_eq!(out.rejected[0].filter, FilterKind::Year);
        assert_eq!(http.hit_count("https://a.test/2019/sitemap.xml"), 0);
    }

    #[tokio::test]
    async fn stale_leaf_rejected() {
        let http = FakeFetcher::new().route("https://a.test/s.xml", 200, &urlset(&["2025-04-01T00:00:00Z"], true));
        let ctx = RunContext::new();
        let out = expander(&http, &ctx).expand(&["https://a.test/s.xml".to_string()]).await;
        assert!(out.leaves.is_empty());
        assert_eq!(out.leaf_rejections, vec![("https://a.test/s.xml".to_string(), LeafRejection::NoRecentItems)]);
    }

    #[tokio::test]
    async fn depth_is_bounded() {
        let http = FakeFetcher::new()
            .route("https://a.test/i0.xml", 200, &index(&[("https://a.test/i1.xml", None)]))
            .route("https://a.test/i1.xml", 200, &index(&[("https://a.test/leaf.xml", None)]))
            .route("https://a.test/leaf.xml", 200, &urlset(&["2025-05-15T08:00:00Z"], true));
        let ctx = RunContext::new();
        let shallow = Expander::new(&http, &ctx, FilterChain::new(24, now()), 2, true)
            .expand(&["https://a.test/i0.xml".to_string()])
            .await;
        assert!(shallow.leaves.is_empty());
        assert_eq!(http.hit_count("https://a.test/leaf.xml"), 0);

        let deep = Expander::new(&http, &ctx, FilterChain::new(24, now()), 3, true)
            .expand(&["https://a.test/i0.xml".to_string()])
            .await;
        assert_eq!(deep.leaves, vec!["https://a.test/leaf.xml"]);
    }

    #[tokio::test]
    async fn consecutive_empty_children_stop_the_index() {
        let children: Vec<String> = (0..15).map(|i| format!("https://a.test/empty-{i}.xml")).collect();
        let pairs: Vec<(&str, Option<&str>)> = children.iter().map(|c| (c.as_str(), None)).collect();
        let http = FakeFetcher::new().route("https://a.test/index.xml", 200, &index(&pairs));
        let ctx = RunContext::new();
        let out = expander(&http, &ctx).expand(&["https://a.test/index.xml".to_string()]).await;
        assert!(out.leaves.is_empty());
        assert_eq!(http.hit_count("https://a.test/empty-9.xml"), 1);
        assert_eq!(http.hit_count("https://a.test/empty-10.xml"), 0);
    }

    #[tokio::test]
    async fn leaves_are_deduplicated_and_repass_the_chain() {
        let http = FakeFetcher::new()
            .route(
                "https://a.test/a.xml",
                200,
                &index(&[("https://a.test/leaf.xml", None), ("https://a.test/leaf.xml", None)]),
            )
            .route("https://a.test/leaf.xml", 200, &urlset(&["2025-05-15T08:00:00Z", "2025-01-01T00:00:00Z"], true));
        let ctx = RunContext::new();
        let out = expander(&http, &ctx)
            .expand(&["https://a.test/a.xml".to_string(), "https://a.test/leaf.xml".to_string()])
            .await;
        assert_eq!(out.leaves, vec!["https://a.test/leaf.xml"]);
        assert_eq!(http.hit_count("https://a.test/leaf.xml"), 1);
        let cached = out.leaf_dates.get("https://a.test/leaf.xml").copied().flatten();
        assert_eq!(cached, Some(Utc.with_ymd_and_hms(2025, 5, 15, 8, 0, 0).unwrap()));

        let chain = FilterChain::new(24, now());
        for leaf in &out.leaves {
            assert!(chain.first_rejection(leaf, out.leaf_dates[leaf]).is_none());
        }
    }
}
