//! Extraction targets: built from discovery records or read from a targets
//! file, and written back out as the targets hand-off file.

use crate::error::Result;
use crate::models::{
    CssSection, DiscoveryEnvelope, DiscoveryRecord, ExtractionTarget, LeafSelectors, LeafSitemapEntry, SourceType,
    TargetsFileEntry,
};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tokio::fs;
use tracing::{info, instrument, warn};

fn has_url_path(fields: &BTreeMap<String, String>) -> bool {
    fields.get("url").is_some_and(|p| !p.trim().is_empty())
}

/// Targets for one discovery record: one per leaf whose selectors carry a
/// `url` mapping, and one per page of a successful CSS fallback.
pub fn targets_from_record(record: &DiscoveryRecord) -> Vec<ExtractionTarget> {
    let mut out = Vec::new();
    for leaf in &record.llm_detection.selectors {
        let Some(sel) = &leaf.detected_selectors else {
            continue;
        };
        if !has_url_path(&sel.fields) {
            continue;
        }
        out.push(ExtractionTarget::Sitemap {
            site: record.url.clone(),
            sitemap_url: leaf.url.clone(),
            item_tag: sel.item.clone(),
            fields: sel.fields.clone(),
        });
    }
    if record.css_fallback.success {
        if let Some(report) = &record.css_fallback.selectors {
            out.extend(css_targets(&record.url, &report.page_url, &report.sections));
        }
    }
    out
}

/// One CSS target per page the sections were detected on.
fn css_targets(site: &str, page_url: &str, sections: &[CssSection]) -> Vec<ExtractionTarget> {
    let mut pages: Vec<(String, Vec<CssSection>)> = Vec::new();
    for s in sections {
        let page = s.source_url.clone().unwrap_or_else(|| page_url.to_string());
        match pages.iter_mut().find(|(p, _)| *p == page) {
            Some((_, list)) => list.push(s.clone()),
            None => pages.push((page, vec![s.clone()])),
        }
    }
    pages
        .into_iter()
        .map(|(page_url, sections)| ExtractionTarget::Css {
            site: site.to_string(),
            page_url,
            sections,
        })
        .collect()
}

pub fn targets_from_records(records: &[DiscoveryRecord]) -> Vec<ExtractionTarget> {
    records.iter().flat_map(targets_from_record).collect()
}

/// Targets-file entries: one sitemap entry per site listing its leaves, and
/// one CSS entry per page.
pub fn file_entries(targets: &[ExtractionTarget]) -> Vec<TargetsFileEntry> {
    let mut out: Vec<TargetsFileEntry> = Vec::new();
    let mut sitemap_slot: HashMap<String, usize> = HashMap::new();
    for t in targets {
        match t {
            ExtractionTarget::Sitemap {
                site,
                sitemap_url,
                item_tag,
                fields,
            } => {
                let leaf = LeafSitemapEntry {
                    url: sitemap_url.clone(),
                    selectors: LeafSelectors {
                        item: item_tag.clone(),
                        fields: fields.clone(),
                    },
                };
                match sitemap_slot.get(site) {
                    Some(&i) => out[i].leaf_sitemaps.get_or_insert_with(Vec::new).push(leaf),
                    None => {
                        sitemap_slot.insert(site.clone(), out.len());
                        out.push(TargetsFileEntry {
                            source: site.clone(),
                            source_type: SourceType::Sitemap,
                            leaf_sitemaps: Some(vec![leaf]),
                            page_url: None,
                            sections: None,
                        });
                    }
                }
            }
            ExtractionTarget::Css {
                site,
                page_url,
                sections,
            } => out.push(TargetsFileEntry {
                source: site.clone(),
                source_type: SourceType::Css,
                leaf_sitemaps: None,
                page_url: Some(page_url.clone()),
                sections: Some(sections.clone()),
            }),
        }
    }
    out
}

/// Targets described by targets-file entries. Leaves without a `url` field
/// and CSS entries without sections are skipped.
pub fn targets_from_entries(entries: Vec<TargetsFileEntry>) -> Vec<ExtractionTarget> {
    let mut out = Vec::new();
    for e in entries {
        match e.source_type {
            SourceType::Sitemap => {
                for leaf in e.leaf_sitemaps.unwrap_or_default() {
                    if !has_url_path(&leaf.selectors.fields) {
                        warn!(leaf = %leaf.url, "Skipping leaf without url field");
                        continue;
                    }
                    out.push(ExtractionTarget::Sitemap {
                        site: e.source.clone(),
                        sitemap_url: leaf.url,
                        item_tag: leaf.selectors.item,
                        fields: leaf.selectors.fields,
                    });
                }
            }
            SourceType::Css => {
                let sections = e.sections.unwrap_or_default();
                if sections.is_empty() {
                    continue;
                }
                out.push(ExtractionTarget::Css {
                    page_url: e.page_url.unwrap_or_else(|| e.source.clone()),
                    site: e.source,
                    sections,
                });
            }
        }
    }
    out
}

#[instrument(level = "info", skip_all, fields(path = %path.display()))]
pub async fn write_targets_file(path: &Path, targets: &[ExtractionTarget]) -> Result<usize> {
    let entries = file_entries(targets);
    let json = serde_json::to_string_pretty(&entries)?;
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir).await?;
    }
    fs::write(path, json).await?;
    info!(entries = entries.len(), targets = targets.len(), "Targets file written");
    Ok(entries.len())
}

#[instrument(level = "info", skip_all, fields(path = %path.display()))]
pub async fn load_targets_file(path: &Path) -> Result<Vec<ExtractionTarget>> {
    let text = fs::read_to_string(path).await?;
    let entries: Vec<TargetsFileEntry> = serde_json::from_str(&text)?;
    let targets = targets_from_entries(entries);
    info!(targets = targets.len(), "Targets file loaded");
    Ok(targets)
}

/// Discovery records from a JSON-lines stream. Malformed lines are skipped.
#[instrument(level = "info", skip_all, fields(path = %path.display()))]
pub async fn load_discovery_stream(path: &Path) -> Result<Vec<DiscoveryRecord>> {
    let text = fs::read_to_string(path).await?;
    let mut records = Vec::new();
    for (n, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<DiscoveryEnvelope>(line) {
            Ok(env) => records.push(env.result),
            Err(e) => warn!(line = n + 1, error = %e, "Skipping malformed discovery line"),
        }
    }
    info!(records = records.len(), "Discovery stream loaded");
    Ok(records)
}

/// Targets grouped by site, sites in order of first appearance.
pub fn group_by_site(targets: Vec<ExtractionTarget>) -> Vec<(String, Vec<ExtractionTarget>)> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: BTreeMap<String, Vec<ExtractionTarget>> = BTreeMap::new();
    for t in targets {
        let site = t.site().to_string();
        if !groups.contains_key(&site) {
            order.push(site.clone());
        }
        groups.entry(site).or_default().push(t);
    }
    order
        .into_iter()
        .filter_map(|s| groups.remove(&s).map(|g| (s, g)))
        .collect()
}
