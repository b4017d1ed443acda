//! Run-scoped shared state.
//!
//! One [`RunContext`] lives for the whole process run and is handed by
//! reference to every stage. All maps are behind mutexes; the promoted-domain
//! set is add-only and browser budgets only ever count down.

use crate::models::FilterKind;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use tracing::info;

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Which one-shot browser budget a retry draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BudgetScope {
    Robots,
    SitemapProbe,
}

#[derive(Debug, Default)]
pub struct RunContext {
    promoted: Mutex<HashSet<String>>,
    browser_attempts: Mutex<HashMap<(BudgetScope, String), u32>>,
    rejections: Mutex<HashMap<FilterKind, u64>>,
    per_host_budget: u32,
}

impl RunContext {
    pub fn new() -> Self {
        Self {
            per_host_budget: 1,
            ..Default::default()
        }
    }

    /// Mark `domain` as needing browser-first fetches for the rest of the run.
    /// Returns `true` when the domain was not promoted before.
    pub fn promote(&self, domain: &str) -> bool {
        if domain.is_empty() {
            return false;
        }
        let newly = lock(&self.promoted).insert(domain.to_lowercase());
        if newly {
            info!(domain, "Promoted domain to browser-first");
        }
        newly
    }

    pub fn is_promoted(&self, domain: &str) -> bool {
        lock(&self.promoted).contains(&domain.to_lowercase())
    }

    pub fn promoted_domains(&self) -> Vec<String> {
        let mut out: Vec<String> = lock(&self.promoted).iter().cloned().collect();
        out.sort();
        out
    }

    /// Consume one browser attempt for `host` in `scope`.
    ///
    /// Returns `false` once the host's budget is spent.
    pub fn take_browser_attempt(&self, scope: BudgetScope, host: &str) -> bool {
        let key = (scope, host.to_lowercase());
        let mut map = lock(&self.browser_attempts);
        let used = map.entry(key).or_insert(0);
        if *used >= self.per_host_budget {
            return false;
        }
        *used += 1;
        true
    }

    pub fn record_rejection(&self, filter: FilterKind) {
        *lock(&self.rejections).entry(filter).or_insert(0) += 1;
    }

    pub fn rejection_count(&self, filter: FilterKind) -> u64 {
        lock(&self.rejections).get(&filter).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn browser_budget_is_one_shot_per_host_and_scope() {
        let ctx = RunContext::new();
        assert!(ctx.take_browser_attempt(BudgetScope::Robots, "example.com"));
        assert!(!ctx.take_browser_attempt(BudgetScope::Robots, "EXAMPLE.com"));
        assert!(ctx.take_browser_attempt(BudgetScope::SitemapProbe, "example.com"));
        assert!(ctx.take_browser_attempt(BudgetScope::Robots, "other.org"));
    }

    #[test]
    fn promotion_is_add_only() {
        let ctx = RunContext::new();
        assert!(!ctx.is_promoted("news.test"));
        assert!(ctx.promote("news.test"));
        assert!(!ctx.promote("news.test"));
        assert!(ctx.is_promoted("NEWS.test"));
        assert!(!ctx.promote(""));
    }

    #[test]
    fn concurrent_promotions_land_once() {
        let ctx = Arc::new(RunContext::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let ctx = Arc::clone(&ctx);
                std::thread::spawn(move || {
                    ctx.promote("shared.test");
                    ctx.promote(&format!("d{i}.test"));
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let domains = ctx.promoted_domains();
        assert_eq!(domains.len(), 9);
        assert_eq!(domains.iter().filter(|d| *d == "shared.test").count(), 1);
    }

    #[test]
    fn rejection_counters_accumulate() {
        let ctx = RunContext::new();
        ctx.record_rejection(FilterKind::Year);
        ctx.record_rejection(FilterKind::Year);
        ctx.record_rejection(FilterKind::Word);
        assert_eq!(ctx.rejection_count(FilterKind::Year), 2);
        assert_eq!(ctx.rejection_count(FilterKind::Word), 1);
        assert_eq!(ctx.rejection_count(FilterKind::Date), 0);
    }
}
