//! # Monitoring Counters
//!
//! Process-wide counters for the adaptive hash index. All counters are
//! relaxed atomics: they exist for observability and carry no ordering
//! obligations toward the operations they count.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters owned by the search system.
#[derive(Debug, Default)]
pub struct SearchStats {
    pub(crate) row_added: AtomicU64,
    pub(crate) row_removed: AtomicU64,
    pub(crate) row_remove_not_found: AtomicU64,
    pub(crate) row_updated: AtomicU64,
    pub(crate) page_added: AtomicU64,
    pub(crate) page_removed: AtomicU64,
    pub(crate) n_succ: AtomicU64,
    pub(crate) n_fail: AtomicU64,
}

impl SearchStats {
    #[inline]
    pub(crate) fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SearchStatsSnapshot {
        SearchStatsSnapshot {
            row_added: self.row_added.load(Ordering::Relaxed),
            row_removed: self.row_removed.load(Ordering::Relaxed),
            row_remove_not_found: self.row_remove_not_found.load(Ordering::Relaxed),
            row_updated: self.row_updated.load(Ordering::Relaxed),
            page_added: self.page_added.load(Ordering::Relaxed),
            page_removed: self.page_removed.load(Ordering::Relaxed),
            n_succ: self.n_succ.load(Ordering::Relaxed),
            n_fail: self.n_fail.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SearchStatsSnapshot {
    /// Hash rows inserted or refreshed.
    pub row_added: u64,
    /// Hash rows erased.
    pub row_removed: u64,
    /// Erase attempts that found no matching row.
    pub row_remove_not_found: u64,
    /// Hash rows repointed at a moved record.
    pub row_updated: u64,
    /// Pages that gained a hash.
    pub page_added: u64,
    /// Pages that lost their hash.
    pub page_removed: u64,
    /// Successful fast-path lookups.
    pub n_succ: u64,
    /// Failed fast-path lookups.
    pub n_fail: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counts() {
        let stats = SearchStats::default();
        SearchStats::inc(&stats.row_added);
        SearchStats::add(&stats.row_removed, 3);
        let snap = stats.snapshot();
        assert_eq!(snap.row_added, 1);
        assert_eq!(snap.row_removed, 3);
        assert_eq!(snap.n_succ, 0);
    }
}
