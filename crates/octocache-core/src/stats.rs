use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Live counters updated by the orchestrator.
#[derive(Debug, Default)]
pub(crate) struct CacheCounters {
    local_hits: AtomicU64,
    shared_hits: AtomicU64,
    misses: AtomicU64,
    factory_invocations: AtomicU64,
    shared_sync_completions: AtomicU64,
    shared_faults: AtomicU64,
    corrupt_payloads: AtomicU64,
    oversized_payloads: AtomicU64,
}

macro_rules! bump {
    ($($name:ident => $field:ident),* $(,)?) => {
        $(
            pub(crate) fn $name(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl CacheCounters {
    bump! {
        local_hit => local_hits,
        shared_hit => shared_hits,
        miss => misses,
        factory_invoked => factory_invocations,
        shared_completed_sync => shared_sync_completions,
        shared_fault => shared_faults,
        corrupt_payload => corrupt_payloads,
        oversized_payload => oversized_payloads,
    }

    pub(crate) fn snapshot(&self, stampede_joins: u64, in_flight: usize) -> CacheStats {
        CacheStats {
            local_hits: self.local_hits.load(Ordering::Relaxed),
            shared_hits: self.shared_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            factory_invocations: self.factory_invocations.load(Ordering::Relaxed),
            stampede_joins,
            shared_sync_completions: self.shared_sync_completions.load(Ordering::Relaxed),
            shared_faults: self.shared_faults.load(Ordering::Relaxed),
            corrupt_payloads: self.corrupt_payloads.load(Ordering::Relaxed),
            oversized_payloads: self.oversized_payloads.load(Ordering::Relaxed),
            in_flight,
        }
    }
}

/// Statistics for a [`TieredCache`](crate::TieredCache).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Lookups answered by the local tier.
    pub local_hits: u64,
    /// Lookups answered by the shared tier.
    pub shared_hits: u64,
    /// Lookups that found nothing in either tier.
    pub misses: u64,
    /// Times a factory actually ran.
    pub factory_invocations: u64,
    /// Callers that joined an in-flight factory instead of starting one.
    pub stampede_joins: u64,
    /// Shared-tier reads that completed without suspending.
    pub shared_sync_completions: u64,
    /// Shared-tier calls that failed and were tolerated.
    pub shared_faults: u64,
    /// Shared payloads that could not be decoded.
    pub corrupt_payloads: u64,
    /// Values too large to cache.
    pub oversized_payloads: u64,
    /// Factories running right now.
    pub in_flight: usize,
}

impl CacheStats {
    /// Calculate hit rate as a percentage.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.local_hits + self.shared_hits;
        let total = hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (hits as f64 / total as f64) * 100.0
        }
    }
}
