use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

/// Sentinel demand meaning "effectively infinite": additions saturate here
/// and consumption no longer decrements.
pub const UNBOUNDED: u64 = u64::MAX;

/// Outstanding-demand counter.
///
/// Producers of demand ([`request`](crate::flow::Subscription::request))
/// add; the drain subtracts after successful emissions. The counter
/// saturates at [`UNBOUNDED`] and never goes negative: the drain only
/// subtracts what it has emitted, and it emits at most what it observed.
pub(crate) struct Demand(CachePadded<AtomicU64>);

impl Demand {
    pub(crate) fn new() -> Self {
        Self(CachePadded::new(AtomicU64::new(0)))
    }

    pub(crate) fn unbounded() -> Self {
        Self(CachePadded::new(AtomicU64::new(UNBOUNDED)))
    }

    #[inline]
    pub(crate) fn get(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    /// Adds `n`, saturating at [`UNBOUNDED`]. Returns the previous value.
    pub(crate) fn add(&self, n: u64) -> u64 {
        let mut cur = self.0.load(Ordering::Relaxed);
        loop {
            if cur == UNBOUNDED {
                return cur;
            }
            let next = cur.saturating_add(n);
            match self
                .0
                .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(prev) => return prev,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Subtracts `n` emissions, unless the demand is unbounded.
    pub(crate) fn sub(&self, n: u64) {
        let mut cur = self.0.load(Ordering::Relaxed);
        loop {
            if cur == UNBOUNDED {
                return;
            }
            debug_assert!(cur >= n, "demand accounting underflow: {cur} - {n}");
            let next = cur.saturating_sub(n);
            match self
                .0
                .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(actual) => cur = actual,
            }
        }
    }
}
