/*!
 * Backing Store
 *
 * The memory manager side of quota negotiation: it may grant a limit raise
 * and must accept any limit handed back.
 */

use super::types::{QuotaKind, QuotaLimits};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Quota negotiation with the pool owner
pub trait BackingStore: Send + Sync {
    /// Ask for `increment` more limit; returns the amount granted, if any
    fn raise_limit(&self, kind: QuotaKind, increment: usize) -> Option<usize>;

    /// Hand limit back; always accepted
    fn return_limit(&self, kind: QuotaKind, amount: usize);

    /// Pool quota still grantable
    fn available(&self, kind: QuotaKind) -> usize;
}

/// Fixed-capacity pool store
///
/// Tracks how much of each pool's capacity is currently granted out. Page
/// file quota is never negotiated here.
#[derive(Debug)]
pub struct PoolBackingStore {
    capacity: [usize; 2],
    granted: [AtomicUsize; 2],
}

impl PoolBackingStore {
    pub fn new(capacity: QuotaLimits) -> Self {
        Self {
            capacity: [capacity.non_paged, capacity.paged],
            granted: [AtomicUsize::new(0), AtomicUsize::new(0)],
        }
    }

    /// Store that refuses every raise
    pub fn exhausted() -> Self {
        Self::new(QuotaLimits::new(0, 0, 0))
    }

    #[inline]
    fn slot(kind: QuotaKind) -> Option<usize> {
        match kind {
            QuotaKind::NonPaged => Some(0),
            QuotaKind::Paged => Some(1),
            QuotaKind::PageFile => None,
        }
    }

    pub fn granted(&self, kind: QuotaKind) -> usize {
        Self::slot(kind).map_or(0, |i| self.granted[i].load(Ordering::Acquire))
    }
}

impl BackingStore for PoolBackingStore {
    fn raise_limit(&self, kind: QuotaKind, increment: usize) -> Option<usize> {
        let slot = Self::slot(kind)?;
        let capacity = self.capacity[slot];
        self.granted[slot]
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |granted| {
                granted
                    .checked_add(increment)
                    .filter(|total| *total <= capacity)
            })
            .ok()
            .map(|_| increment)
    }

    fn return_limit(&self, kind: QuotaKind, amount: usize) {
        if let Some(slot) = Self::slot(kind) {
            // Blocks may hand back limit they were created with, not only grants
            let _ = self.granted[slot].fetch_update(Ordering::AcqRel, Ordering::Acquire, |g| {
                Some(g.saturating_sub(amount))
            });
        }
    }

    fn available(&self, kind: QuotaKind) -> usize {
        Self::slot(kind).map_or(0, |i| {
            self.capacity[i].saturating_sub(self.granted[i].load(Ordering::Acquire))
        })
    }
}
