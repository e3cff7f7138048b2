/*!
 * Quota Entry
 *
 * Lock-free usage/limit/peak/return counters for one resource kind.
 *
 * # Ordering
 *
 * `usage` is always loaded (Acquire) before `limit`. A limit only ever drops
 * after the matching usage drop, so a limit read after usage is never larger
 * than the one that pairs with that usage: a stale read can refuse a charge
 * that would have fit, never admit one that does not.
 */

use super::types::QuotaEntrySnapshot;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Result of the fast charge path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChargeOutcome {
    /// Charged; carries the new usage
    Charged(usize),
    /// `usage + amount` does not fit in a machine word
    Overflow,
    /// Would exceed the limit read after `usage`
    OverLimit { usage: usize, limit: usize },
}

/// Counters for one quota kind
#[repr(C, align(64))]
#[derive(Debug, Default)]
pub struct QuotaEntry {
    usage: AtomicUsize,
    limit: AtomicUsize,
    peak: AtomicUsize,
    pending_return: AtomicUsize,
}

impl QuotaEntry {
    pub fn new(limit: usize) -> Self {
        Self {
            usage: AtomicUsize::new(0),
            limit: AtomicUsize::new(limit),
            peak: AtomicUsize::new(0),
            pending_return: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn usage(&self) -> usize {
        self.usage.load(Ordering::Acquire)
    }

    #[inline]
    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::Acquire)
    }

    #[inline]
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn pending_return(&self) -> usize {
        self.pending_return.load(Ordering::Acquire)
    }

    /// Fast path: CAS `usage` up while it stays within `limit`
    pub(crate) fn try_charge(&self, amount: usize, retries: &AtomicU64) -> ChargeOutcome {
        let mut usage = self.usage.load(Ordering::Acquire);
        loop {
            let Some(new_usage) = usage.checked_add(amount) else {
                return ChargeOutcome::Overflow;
            };
            // Re-read on every pass, after the usage it is compared with
            let limit = self.limit.load(Ordering::Acquire);
            if new_usage > limit {
                return ChargeOutcome::OverLimit { usage, limit };
            }
            match self.usage.compare_exchange_weak(
                usage,
                new_usage,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.ratchet_peak(new_usage);
                    return ChargeOutcome::Charged(new_usage);
                }
                Err(actual) => {
                    usage = actual;
                    retries.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Subtract from usage; `None` (and no change) if it would go negative
    pub(crate) fn release(&self, amount: usize) -> Option<usize> {
        self.usage
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |u| u.checked_sub(amount))
            .ok()
            .map(|previous| previous - amount)
    }

    #[inline]
    pub(crate) fn ratchet_peak(&self, value: usize) {
        self.peak.fetch_max(value, Ordering::Relaxed);
    }

    /// Fold this entry's own pending return credit back into its limit
    pub(crate) fn reclaim_return(&self) -> usize {
        let credit = self.pending_return.swap(0, Ordering::AcqRel);
        if credit > 0 {
            self.limit.fetch_add(credit, Ordering::AcqRel);
        }
        credit
    }

    /// Remove the pending return credit so it can go back to the backing store
    pub(crate) fn take_return(&self) -> usize {
        self.pending_return.swap(0, Ordering::AcqRel)
    }

    pub(crate) fn raise_limit(&self, increment: usize) {
        // Saturate so an unlimited entry stays unlimited
        let _ = self
            .limit
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |l| {
                Some(l.saturating_add(increment))
            });
    }

    pub(crate) fn store_limit(&self, limit: usize) {
        self.limit.store(limit, Ordering::Release);
    }

    /// Drop the limit to current usage, returning the amount removed
    pub(crate) fn shrink_to_usage(&self) -> usize {
        let mut limit = self.limit.load(Ordering::Acquire);
        loop {
            let usage = self.usage.load(Ordering::Acquire);
            if limit <= usage {
                return 0;
            }
            match self.limit.compare_exchange_weak(
                limit,
                usage,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return limit - usage,
                Err(actual) => limit = actual,
            }
        }
    }

    /// Shrink the limit by up to `increment` while slack exceeds `threshold`
    ///
    /// The shrunk amount moves into the pending return credit. Returns the
    /// credit now pending.
    pub(crate) fn give_back(&self, threshold: usize, increment: usize) -> Option<usize> {
        let mut limit = self.limit.load(Ordering::Acquire);
        loop {
            let usage = self.usage.load(Ordering::Acquire);
            let slack = limit.saturating_sub(usage);
            if slack <= threshold {
                return None;
            }
            let shrink = increment.min(slack - threshold);
            match self.limit.compare_exchange_weak(
                limit,
                limit - shrink,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    let pending = self.pending_return.fetch_add(shrink, Ordering::AcqRel) + shrink;
                    return Some(pending);
                }
                Err(actual) => limit = actual,
            }
        }
    }

    pub fn snapshot(&self) -> QuotaEntrySnapshot {
        let usage = self.usage();
        QuotaEntrySnapshot {
            usage,
            limit: self.limit(),
            peak: self.peak(),
            pending_return: self.pending_return(),
        }
    }
}
