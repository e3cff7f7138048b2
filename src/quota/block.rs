/*!
 * Quota Block
 *
 * A ledger of per-kind entries shared by a group of processes. Sharing is
 * counted explicitly: every `QuotaBlockRef` holds one reference and the
 * drop of the last one destroys the block.
 */

use super::entry::QuotaEntry;
use super::ledger::LedgerShared;
use super::types::{QuotaBlockSnapshot, QuotaKind, QuotaLimits};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub struct QuotaBlock {
    id: u64,
    is_default: bool,
    entries: [QuotaEntry; 3],
    reference_count: AtomicUsize,
    process_count: AtomicUsize,
}

impl QuotaBlock {
    pub(crate) fn new(id: u64, is_default: bool, limits: QuotaLimits) -> Self {
        Self {
            id,
            is_default,
            entries: [
                QuotaEntry::new(limits.non_paged),
                QuotaEntry::new(limits.paged),
                QuotaEntry::new(limits.page_file),
            ],
            reference_count: AtomicUsize::new(0),
            process_count: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn is_default(&self) -> bool {
        self.is_default
    }

    #[inline(always)]
    pub fn entry(&self, kind: QuotaKind) -> &QuotaEntry {
        &self.entries[kind.index()]
    }

    #[inline]
    pub fn reference_count(&self) -> usize {
        self.reference_count.load(Ordering::Acquire)
    }

    #[inline]
    pub fn process_count(&self) -> usize {
        self.process_count.load(Ordering::Acquire)
    }

    pub(crate) fn add_process(&self) {
        self.process_count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn remove_process(&self) {
        let _ = self
            .process_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1));
    }

    /// Take a reference that never drops (the default block's own)
    pub(crate) fn pin(&self) {
        self.reference_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn snapshot(&self) -> QuotaBlockSnapshot {
        QuotaBlockSnapshot {
            id: self.id,
            is_default: self.is_default,
            entries: [
                self.entries[0].snapshot(),
                self.entries[1].snapshot(),
                self.entries[2].snapshot(),
            ],
            reference_count: self.reference_count(),
            process_count: self.process_count(),
        }
    }
}

impl fmt::Debug for QuotaBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuotaBlock")
            .field("id", &self.id)
            .field("is_default", &self.is_default)
            .field("reference_count", &self.reference_count())
            .field("process_count", &self.process_count())
            .finish()
    }
}

/// Counted reference to a quota block
pub struct QuotaBlockRef {
    block: Arc<QuotaBlock>,
    ledger: Arc<LedgerShared>,
}

impl QuotaBlockRef {
    pub(crate) fn acquire(block: &Arc<QuotaBlock>, ledger: &Arc<LedgerShared>) -> Self {
        block.reference_count.fetch_add(1, Ordering::AcqRel);
        Self {
            block: block.clone(),
            ledger: ledger.clone(),
        }
    }

    #[inline(always)]
    pub fn block(&self) -> &Arc<QuotaBlock> {
        &self.block
    }

    #[inline]
    pub fn same_block(&self, other: &QuotaBlockRef) -> bool {
        Arc::ptr_eq(&self.block, &other.block)
    }
}

impl std::ops::Deref for QuotaBlockRef {
    type Target = QuotaBlock;

    fn deref(&self) -> &QuotaBlock {
        &self.block
    }
}

impl Clone for QuotaBlockRef {
    fn clone(&self) -> Self {
        Self::acquire(&self.block, &self.ledger)
    }
}

impl Drop for QuotaBlockRef {
    fn drop(&mut self) {
        if self.block.reference_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.ledger.destroy_block(&self.block);
        }
    }
}

impl fmt::Debug for QuotaBlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("QuotaBlockRef").field(&self.block).finish()
    }
}
