/*!
 * Quota Ledger
 *
 * Charge and return pooled-resource quota against quota blocks.
 *
 * # Concurrency
 *
 * Entry counters move with CAS only. The global lock (the block list mutex)
 * covers what touches more than one block or the backing store: expansion,
 * scavenging, handing credit back, block insertion and destruction. A charge
 * only reaches it after the fast path and its own pending credit failed.
 *
 * # Process attachment
 *
 * A process charges through a `ProcessQuota`: an RCU-swapped attachment to
 * its current block plus the process's own per-kind mirror. When a process
 * moves off the default block, what it had charged so far stays charged to
 * the default block; returns drain the new block's share first and fall back
 * to the default block for the remainder.
 *
 * Process charges and returns hold the process's attachment lock shared, so
 * the attachment they load, the block they touch and the mirror they update
 * stay consistent with one another. Block moves and detach take it
 * exclusively. Lock order is attachment lock, then the global lock.
 */

use super::backing::{BackingStore, PoolBackingStore};
use super::block::{QuotaBlock, QuotaBlockRef};
use super::entry::ChargeOutcome;
use super::types::{
    ProcessQuotaSnapshot, QuotaKind, QuotaLimits, QuotaSplit, QuotaStats,
};
use crate::core::bugcheck::{bugcheck, BugCheckCode};
use crate::core::config::QuotaConfig;
use crate::core::errors::{KernelError, KernelResult};
use crate::core::limits::NO_CAP;
use crate::core::types::Pid;
use arc_swap::{ArcSwap, ArcSwapOption};
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// Lock-free ledger counters
#[repr(C, align(64))]
#[derive(Debug, Default)]
struct AtomicQuotaStats {
    charges: AtomicU64,
    returns: AtomicU64,
    failures: AtomicU64,
    cas_retries: AtomicU64,
    credit_reclaims: AtomicU64,
    expansions: AtomicU64,
    scavenges: AtomicU64,
    givebacks: AtomicU64,
    blocks_created: AtomicU64,
    blocks_destroyed: AtomicU64,
}

impl AtomicQuotaStats {
    #[inline(always)]
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> QuotaStats {
        QuotaStats {
            charges: self.charges.load(Ordering::Relaxed),
            returns: self.returns.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            cas_retries: self.cas_retries.load(Ordering::Relaxed),
            credit_reclaims: self.credit_reclaims.load(Ordering::Relaxed),
            expansions: self.expansions.load(Ordering::Relaxed),
            scavenges: self.scavenges.load(Ordering::Relaxed),
            givebacks: self.givebacks.load(Ordering::Relaxed),
            blocks_created: self.blocks_created.load(Ordering::Relaxed),
            blocks_destroyed: self.blocks_destroyed.load(Ordering::Relaxed),
        }
    }
}

/// State shared by the ledger handle and every block reference
pub(crate) struct LedgerShared {
    default_block: Arc<QuotaBlock>,
    /// Global lock; guards the live block list
    blocks: Mutex<Vec<Weak<QuotaBlock>>>,
    backing: Arc<dyn BackingStore>,
    config: ArcSwap<QuotaConfig>,
    next_id: AtomicU64,
    stats: AtomicQuotaStats,
}

impl LedgerShared {
    /// Last reference dropped: unlink and hand residual limit back
    pub(crate) fn destroy_block(&self, block: &Arc<QuotaBlock>) {
        let mut blocks = self.blocks.lock();
        blocks.retain(|w| w.strong_count() > 0 && !std::ptr::eq(w.as_ptr(), Arc::as_ptr(block)));

        for kind in QuotaKind::POOL {
            let entry = block.entry(kind);
            let limit = entry.limit();
            let credit = entry.take_return();
            let residual = if limit == NO_CAP {
                0
            } else {
                limit.saturating_sub(entry.usage())
            };
            let amount = residual.saturating_add(credit);
            if amount > 0 {
                self.backing.return_limit(kind, amount);
            }
            if entry.usage() > 0 {
                warn!(
                    "Quota block {} destroyed with {} bytes of {:?} quota still charged",
                    block.id(),
                    entry.usage(),
                    kind
                );
            }
        }
        AtomicQuotaStats::bump(&self.stats.blocks_destroyed);
        debug!("Quota block {} destroyed", block.id());
    }

    /// Reclaim credit from every live block; caller holds the global lock
    fn scavenge_locked(&self, blocks: &mut Vec<Weak<QuotaBlock>>) -> usize {
        blocks.retain(|w| w.strong_count() > 0);
        let mut reclaimed = 0usize;

        for block in blocks.iter().filter_map(Weak::upgrade) {
            for kind in QuotaKind::POOL {
                let entry = block.entry(kind);
                let credit = entry.take_return();
                if credit > 0 {
                    self.backing.return_limit(kind, credit);
                    reclaimed = reclaimed.saturating_add(credit);
                }
                if block.process_count() == 0 && !block.is_default() {
                    let freed = entry.shrink_to_usage();
                    if freed > 0 {
                        self.backing.return_limit(kind, freed);
                        reclaimed = reclaimed.saturating_add(freed);
                    }
                }
            }
        }

        AtomicQuotaStats::bump(&self.stats.scavenges);
        debug!("Quota scavenge reclaimed {} bytes", reclaimed);
        reclaimed
    }

    /// Raise `block`'s limit for `kind` so `amount` more fits
    fn expand(&self, block: &QuotaBlock, kind: QuotaKind, amount: usize) -> bool {
        let config = self.config.load();
        let entry = block.entry(kind);
        let cap = config.expansion_cap.get(kind);
        let mut blocks = self.blocks.lock();

        let mut scavenged = false;
        loop {
            // Someone may have expanded or returned while we waited
            let usage = entry.usage();
            let limit = entry.limit();
            let Some(wanted) = usage.checked_add(amount) else {
                return false;
            };
            if wanted <= limit {
                return true;
            }
            let needed = wanted - limit;
            let mut increment = needed.max(config.expansion_increment);
            if cap != NO_CAP {
                let room = cap.saturating_sub(limit);
                if room < needed {
                    debug!(
                        "Quota block {} at its {:?} cap ({} bytes)",
                        block.id(),
                        kind,
                        cap
                    );
                    return false;
                }
                increment = increment.min(room);
            }

            let mut granted = self.backing.raise_limit(kind, increment);
            if granted.is_none() && increment > needed {
                granted = self.backing.raise_limit(kind, needed);
            }
            if let Some(granted) = granted {
                entry.raise_limit(granted);
                AtomicQuotaStats::bump(&self.stats.expansions);
                debug!(
                    "Quota block {} expanded {:?} limit by {} bytes",
                    block.id(),
                    kind,
                    granted
                );
                return true;
            }

            if scavenged {
                return false;
            }
            self.scavenge_locked(&mut blocks);
            scavenged = true;
        }
    }
}

/// Per-process quota state
pub struct ProcessQuota {
    pid: Pid,
    attachment: ArcSwapOption<QuotaAttachment>,
    usage: [AtomicUsize; 3],
    peak: [AtomicUsize; 3],
    /// Charges and returns hold it shared; block moves and detach exclusive
    lock: RwLock<()>,
}

/// A process's link to its block
pub struct QuotaAttachment {
    block: QuotaBlockRef,
    /// Usage that stayed charged to the default block when the process moved off it
    default_share: [AtomicUsize; 3],
}

impl QuotaAttachment {
    fn new(block: QuotaBlockRef, default_share: [usize; 3]) -> Self {
        Self {
            block,
            default_share: default_share.map(AtomicUsize::new),
        }
    }

    #[inline]
    pub fn block(&self) -> &QuotaBlockRef {
        &self.block
    }

    #[inline]
    pub fn default_share(&self, kind: QuotaKind) -> usize {
        self.default_share[kind.index()].load(Ordering::Acquire)
    }
}

impl ProcessQuota {
    pub fn new(pid: Pid) -> Self {
        Self {
            pid,
            attachment: ArcSwapOption::new(None),
            usage: Default::default(),
            peak: Default::default(),
            lock: RwLock::new(()),
        }
    }

    #[inline]
    pub fn usage(&self, kind: QuotaKind) -> usize {
        self.usage[kind.index()].load(Ordering::Acquire)
    }

    #[inline]
    pub fn peak(&self, kind: QuotaKind) -> usize {
        self.peak[kind.index()].load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_attached(&self) -> bool {
        self.attachment.load().is_some()
    }

    pub fn attachment(&self) -> Option<Arc<QuotaAttachment>> {
        self.attachment.load_full()
    }

    fn attached(&self) -> KernelResult<Arc<QuotaAttachment>> {
        self.attachment
            .load_full()
            .ok_or_else(|| KernelError::process_gone(self.pid))
    }
}

/// Handle to the system-wide quota ledger
#[derive(Clone)]
pub struct QuotaLedger {
    shared: Arc<LedgerShared>,
}

impl QuotaLedger {
    pub fn new(config: QuotaConfig, backing: Arc<dyn BackingStore>) -> Self {
        let default_block = Arc::new(QuotaBlock::new(0, true, config.default_limits));
        default_block.pin();
        info!(
            "Quota ledger initialized (giveback {})",
            if config.giveback_enabled { "on" } else { "off" }
        );
        Self {
            shared: Arc::new(LedgerShared {
                blocks: Mutex::new(vec![Arc::downgrade(&default_block)]),
                default_block,
                backing,
                config: ArcSwap::from_pointee(config),
                next_id: AtomicU64::new(1),
                stats: AtomicQuotaStats::default(),
            }),
        }
    }

    /// Ledger backed by a fixed-capacity pool store sized from `config`
    pub fn with_pool_backing(config: QuotaConfig) -> Self {
        let backing = Arc::new(PoolBackingStore::new(config.backing_capacity));
        Self::new(config, backing)
    }

    pub fn reconfigure(&self, config: QuotaConfig) {
        self.shared.config.store(Arc::new(config));
    }

    pub fn config(&self) -> Arc<QuotaConfig> {
        self.shared.config.load_full()
    }

    pub fn backing_store(&self) -> &Arc<dyn BackingStore> {
        &self.shared.backing
    }

    pub fn default_block(&self) -> QuotaBlockRef {
        QuotaBlockRef::acquire(&self.shared.default_block, &self.shared)
    }

    /// New block with explicit limits, linked into the global list
    pub fn create_block(&self, limits: QuotaLimits) -> QuotaBlockRef {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let block = Arc::new(QuotaBlock::new(id, false, limits));
        self.shared.blocks.lock().push(Arc::downgrade(&block));
        AtomicQuotaStats::bump(&self.shared.stats.blocks_created);
        debug!("Quota block {} created with {:?}", id, limits);
        QuotaBlockRef::acquire(&block, &self.shared)
    }

    /// Charge `amount` of `kind` to `block`
    pub fn charge(&self, block: &QuotaBlock, kind: QuotaKind, amount: usize) -> KernelResult<()> {
        if amount == 0 {
            return Ok(());
        }
        let stats = &self.shared.stats;
        let entry = block.entry(kind);

        loop {
            match entry.try_charge(amount, &stats.cas_retries) {
                ChargeOutcome::Charged(_) => {
                    AtomicQuotaStats::bump(&stats.charges);
                    return Ok(());
                }
                ChargeOutcome::Overflow => break,
                ChargeOutcome::OverLimit { .. } => {
                    if !kind.is_pool() {
                        break;
                    }
                    if entry.reclaim_return() > 0 {
                        AtomicQuotaStats::bump(&stats.credit_reclaims);
                        continue;
                    }
                    if self.shared.expand(block, kind, amount) {
                        continue;
                    }
                    break;
                }
            }
        }

        AtomicQuotaStats::bump(&stats.failures);
        debug!(
            "Quota charge of {} {:?} bytes to block {} refused",
            amount,
            kind,
            block.id()
        );
        Err(KernelError::QuotaExceeded { kind })
    }

    /// Return `amount` of `kind` to `block`
    ///
    /// Returning more than is charged is an invariant violation and halts.
    pub fn return_quota(&self, block: &QuotaBlock, kind: QuotaKind, amount: usize) {
        if amount == 0 {
            return;
        }
        let entry = block.entry(kind);
        if entry.release(amount).is_none() {
            bugcheck(
                BugCheckCode::QuotaUnderflow,
                [block.id(), kind.index() as u64, amount as u64, entry.usage() as u64],
            );
        }
        AtomicQuotaStats::bump(&self.shared.stats.returns);

        let config = self.shared.config.load();
        if !kind.is_pool() || block.is_default() || !config.giveback_enabled {
            return;
        }
        if let Some(pending) = entry.give_back(config.giveback_threshold, config.giveback_increment) {
            AtomicQuotaStats::bump(&self.shared.stats.givebacks);
            if pending > config.giveback_threshold {
                let _global = self.shared.blocks.lock();
                let credit = entry.take_return();
                if credit > 0 {
                    self.shared.backing.return_limit(kind, credit);
                    debug!(
                        "Quota block {} gave {} {:?} bytes back",
                        block.id(),
                        credit,
                        kind
                    );
                }
            }
        }
    }

    /// Reclaim unreturned credit system-wide
    pub fn scavenge(&self) -> usize {
        let mut blocks = self.shared.blocks.lock();
        self.shared.scavenge_locked(&mut blocks)
    }

    /// Blocks currently linked, the default one included
    pub fn live_blocks(&self) -> usize {
        self.shared
            .blocks
            .lock()
            .iter()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    pub fn stats(&self) -> QuotaStats {
        self.shared.stats.snapshot()
    }

    // -------------------------------------------------------------------------
    // Process-level operations
    // -------------------------------------------------------------------------

    /// Attach a new process, sharing its parent's block when that is not the default
    pub fn inherit(&self, quota: &ProcessQuota, parent: Option<&ProcessQuota>) {
        let block = parent
            .and_then(ProcessQuota::attachment)
            .filter(|att| !att.block.is_default())
            .map(|att| att.block.clone())
            .unwrap_or_else(|| self.default_block());
        block.add_process();
        let _guard = quota.lock.write();
        quota
            .attachment
            .store(Some(Arc::new(QuotaAttachment::new(block, [0; 3]))));
    }

    /// Release the attachment, returning whatever the process still has charged
    pub fn detach(&self, quota: &ProcessQuota) {
        let _guard = quota.lock.write();
        let Some(attachment) = quota.attachment.swap(None) else {
            return;
        };
        for kind in QuotaKind::ALL {
            let outstanding = quota.usage[kind.index()].swap(0, Ordering::AcqRel);
            if outstanding > 0 {
                self.return_split(&attachment, kind, outstanding, outstanding);
            }
        }
        attachment.block.remove_process();
        debug!(
            "PID {} detached from quota block {}",
            quota.pid,
            attachment.block.id()
        );
    }

    /// Charge through the process's current block and mirror the charge
    pub fn charge_process(
        &self,
        quota: &ProcessQuota,
        kind: QuotaKind,
        amount: usize,
    ) -> KernelResult<()> {
        let _guard = quota.lock.read();
        let attachment = quota.attached()?;
        self.charge(&attachment.block, kind, amount)?;
        let usage = quota.usage[kind.index()].fetch_add(amount, Ordering::AcqRel) + amount;
        quota.peak[kind.index()].fetch_max(usage, Ordering::Relaxed);
        Ok(())
    }

    /// Charge that returns itself when the holder drops it
    pub fn charge_process_held(
        &self,
        quota: &Arc<ProcessQuota>,
        kind: QuotaKind,
        amount: usize,
    ) -> KernelResult<ProcessCharge> {
        self.charge_process(quota, kind, amount)?;
        Ok(ProcessCharge {
            ledger: self.clone(),
            quota: Arc::clone(quota),
            kind,
            amount,
        })
    }

    /// Return a process charge; a detached process has nothing left to return
    pub fn return_process(&self, quota: &ProcessQuota, kind: QuotaKind, amount: usize) -> QuotaSplit {
        let _guard = quota.lock.read();
        let Some(attachment) = quota.attachment.load_full() else {
            return QuotaSplit::default();
        };
        let before = match quota.usage[kind.index()].fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |u| u.checked_sub(amount),
        ) {
            Ok(before) => before,
            Err(current) => bugcheck(
                BugCheckCode::QuotaUnderflow,
                [quota.pid as u64, kind.index() as u64, amount as u64, current as u64],
            ),
        };
        self.return_split(&attachment, kind, amount, before)
    }

    fn return_split(
        &self,
        attachment: &QuotaAttachment,
        kind: QuotaKind,
        amount: usize,
        usage_before: usize,
    ) -> QuotaSplit {
        if attachment.block.is_default() {
            self.return_quota(&attachment.block, kind, amount);
            return QuotaSplit {
                block: 0,
                default: amount,
            };
        }

        let share = &attachment.default_share[kind.index()];
        let block_part = usage_before.saturating_sub(share.load(Ordering::Acquire)).min(amount);
        let default_part = amount - block_part;

        if default_part > 0 {
            if share
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| s.checked_sub(default_part))
                .is_err()
            {
                bugcheck(
                    BugCheckCode::QuotaUnderflow,
                    [attachment.block.id(), kind.index() as u64, default_part as u64, 0],
                );
            }
            self.return_quota(&self.shared.default_block, kind, default_part);
        }
        if block_part > 0 {
            self.return_quota(&attachment.block, kind, block_part);
        }
        QuotaSplit {
            block: block_part,
            default: default_part,
        }
    }

    /// Move a process onto its own block, or adjust the one it already owns
    pub fn set_limits(&self, quota: &ProcessQuota, limits: QuotaLimits) -> KernelResult<()> {
        let _guard = quota.lock.write();
        let current = quota.attached()?;

        if current.block.is_default() {
            let block = self.create_block(limits);
            block.add_process();
            let share = QuotaKind::ALL.map(|kind| quota.usage(kind));
            quota
                .attachment
                .store(Some(Arc::new(QuotaAttachment::new(block, share))));
            current.block.remove_process();
            info!("PID {} moved to its own quota block", quota.pid);
            return Ok(());
        }

        for kind in QuotaKind::ALL {
            if limits.get(kind) < current.block.entry(kind).usage() {
                return Err(KernelError::InvalidParameter(format!(
                    "{:?} limit {} is below current usage",
                    kind,
                    limits.get(kind)
                )));
            }
        }
        for kind in QuotaKind::ALL {
            current.block.entry(kind).store_limit(limits.get(kind));
        }
        Ok(())
    }

    /// Charge both pool kinds for an object shared across processes
    ///
    /// The returned reference pins the block the charge landed on; hand it
    /// back to `return_shared` to release the charge there.
    pub fn charge_shared(
        &self,
        quota: &ProcessQuota,
        paged: usize,
        non_paged: usize,
    ) -> KernelResult<QuotaBlockRef> {
        let attachment = quota.attached()?;
        let block = attachment.block.clone();
        self.charge(&block, QuotaKind::Paged, paged)?;
        if let Err(e) = self.charge(&block, QuotaKind::NonPaged, non_paged) {
            self.return_quota(&block, QuotaKind::Paged, paged);
            return Err(e);
        }
        Ok(block)
    }

    pub fn return_shared(&self, block: QuotaBlockRef, paged: usize, non_paged: usize) {
        self.return_quota(&block, QuotaKind::Paged, paged);
        self.return_quota(&block, QuotaKind::NonPaged, non_paged);
    }

    pub fn query(&self, quota: &ProcessQuota) -> KernelResult<ProcessQuotaSnapshot> {
        let attachment = quota.attached()?;
        Ok(ProcessQuotaSnapshot {
            usage: QuotaKind::ALL.map(|kind| quota.usage(kind)),
            peak: QuotaKind::ALL.map(|kind| quota.peak(kind)),
            block: attachment.block.snapshot(),
        })
    }
}

/// Process charge owned by an object, returned on drop
pub struct ProcessCharge {
    ledger: QuotaLedger,
    quota: Arc<ProcessQuota>,
    kind: QuotaKind,
    amount: usize,
}

impl ProcessCharge {
    #[inline]
    pub fn kind(&self) -> QuotaKind {
        self.kind
    }

    #[inline]
    pub fn amount(&self) -> usize {
        self.amount
    }
}

impl Drop for ProcessCharge {
    fn drop(&mut self) {
        self.ledger.return_process(&self.quota, self.kind, self.amount);
    }
}

impl std::fmt::Debug for ProcessCharge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessCharge")
            .field("pid", &self.quota.pid)
            .field("kind", &self.kind)
            .field("amount", &self.amount)
            .finish()
    }
}

impl std::fmt::Debug for QuotaLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaLedger")
            .field("live_blocks", &self.live_blocks())
            .field("stats", &self.stats())
            .finish()
    }
}
