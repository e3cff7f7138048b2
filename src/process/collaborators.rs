/*!
 * External Collaborators
 *
 * Interfaces to the subsystems the lifecycle core consumes but does not
 * own: pool memory, kernel stacks, address spaces and the audit trail.
 * Each comes with an in-memory implementation used by default.
 */

use crate::core::limits::{DEFAULT_POOL_CAPACITY, KERNEL_STACK_SIZE};
use crate::core::types::{Pid, Tid};
use crate::core::Status;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

// =============================================================================
// POOL
// =============================================================================

/// Non-paged pool
pub trait PoolAllocator: Send + Sync {
    /// Reserve `size` bytes; false when the pool cannot satisfy it
    fn try_reserve(&self, size: usize) -> bool;
    fn release(&self, size: usize);
}

/// Pool memory owned by its holder, released on drop
pub struct PoolAllocation {
    size: usize,
    pool: Arc<dyn PoolAllocator>,
}

impl PoolAllocation {
    pub fn allocate(pool: &Arc<dyn PoolAllocator>, size: usize) -> Option<Self> {
        pool.try_reserve(size).then(|| Self {
            size,
            pool: pool.clone(),
        })
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for PoolAllocation {
    fn drop(&mut self) {
        self.pool.release(self.size);
    }
}

impl std::fmt::Debug for PoolAllocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolAllocation").field("size", &self.size).finish()
    }
}

/// Fixed-capacity pool with failure injection
#[derive(Debug)]
pub struct SimulatedPool {
    capacity: usize,
    in_use: AtomicUsize,
    fail_next: AtomicU32,
    failures: AtomicU64,
}

impl SimulatedPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            in_use: AtomicUsize::new(0),
            fail_next: AtomicU32::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Fail the next `count` reservations regardless of capacity
    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::Release);
    }

    #[inline]
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    #[inline]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

impl Default for SimulatedPool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY)
    }
}

impl PoolAllocator for SimulatedPool {
    fn try_reserve(&self, size: usize) -> bool {
        let injected = self
            .fail_next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        let reserved = !injected
            && self
                .in_use
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                    used.checked_add(size).filter(|total| *total <= self.capacity)
                })
                .is_ok();
        if !reserved {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        reserved
    }

    fn release(&self, size: usize) {
        self.in_use.fetch_sub(size, Ordering::AcqRel);
    }
}

// =============================================================================
// KERNEL STACKS
// =============================================================================

/// Kernel stack of one thread
#[derive(Debug, PartialEq, Eq)]
pub struct KernelStack {
    pub tid: Tid,
    pub size: usize,
}

pub trait KernelStackAllocator: Send + Sync {
    fn allocate(&self, tid: Tid) -> Option<KernelStack>;
    /// Called by the reaper once the owning thread can no longer run on it
    fn free(&self, stack: KernelStack);
}

/// Record of one released stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackRelease {
    pub tid: Tid,
    /// Host thread that released it
    pub released_on: std::thread::ThreadId,
}

#[derive(Debug, Default)]
pub struct SimulatedStacks {
    live: DashMap<Tid, usize, ahash::RandomState>,
    released: Mutex<Vec<StackRelease>>,
    fail_next: AtomicU32,
}

impl SimulatedStacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::Release);
    }

    #[inline]
    pub fn live(&self) -> usize {
        self.live.len()
    }

    pub fn is_live(&self, tid: Tid) -> bool {
        self.live.contains_key(&tid)
    }

    pub fn releases(&self) -> Vec<StackRelease> {
        self.released.lock().clone()
    }
}

impl KernelStackAllocator for SimulatedStacks {
    fn allocate(&self, tid: Tid) -> Option<KernelStack> {
        if self
            .fail_next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
        {
            return None;
        }
        self.live.insert(tid, KERNEL_STACK_SIZE);
        Some(KernelStack {
            tid,
            size: KERNEL_STACK_SIZE,
        })
    }

    fn free(&self, stack: KernelStack) {
        self.live.remove(&stack.tid);
        self.released.lock().push(StackRelease {
            tid: stack.tid,
            released_on: std::thread::current().id(),
        });
    }
}

// =============================================================================
// ADDRESS SPACES
// =============================================================================

pub trait AddressSpaceManager: Send + Sync {
    fn create(&self, pid: Pid) -> bool;
    /// Tear down every mapping of an exiting process
    fn clean(&self, pid: Pid);
    fn exists(&self, pid: Pid) -> bool;
}

#[derive(Debug, Default)]
pub struct SimulatedAddressSpaces {
    live: DashMap<Pid, (), ahash::RandomState>,
    cleaned: AtomicU64,
}

impl SimulatedAddressSpaces {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cleaned(&self) -> u64 {
        self.cleaned.load(Ordering::Relaxed)
    }
}

impl AddressSpaceManager for SimulatedAddressSpaces {
    fn create(&self, pid: Pid) -> bool {
        self.live.insert(pid, ());
        true
    }

    fn clean(&self, pid: Pid) {
        if self.live.remove(&pid).is_some() {
            self.cleaned.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn exists(&self, pid: Pid) -> bool {
        self.live.contains_key(&pid)
    }
}

// =============================================================================
// AUDIT
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub pid: Pid,
    pub status: Status,
}

pub trait SecurityAudit: Send + Sync {
    fn process_exit(&self, pid: Pid, status: Status);
}

#[derive(Debug, Default)]
pub struct AuditLog {
    records: Mutex<Vec<AuditRecord>>,
}

impl AuditLog {
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().clone()
    }
}

impl SecurityAudit for AuditLog {
    fn process_exit(&self, pid: Pid, status: Status) {
        self.records.lock().push(AuditRecord { pid, status });
    }
}

/// Collaborator set a kernel is built with
#[derive(Clone)]
pub struct Collaborators {
    pub pool: Arc<dyn PoolAllocator>,
    pub stacks: Arc<dyn KernelStackAllocator>,
    pub address_spaces: Arc<dyn AddressSpaceManager>,
    pub audit: Arc<dyn SecurityAudit>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            pool: Arc::new(SimulatedPool::default()),
            stacks: Arc::new(SimulatedStacks::new()),
            address_spaces: Arc::new(SimulatedAddressSpaces::new()),
            audit: Arc::new(AuditLog::default()),
        }
    }
}
