/*!
 * Lifecycle Statistics
 * Atomic counters for the termination, delivery and reaping paths
 */

use crate::quota::QuotaStats;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free lifecycle counters
///
/// Cache-line aligned; every update is a relaxed increment.
#[repr(C, align(64))]
#[derive(Debug, Default)]
pub struct LifecycleStats {
    processes_created: AtomicU64,
    processes_exited: AtomicU64,
    threads_created: AtomicU64,
    threads_exited: AtomicU64,
    termination_requests: AtomicU64,
    duplicate_terminations: AtomicU64,
    apcs_inline: AtomicU64,
    apcs_queued: AtomicU64,
    apcs_rejected: AtomicU64,
    apcs_delivered: AtomicU64,
    allocation_retries: AtomicU64,
    port_retries: AtomicU64,
    stacks_reaped: AtomicU64,
    reaper_batches: AtomicU64,
}

macro_rules! counter {
    ($inc:ident, $field:ident) => {
        #[inline(always)]
        pub fn $inc(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl LifecycleStats {
    pub fn new() -> Self {
        Self::default()
    }

    counter!(inc_processes_created, processes_created);
    counter!(inc_processes_exited, processes_exited);
    counter!(inc_threads_created, threads_created);
    counter!(inc_threads_exited, threads_exited);
    counter!(inc_termination_requests, termination_requests);
    counter!(inc_duplicate_terminations, duplicate_terminations);
    counter!(inc_apcs_inline, apcs_inline);
    counter!(inc_apcs_queued, apcs_queued);
    counter!(inc_apcs_rejected, apcs_rejected);
    counter!(inc_apcs_delivered, apcs_delivered);
    counter!(inc_allocation_retries, allocation_retries);
    counter!(inc_port_retries, port_retries);
    counter!(inc_stacks_reaped, stacks_reaped);
    counter!(inc_reaper_batches, reaper_batches);

    /// Read-only snapshot; pairs counters with the quota ledger's
    pub fn snapshot(&self, quota: QuotaStats) -> StatsSnapshot {
        StatsSnapshot {
            processes_created: self.processes_created.load(Ordering::Relaxed),
            processes_exited: self.processes_exited.load(Ordering::Relaxed),
            threads_created: self.threads_created.load(Ordering::Relaxed),
            threads_exited: self.threads_exited.load(Ordering::Relaxed),
            termination_requests: self.termination_requests.load(Ordering::Relaxed),
            duplicate_terminations: self.duplicate_terminations.load(Ordering::Relaxed),
            apcs_inline: self.apcs_inline.load(Ordering::Relaxed),
            apcs_queued: self.apcs_queued.load(Ordering::Relaxed),
            apcs_rejected: self.apcs_rejected.load(Ordering::Relaxed),
            apcs_delivered: self.apcs_delivered.load(Ordering::Relaxed),
            allocation_retries: self.allocation_retries.load(Ordering::Relaxed),
            port_retries: self.port_retries.load(Ordering::Relaxed),
            stacks_reaped: self.stacks_reaped.load(Ordering::Relaxed),
            reaper_batches: self.reaper_batches.load(Ordering::Relaxed),
            quota,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub processes_created: u64,
    pub processes_exited: u64,
    pub threads_created: u64,
    pub threads_exited: u64,
    pub termination_requests: u64,
    /// Requests that lost the race to set the terminated flag
    pub duplicate_terminations: u64,
    pub apcs_inline: u64,
    pub apcs_queued: u64,
    pub apcs_rejected: u64,
    pub apcs_delivered: u64,
    pub allocation_retries: u64,
    pub port_retries: u64,
    pub stacks_reaped: u64,
    pub reaper_batches: u64,
    pub quota: QuotaStats,
}
