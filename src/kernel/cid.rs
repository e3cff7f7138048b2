/*!
 * Client ID Table
 * Maps process and thread ids to live objects
 */

use crate::core::limits::{CID_INCREMENT, FIRST_USER_CID};
use crate::core::types::{Pid, Tid};
use crate::process::{Process, Thread};
use ahash::RandomState;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Process and thread ids share one id space
pub struct CidTable {
    processes: DashMap<Pid, Arc<Process>, RandomState>,
    threads: DashMap<Tid, Arc<Thread>, RandomState>,
    next: AtomicU32,
}

impl Default for CidTable {
    fn default() -> Self {
        Self::new()
    }
}

impl CidTable {
    pub fn new() -> Self {
        Self {
            // Thread ids churn more than process ids
            processes: DashMap::with_capacity_and_hasher_and_shard_amount(0, RandomState::new(), 32),
            threads: DashMap::with_capacity_and_hasher_and_shard_amount(0, RandomState::new(), 64),
            next: AtomicU32::new(FIRST_USER_CID),
        }
    }

    /// Next unused id
    pub(crate) fn allocate(&self) -> u32 {
        self.next.fetch_add(CID_INCREMENT, Ordering::Relaxed)
    }

    pub(crate) fn insert_process(&self, process: Arc<Process>) {
        self.processes.insert(process.pid(), process);
    }

    pub(crate) fn insert_thread(&self, thread: Arc<Thread>) {
        self.threads.insert(thread.tid(), thread);
    }

    pub fn process(&self, pid: Pid) -> Option<Arc<Process>> {
        self.processes.get(&pid).map(|p| Arc::clone(p.value()))
    }

    pub fn thread(&self, tid: Tid) -> Option<Arc<Thread>> {
        self.threads.get(&tid).map(|t| Arc::clone(t.value()))
    }

    pub(crate) fn remove_process(&self, pid: Pid) -> Option<Arc<Process>> {
        self.processes.remove(&pid).map(|(_, p)| p)
    }

    pub(crate) fn remove_thread(&self, tid: Tid) -> Option<Arc<Thread>> {
        self.threads.remove(&tid).map(|(_, t)| t)
    }

    /// Snapshot of every process, ordered by pid
    pub fn processes(&self) -> Vec<Arc<Process>> {
        let mut all: Vec<_> = self.processes.iter().map(|e| Arc::clone(e.value())).collect();
        all.sort_by_key(|p| p.pid());
        all
    }

    #[inline]
    pub fn process_count(&self) -> usize {
        self.processes.len()
    }

    #[inline]
    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }
}

impl std::fmt::Debug for CidTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CidTable")
            .field("processes", &self.process_count())
            .field("threads", &self.thread_count())
            .finish()
    }
}
