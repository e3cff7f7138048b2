/*!
 * I/O Cancellation
 * Requests issued by a thread are cancelled when it exits
 */

use super::{RundownStats, SubsystemRundown};
use crate::core::types::Tid;
use dashmap::DashMap;
use parking_lot::Mutex;

/// Outstanding I/O request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoRequest {
    pub id: u64,
    pub bytes: usize,
}

#[derive(Debug, Default)]
pub struct IoCancellation {
    pending: DashMap<Tid, Vec<IoRequest>, ahash::RandomState>,
    cancelled: Mutex<Vec<(Tid, IoRequest)>>,
}

impl IoCancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submit(&self, tid: Tid, request: IoRequest) {
        self.pending.entry(tid).or_default().push(request);
    }

    /// Complete a request normally; false if it was not pending
    pub fn complete(&self, tid: Tid, id: u64) -> bool {
        let Some(mut list) = self.pending.get_mut(&tid) else {
            return false;
        };
        let before = list.len();
        list.retain(|r| r.id != id);
        before != list.len()
    }

    pub fn pending_for(&self, tid: Tid) -> usize {
        self.pending.get(&tid).map(|l| l.len()).unwrap_or(0)
    }

    /// Every request cancelled by rundown so far
    pub fn cancelled(&self) -> Vec<(Tid, IoRequest)> {
        self.cancelled.lock().clone()
    }
}

impl SubsystemRundown for IoCancellation {
    fn rundown_thread(&self, tid: Tid) -> RundownStats {
        let Some((_, requests)) = self.pending.remove(&tid) else {
            return RundownStats::default();
        };
        let count = requests.len();
        self.cancelled
            .lock()
            .extend(requests.into_iter().map(|r| (tid, r)));
        RundownStats::cancelled(count)
    }

    fn subsystem(&self) -> &'static str {
        "io"
    }

    fn has_pending(&self, tid: Tid) -> bool {
        self.pending_for(tid) > 0
    }
}
