/*!
 * Timer Rundown
 * Timers armed by a thread die with it
 */

use super::{RundownStats, SubsystemRundown};
use crate::core::types::Tid;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub u64);

#[derive(Debug, Default)]
pub struct TimerRundown {
    armed: DashMap<Tid, Vec<TimerId>, ahash::RandomState>,
    next_id: AtomicU64,
    cancelled: AtomicU64,
}

impl TimerRundown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&self, tid: Tid) -> TimerId {
        let id = TimerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.armed.entry(tid).or_default().push(id);
        id
    }

    pub fn disarm(&self, tid: Tid, id: TimerId) -> bool {
        self.armed
            .get_mut(&tid)
            .map(|mut timers| {
                let before = timers.len();
                timers.retain(|t| *t != id);
                before != timers.len()
            })
            .unwrap_or(false)
    }

    pub fn armed_for(&self, tid: Tid) -> usize {
        self.armed.get(&tid).map(|t| t.len()).unwrap_or(0)
    }

    pub fn cancelled(&self) -> u64 {
        self.cancelled.load(Ordering::Relaxed)
    }
}

impl SubsystemRundown for TimerRundown {
    fn rundown_thread(&self, tid: Tid) -> RundownStats {
        let count = self
            .armed
            .remove(&tid)
            .map(|(_, timers)| timers.len())
            .unwrap_or(0);
        self.cancelled.fetch_add(count as u64, Ordering::Relaxed);
        RundownStats::cancelled(count)
    }

    fn subsystem(&self) -> &'static str {
        "timers"
    }

    fn has_pending(&self, tid: Tid) -> bool {
        self.armed_for(tid) > 0
    }
}
