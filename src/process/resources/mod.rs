/*!
 * Subsystem Rundown
 * Per-thread cancellation of work other subsystems hold on a thread's behalf
 *
 * An exiting thread calls out to every registered subsystem so it can
 * cancel pending I/O, timers and registry notifications before the thread
 * object goes away.
 */

mod io;
mod registry;
mod timers;

pub use io::{IoCancellation, IoRequest};
pub use registry::RegistryNotifyRundown;
pub use timers::{TimerId, TimerRundown};

use crate::core::types::Tid;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Rundown statistics
#[derive(Debug, Clone, Default)]
pub struct RundownStats {
    pub items_cancelled: usize,
    pub errors_encountered: usize,
    pub duration_micros: u64,
    pub by_subsystem: HashMap<&'static str, usize>,
}

impl RundownStats {
    #[inline]
    pub fn cancelled(items: usize) -> Self {
        Self {
            items_cancelled: items,
            ..Self::default()
        }
    }

    fn merge(&mut self, other: RundownStats) {
        self.items_cancelled += other.items_cancelled;
        self.errors_encountered += other.errors_encountered;
        self.duration_micros += other.duration_micros;
        for (name, count) in other.by_subsystem {
            *self.by_subsystem.entry(name).or_insert(0) += count;
        }
    }
}

/// A subsystem holding per-thread work
pub trait SubsystemRundown: Send + Sync {
    /// Cancel everything pending for `tid`
    fn rundown_thread(&self, tid: Tid) -> RundownStats;

    fn subsystem(&self) -> &'static str;

    fn has_pending(&self, tid: Tid) -> bool;
}

/// Runs subsystem rundown in reverse registration order
#[derive(Clone, Default)]
pub struct RundownOrchestrator {
    subsystems: Arc<Vec<Arc<dyn SubsystemRundown>>>,
}

impl RundownOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subsystem (builder pattern)
    #[must_use]
    pub fn register(mut self, subsystem: Arc<dyn SubsystemRundown>) -> Self {
        Arc::make_mut(&mut self.subsystems).push(subsystem);
        self
    }

    pub fn rundown_thread(&self, tid: Tid) -> RundownResult {
        let start = Instant::now();
        let mut total = RundownStats::default();
        let mut errors = Vec::new();

        for subsystem in self.subsystems.iter().rev() {
            if !subsystem.has_pending(tid) {
                continue;
            }
            let sub_start = Instant::now();
            let mut stats = subsystem.rundown_thread(tid);
            stats.duration_micros = sub_start.elapsed().as_micros() as u64;
            stats
                .by_subsystem
                .insert(subsystem.subsystem(), stats.items_cancelled);

            if stats.errors_encountered > 0 {
                errors.push(format!(
                    "{}: {} errors during rundown",
                    subsystem.subsystem(),
                    stats.errors_encountered
                ));
            }
            log::debug!(
                "Ran down {} {} items for TID {} ({}μs)",
                stats.items_cancelled,
                subsystem.subsystem(),
                tid,
                stats.duration_micros
            );
            total.merge(stats);
        }

        total.duration_micros = start.elapsed().as_micros() as u64;
        RundownResult {
            tid,
            stats: total,
            errors,
        }
    }

    pub fn subsystem_count(&self) -> usize {
        self.subsystems.len()
    }

    pub fn registered(&self) -> Vec<&'static str> {
        self.subsystems.iter().map(|s| s.subsystem()).collect()
    }
}

/// Result of one thread's rundown
#[derive(Debug)]
pub struct RundownResult {
    pub tid: Tid,
    pub stats: RundownStats,
    pub errors: Vec<String>,
}

impl RundownResult {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

impl fmt::Display for RundownResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TID {} rundown: {} items cancelled, {} errors",
            self.tid,
            self.stats.items_cancelled,
            self.errors.len()
        )
    }
}
