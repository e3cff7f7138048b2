/*!
 * Rundown Protection
 *
 * Counts in-flight external accessors of an object. Once teardown begins,
 * new acquisitions fail and the owner waits for the count to drain.
 *
 * The state word holds the accessor count in units of two; bit 0 marks
 * rundown as active.
 */

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};

const RUNDOWN_ACTIVE: usize = 1;
const COUNT_UNIT: usize = 2;

#[derive(Debug, Default)]
pub struct RundownProtection {
    state: AtomicUsize,
    lock: Mutex<()>,
    drained: Condvar,
}

impl RundownProtection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a reference unless rundown has started
    pub fn acquire(&self) -> Option<RundownGuard<'_>> {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current & RUNDOWN_ACTIVE != 0 {
                return None;
            }
            match self.state.compare_exchange_weak(
                current,
                current + COUNT_UNIT,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(RundownGuard { owner: self }),
                Err(actual) => current = actual,
            }
        }
    }

    fn release(&self) {
        let previous = self.state.fetch_sub(COUNT_UNIT, Ordering::AcqRel);
        if previous - COUNT_UNIT == RUNDOWN_ACTIVE {
            let _guard = self.lock.lock();
            self.drained.notify_all();
        }
    }

    /// Block new acquisitions and wait for existing ones to drain
    pub fn wait_for_release(&self) {
        self.state.fetch_or(RUNDOWN_ACTIVE, Ordering::AcqRel);
        let mut guard = self.lock.lock();
        while self.state.load(Ordering::Acquire) != RUNDOWN_ACTIVE {
            self.drained.wait(&mut guard);
        }
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.state.load(Ordering::Acquire) & RUNDOWN_ACTIVE != 0
    }

    #[inline]
    pub fn accessors(&self) -> usize {
        self.state.load(Ordering::Acquire) / COUNT_UNIT
    }
}

/// Accessor reference, released on drop
#[must_use = "rundown protection is released when the guard drops"]
pub struct RundownGuard<'a> {
    owner: &'a RundownProtection,
}

impl Drop for RundownGuard<'_> {
    fn drop(&mut self) {
        self.owner.release();
    }
}
