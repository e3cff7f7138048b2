/*!
 * Notify Routines
 * Create and exit callouts registered by other subsystems
 */

use crate::core::types::{Pid, Tid};
use crate::core::Status;
use parking_lot::RwLock;
use std::sync::Arc;

/// Thread create/exit callout
pub trait ThreadNotify: Send + Sync {
    fn thread_created(&self, _pid: Pid, _tid: Tid) {}

    /// Runs on the exiting thread before subsystem rundown
    fn thread_exited(&self, _pid: Pid, _tid: Tid, _status: Status) {}
}

/// Process create/exit callout
pub trait ProcessNotify: Send + Sync {
    fn process_created(&self, _pid: Pid, _parent: Option<Pid>) {}

    /// Runs on the last thread at the start of process rundown
    fn process_exited(&self, _pid: Pid, _status: Status) {}
}

#[derive(Default)]
pub(crate) struct NotifyRegistry {
    threads: RwLock<Vec<Arc<dyn ThreadNotify>>>,
    processes: RwLock<Vec<Arc<dyn ProcessNotify>>>,
}

impl NotifyRegistry {
    pub(crate) fn add_thread(&self, routine: Arc<dyn ThreadNotify>) {
        self.threads.write().push(routine);
    }

    pub(crate) fn add_process(&self, routine: Arc<dyn ProcessNotify>) {
        self.processes.write().push(routine);
    }

    pub(crate) fn thread_created(&self, pid: Pid, tid: Tid) {
        for routine in self.threads.read().iter() {
            routine.thread_created(pid, tid);
        }
    }

    pub(crate) fn thread_exited(&self, pid: Pid, tid: Tid, status: Status) {
        for routine in self.threads.read().iter() {
            routine.thread_exited(pid, tid, status);
        }
    }

    pub(crate) fn process_created(&self, pid: Pid, parent: Option<Pid>) {
        for routine in self.processes.read().iter() {
            routine.process_created(pid, parent);
        }
    }

    pub(crate) fn process_exited(&self, pid: Pid, status: Status) {
        for routine in self.processes.read().iter() {
            routine.process_exited(pid, status);
        }
    }
}
