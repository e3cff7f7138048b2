/*!
 * Job Objects
 *
 * A job groups processes for accounting and limit enforcement. Member
 * exits fold into the job's accounting and are reported once on its
 * completion port, classified as ordinary or abnormal.
 */

use super::ports::{JobExitReason, MessagePort, PortMessage};
use super::Process;
use crate::core::types::Pid;
use crate::core::Status;
use crate::quota::QuotaKind;
use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};

/// Exit statuses reported as abnormal: faults, traps and user breaks
const ABNORMAL_EXIT_STATUSES: &[Status] = &[
    Status::GUARD_PAGE_VIOLATION,
    Status::DATATYPE_MISALIGNMENT,
    Status::BREAKPOINT,
    Status::SINGLE_STEP,
    Status::ACCESS_VIOLATION,
    Status::IN_PAGE_ERROR,
    Status::ILLEGAL_INSTRUCTION,
    Status::NONCONTINUABLE_EXCEPTION,
    Status::INVALID_DISPOSITION,
    Status::ARRAY_BOUNDS_EXCEEDED,
    Status::FLOAT_DENORMAL_OPERAND,
    Status::FLOAT_DIVIDE_BY_ZERO,
    Status::FLOAT_INEXACT_RESULT,
    Status::FLOAT_INVALID_OPERATION,
    Status::FLOAT_OVERFLOW,
    Status::FLOAT_STACK_CHECK,
    Status::FLOAT_UNDERFLOW,
    Status::INTEGER_DIVIDE_BY_ZERO,
    Status::INTEGER_OVERFLOW,
    Status::PRIVILEGED_INSTRUCTION,
    Status::STACK_OVERFLOW,
    Status::CONTROL_C_EXIT,
    Status::FLOAT_MULTIPLE_FAULTS,
    Status::FLOAT_MULTIPLE_TRAPS,
    Status::REG_NAT_CONSUMPTION,
];

/// Classify a process exit status for the job completion message
pub fn classify_exit(status: Status) -> JobExitReason {
    if ABNORMAL_EXIT_STATUSES.contains(&status) {
        JobExitReason::AbnormalExitProcess
    } else {
        JobExitReason::ExitProcess
    }
}

/// Totals folded in from member processes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobAccounting {
    pub total_processes: u32,
    pub active_processes: u32,
    pub abnormal_exits: u32,
    pub peak_non_paged: usize,
    pub peak_paged: usize,
}

pub struct Job {
    id: u32,
    completion_port: Mutex<Option<Arc<dyn MessagePort>>>,
    members: Mutex<Vec<Weak<Process>>>,
    accounting: Mutex<JobAccounting>,
}

impl Job {
    pub(crate) fn new(id: u32) -> Self {
        Self {
            id,
            completion_port: Mutex::new(None),
            members: Mutex::new(Vec::new()),
            accounting: Mutex::new(JobAccounting::default()),
        }
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn set_completion_port(&self, port: Arc<dyn MessagePort>) {
        *self.completion_port.lock() = Some(port);
    }

    pub(crate) fn add_process(&self, process: &Arc<Process>) {
        self.members.lock().push(Arc::downgrade(process));
        let mut accounting = self.accounting.lock();
        accounting.total_processes += 1;
        accounting.active_processes += 1;
    }

    /// Live member processes
    pub fn processes(&self) -> Vec<Arc<Process>> {
        let mut members = self.members.lock();
        members.retain(|w| w.strong_count() > 0);
        members.iter().filter_map(Weak::upgrade).collect()
    }

    /// Fold an exiting member into the totals
    pub(crate) fn fold_exit(&self, process: &Process, status: Status) {
        let mut accounting = self.accounting.lock();
        accounting.active_processes = accounting.active_processes.saturating_sub(1);
        if classify_exit(status) == JobExitReason::AbnormalExitProcess {
            accounting.abnormal_exits += 1;
        }
        let quota = process.quota();
        accounting.peak_non_paged = accounting
            .peak_non_paged
            .max(quota.peak(QuotaKind::NonPaged));
        accounting.peak_paged = accounting.peak_paged.max(quota.peak(QuotaKind::Paged));
    }

    /// Report a member exit on the completion port, if one is set
    pub(crate) fn report_exit(&self, pid: Pid, status: Status) {
        let port = self.completion_port.lock().clone();
        let Some(port) = port else {
            return;
        };
        let reason = classify_exit(status);
        if let Err(e) = port.send(PortMessage::JobCompletion {
            job: self.id,
            pid,
            reason,
        }) {
            debug!("Job {} completion message for PID {} dropped: {}", self.id, pid, e);
        }
    }

    pub fn accounting(&self) -> JobAccounting {
        self.accounting.lock().clone()
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("accounting", &self.accounting())
            .finish()
    }
}
