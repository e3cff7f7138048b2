/*!
 * Process Termination Orchestration
 *
 * Terminate every thread of a process, every member of a job, or every
 * process in the system at shutdown, and wait for the results.
 */

use super::termination::{critical_break, terminate_by_pointer};
use crate::core::limits::{MAX_WAIT_OBJECTS, WAIT_ALL_PASSES};
use crate::core::sync::Event;
use crate::core::Status;
use crate::kernel::Kernel;
use crate::process::object::ProcessFlags;
use crate::process::{Job, Process, ThreadCtx};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Ask every thread of `process` except the caller to exit
///
/// Returns `NOTHING_TO_TERMINATE` when the process had no threads.
pub(crate) fn terminate_threads(kernel: &Kernel, process: &Process, status: Status) -> Status {
    let caller = ThreadCtx::current();
    let mut result = Status::NOTHING_TO_TERMINATE;
    for thread in process.threads() {
        result = Status::SUCCESS;
        if caller.as_ref().is_some_and(|ctx| ctx.is(&thread)) {
            continue;
        }
        if let Err(e) = terminate_by_pointer(kernel, &thread, status, false) {
            debug!(tid = thread.tid(), "thread not terminated: {}", e);
        }
    }
    result
}

/// Terminate a process reached by pointer (job limits and shutdown)
///
/// Empty and debugged processes lose their handle table so they cannot
/// keep themselves alive.
pub(crate) fn terminate_process_by_pointer(
    kernel: &Kernel,
    process: &Arc<Process>,
    status: Status,
) -> Status {
    if process.has_flag(ProcessFlags::BREAK_ON_TERMINATION) {
        critical_break(kernel, "process", process.pid());
    }
    process.test_and_set(ProcessFlags::DELETE);

    let result = terminate_threads(kernel, process, status);
    if result == Status::NOTHING_TO_TERMINATE || process.debug_port().is_some() {
        process.handles().kill();
    }
    result
}

/// Enforce a job limit by terminating every member
pub(crate) fn terminate_job(kernel: &Kernel, job: &Job, status: Status) -> Status {
    let members = job.processes();
    info!(job = job.id(), members = members.len(), "terminating job");
    for process in &members {
        terminate_process_by_pointer(kernel, process, status);
    }
    Status::SUCCESS
}

/// Outcome of a system shutdown
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownReport {
    /// Processes asked to exit
    pub terminated: usize,
    /// Processes that had exited by the time the wait ended
    pub exited: usize,
    /// Wait passes that timed out
    pub timed_out_passes: u32,
    pub gave_up: bool,
}

/// Processes still worth waiting for
fn live_processes(kernel: &Kernel) -> Vec<Arc<Process>> {
    kernel
        .cids()
        .processes()
        .into_iter()
        .filter(|p| !p.is_system() && !p.exited().is_set() && p.thread_count() > 0)
        .collect()
}

/// Terminate every non-system process and wait for them to exit
///
/// Only the first call does anything; later calls return an empty report.
pub(crate) fn shutdown_system(kernel: &Kernel) -> ShutdownReport {
    if !kernel.begin_shutdown() {
        warn!("shutdown already in progress");
        return ShutdownReport::default();
    }

    let config = kernel.config();
    let targets = live_processes(kernel);
    info!(processes = targets.len(), "system shutdown");

    let mut report = ShutdownReport::default();
    for process in &targets {
        process.set_exception_port(None);
        terminate_process_by_pointer(kernel, process, Status::SYSTEM_SHUTDOWN);
        report.terminated += 1;
    }

    let mut remaining: Vec<Arc<Process>> = targets;
    while !remaining.is_empty() {
        let mut progressed = false;
        for batch in remaining.chunks(MAX_WAIT_OBJECTS) {
            let events: Vec<&Event> = batch.iter().map(|p| p.exited()).collect();
            if Event::wait_any(
                &events,
                Some(config.shutdown_wait_timeout),
                config.wait_poll_interval,
            )
            .is_some()
            {
                progressed = true;
            }
        }
        remaining.retain(|p| !p.exited().is_set());
        if remaining.is_empty() {
            break;
        }
        if !progressed {
            report.timed_out_passes += 1;
            warn!(
                remaining = remaining.len(),
                pass = report.timed_out_passes,
                "shutdown wait timed out"
            );
            if report.timed_out_passes >= config.shutdown_max_passes {
                report.gave_up = true;
                break;
            }
        }
    }

    report.exited = report.terminated - remaining.len();
    info!(
        exited = report.exited,
        gave_up = report.gave_up,
        "shutdown wait finished"
    );
    report
}

/// Wait for every non-system process to exit, doubling the timeout per pass
pub(crate) fn wait_for_all_processes(kernel: &Kernel) -> bool {
    let config = kernel.config();
    let mut timeout = config.wait_all_initial_timeout;
    for pass in 0..WAIT_ALL_PASSES {
        let remaining = live_processes(kernel);
        if remaining.is_empty() {
            return true;
        }
        debug!(pass, remaining = remaining.len(), "waiting for processes");
        for process in &remaining {
            process.exited().wait(Some(timeout));
        }
        timeout = timeout.saturating_mul(2).min(Duration::from_secs(3600));
    }
    live_processes(kernel).is_empty()
}
