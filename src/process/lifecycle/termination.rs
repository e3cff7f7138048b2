/*!
 * Thread Termination Requests
 *
 * Terminating another thread sets its terminated flag (first writer wins)
 * and delivers the exit callback. The callback is two-staged:
 *
 * 1. **PendingKernel**: runs at the target's next kernel delivery point and
 *    re-queues itself as a user-mode callback with user delivery pending
 * 2. **PendingUser**: runs on the target's way back to user mode and calls
 *    the exit routine
 *
 * Only threads with a user-mode presence are reached this way; system
 * threads can only terminate themselves. The envelope's pool memory is
 * retried under a short delay rather than failing the request.
 */

use crate::apc::{ApcEnvelope, ApcRoutine};
use crate::core::bugcheck::BugCheckCode;
use crate::core::errors::{KernelError, KernelResult};
use crate::core::limits::APC_ENVELOPE_SIZE;
use crate::core::types::ProcessorMode;
use crate::core::Status;
use crate::kernel::Kernel;
use crate::process::collaborators::PoolAllocation;
use crate::process::thread::{CrossThreadFlags, ThreadState};
use crate::process::{Thread, ThreadCtx};
use log::{debug, warn};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitStage {
    PendingKernel,
    PendingUser,
}

/// The exit callback; carries its own pool memory across both stages
pub(crate) struct ExitApc {
    status: Status,
    stage: ExitStage,
    _allocation: PoolAllocation,
}

impl ExitApc {
    pub(crate) fn new(status: Status, allocation: PoolAllocation) -> Self {
        Self {
            status,
            stage: ExitStage::PendingKernel,
            _allocation: allocation,
        }
    }
}

impl ApcRoutine for ExitApc {
    fn run(mut self: Box<Self>, ctx: &ThreadCtx) {
        let thread = ctx.thread();
        match self.stage {
            ExitStage::PendingKernel => {
                // Already on its way out through another path
                if thread.state() >= ThreadState::ExitRunning {
                    return;
                }
                self.stage = ExitStage::PendingUser;
                let envelope = ApcEnvelope::new(thread.tid(), ProcessorMode::User, self);
                if let Err(rejected) = thread.apc().insert_alerting(envelope) {
                    rejected.rundown();
                }
            }
            ExitStage::PendingUser => ctx.exit(self.status),
        }
    }

    fn rundown(self: Box<Self>) {
        debug!("Exit callback ({:?}, {}) run down", self.stage, self.status);
    }

    fn name(&self) -> &'static str {
        "exit"
    }
}

/// A critical object is being terminated: break into the debugger or halt
pub(crate) fn critical_break(kernel: &Kernel, object: &str, id: u32) {
    if kernel.config().debugger_present {
        warn!(
            "Critical {} {} is being terminated; breaking into the debugger",
            object, id
        );
        return;
    }
    kernel.halt(
        BugCheckCode::CriticalObjectTermination,
        [u64::from(id), u64::from(object == "process"), 0, 0],
    );
}

/// Request that `thread` exit with `status`
///
/// With `direct` set and `thread` being the caller, exits inline and never
/// returns. A target that is already terminating or past rundown makes
/// this a successful no-op.
pub(crate) fn terminate_by_pointer(
    kernel: &Kernel,
    thread: &Arc<Thread>,
    status: Status,
    direct: bool,
) -> KernelResult<()> {
    if thread.has_flag(CrossThreadFlags::BREAK_ON_TERMINATION) {
        critical_break(kernel, "thread", thread.tid());
    }

    if direct {
        if let Some(ctx) = ThreadCtx::current().filter(|ctx| ctx.is(thread)) {
            thread.test_and_set(CrossThreadFlags::TERMINATED);
            ctx.exit(status);
        }
    }

    if thread.is_system() {
        return Err(KernelError::AccessDenied {
            requested: crate::core::types::AccessMask::THREAD_TERMINATE.0,
            granted: 0,
        });
    }

    let stats = kernel.stats();
    stats.inc_termination_requests();

    let pool = kernel.collaborators().pool.clone();
    let allocation = loop {
        match PoolAllocation::allocate(&pool, APC_ENVELOPE_SIZE) {
            Some(allocation) => break allocation,
            None => {
                stats.inc_allocation_retries();
                kernel.delay(kernel.config().short_delay);
            }
        }
    };

    if thread.test_and_set(CrossThreadFlags::TERMINATED) {
        stats.inc_duplicate_terminations();
        debug!("TID {} already terminating", thread.tid());
        return Ok(());
    }
    thread.advance(ThreadState::TerminationRequested);

    let envelope = ApcEnvelope::new(
        thread.tid(),
        ProcessorMode::Kernel,
        Box::new(ExitApc::new(status, allocation)),
    );
    match thread.apc().insert(envelope) {
        Ok(()) => {
            stats.inc_apcs_queued();
            thread.force_resume();
            debug!("Exit callback queued to TID {} ({})", thread.tid(), status);
        }
        Err(rejected) => {
            stats.inc_apcs_rejected();
            rejected.rundown();
        }
    }
    Ok(())
}
