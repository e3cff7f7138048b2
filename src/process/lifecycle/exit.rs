/*!
 * Thread Exit
 *
 * The exit routine runs on the exiting thread itself and never returns.
 *
 * # Ordering
 *
 * 1. Drain external accessors, then run notify callouts and subsystem rundown
 * 2. Decrement the active-thread count under the process lock; the thread
 *    that takes it to zero is the last thread and waits for its siblings
 * 3. Debugger and termination/exception port notification
 * 4. TEB teardown and the thread's exit status
 * 5. Last thread only: process rundown
 * 6. Disable and flush the delivery queues
 * 7. Last thread only: address space, quota release and the process signal
 * 8. Signal the thread and hand it to the reaper
 *
 * Anything still in the kernel-mode queue after step 6 is a lost-isolation
 * bug and halts the system.
 */

use super::startup::ThreadExited;
use super::termination::critical_break;
use crate::core::bugcheck::BugCheckCode;
use crate::core::limits::TERMINATION_PORT_SIZE;
use crate::core::types::ProcessorMode;
use crate::core::Status;
use crate::kernel::Kernel;
use crate::process::object::ProcessFlags;
use crate::process::ports::{MessagePort, PortMessage, SecurityPort};
use crate::process::thread::{CrossThreadFlags, ThreadState};
use crate::process::{Process, Thread, ThreadCtx};
use crate::quota::QuotaKind;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info, info_span, warn};

/// Run the exit path for the current thread
pub(crate) fn exit_thread(ctx: &ThreadCtx, status: Status) -> ! {
    let kernel = ctx.kernel();
    let thread = ctx.thread();
    let process = ctx.process();
    let span = info_span!(
        "thread_exit",
        pid = process.pid(),
        tid = thread.tid(),
        status = %status
    );
    let entered = span.enter();

    let disable = thread.apc().kernel_apc_disable();
    if disable != 0 {
        kernel.halt(
            BugCheckCode::KernelApcPendingDuringExit,
            [u64::from(thread.tid()), u64::from(disable), 0, 1],
        );
    }

    thread.advance(ThreadState::ExitRunning);
    thread.test_and_set(CrossThreadFlags::TERMINATED);
    let dead_on_arrival = thread.has_flag(CrossThreadFlags::DEAD_ON_ARRIVAL);

    thread.rundown().wait_for_release();

    kernel.notify().thread_exited(process.pid(), thread.tid(), status);
    let result = kernel.rundown_orchestrator().rundown_thread(thread.tid());
    if result.stats.items_cancelled > 0 || !result.errors.is_empty() {
        debug!(
            cancelled = result.stats.items_cancelled,
            errors = result.errors.len(),
            "subsystem rundown finished"
        );
    }

    let last = account_exit(ctx, status);

    if !thread.is_system() && !thread.has_flag(CrossThreadFlags::HIDE_FROM_DEBUGGER) {
        if let Some(port) = process.debug_port() {
            let message = if last {
                PortMessage::ProcessExited {
                    pid: process.pid(),
                    status: process.exit_status(),
                }
            } else {
                PortMessage::ThreadExited {
                    pid: process.pid(),
                    tid: thread.tid(),
                    status,
                }
            };
            if let Err(e) = port.send(message) {
                debug!("debug port notification dropped: {}", e);
            }
        }
    }

    if thread.has_flag(CrossThreadFlags::BREAK_ON_TERMINATION) {
        critical_break(kernel, "thread", thread.tid());
    }
    if last && process.has_flag(ProcessFlags::BREAK_ON_TERMINATION) {
        if kernel.config().debugger_present {
            warn!("Critical process {} exited", process.pid());
        } else {
            kernel.halt(
                BugCheckCode::CriticalProcessDied,
                [u64::from(process.pid()), u64::from(status.code()), 0, 0],
            );
        }
    }

    thread.advance(ThreadState::ThreadRundown);
    notify_ports(kernel, thread, process, status, dead_on_arrival);
    teardown_teb(thread, process, dead_on_arrival);
    thread.set_exit_status(status);

    if last {
        thread.advance(ThreadState::ProcessRundown);
        rundown_process(kernel, process);
    }

    // Kernel callbacks that made it in before the queue closed still run
    thread.apc().disable_queuing();
    ctx.test_alert();
    for envelope in thread.apc().flush(ProcessorMode::User) {
        envelope.rundown();
    }

    if last {
        process.rundown().wait_for_release();
        kernel.collaborators().address_spaces.clean(process.pid());
        let stacks = process.release_user_stacks();
        if stacks > 0 {
            debug!(stacks, "orphaned user stacks released with the address space");
        }
        kernel.quota().detach(process.quota());
    }

    let leftover = thread.apc().flush(ProcessorMode::Kernel);
    if !leftover.is_empty() {
        kernel.halt(
            BugCheckCode::KernelApcPendingDuringExit,
            [u64::from(thread.tid()), leftover.len() as u64, 0, 0],
        );
    }

    if last {
        process.write().exit_time = Some(SystemTime::now());
        process.exited().set();
        kernel.stats().inc_processes_exited();
        info!(
            "Process {} ({}) exited with {}",
            process.pid(),
            process.image_name(),
            process.exit_status()
        );
    }

    thread.advance(ThreadState::Terminated);
    thread.exited().set();
    kernel.stats().inc_threads_exited();
    kernel.reaper().enqueue(Arc::clone(thread));

    drop(entered);
    std::panic::resume_unwind(Box::new(ThreadExited))
}

/// Drop the active-thread count and settle the exit status
///
/// Returns whether this thread is the last one. The last thread does not
/// return until every sibling has signaled its own teardown.
fn account_exit(ctx: &ThreadCtx, status: Status) -> bool {
    let thread = ctx.thread();
    let process = ctx.process();

    let mut inner = process.write();
    inner.active_threads = inner.active_threads.saturating_sub(1);
    if inner.active_threads != 0 {
        if status != Status::THREAD_IS_TERMINATING {
            inner.last_thread_exit_status = status;
        }
        return false;
    }

    process.test_and_set(ProcessFlags::DELETE);
    if status == Status::THREAD_IS_TERMINATING {
        if inner.exit_status == Status::PENDING {
            inner.exit_status = inner.last_thread_exit_status;
        }
    } else {
        inner.exit_status = status;
    }

    loop {
        let pending = inner
            .threads
            .iter()
            .find(|t| !Arc::ptr_eq(t, thread) && !t.exited().is_set())
            .cloned();
        let Some(sibling) = pending else {
            break;
        };
        drop(inner);
        debug!(sibling = sibling.tid(), "last thread waiting for sibling teardown");
        ctx.wait_for(sibling.exited(), None);
        inner = process.write();
    }
    true
}

fn send_with_retry(kernel: &Kernel, port: &dyn MessagePort, message: PortMessage) {
    loop {
        match port.send(message.clone()) {
            Ok(()) => return,
            Err(e) if e.is_transient() => {
                kernel.stats().inc_port_retries();
                kernel.delay(kernel.config().short_delay);
            }
            Err(e) => {
                debug!("port notification dropped: {}", e);
                return;
            }
        }
    }
}

fn notify_ports(
    kernel: &Kernel,
    thread: &Arc<Thread>,
    process: &Arc<Process>,
    status: Status,
    dead_on_arrival: bool,
) {
    let message = PortMessage::ClientDied {
        pid: process.pid(),
        tid: thread.tid(),
        create_time: thread.create_time(),
    };

    let ports = thread.take_termination_ports();
    if ports.is_empty() {
        if !dead_on_arrival || status == Status::THREAD_IS_TERMINATING {
            if let Some(port) = process.exception_port() {
                send_with_retry(kernel, port.as_ref(), message);
            }
        }
        return;
    }

    for registration in ports {
        send_with_retry(kernel, registration.port.as_ref(), message.clone());
        kernel
            .quota()
            .return_process(process.quota(), QuotaKind::Paged, TERMINATION_PORT_SIZE);
    }
}

fn teardown_teb(thread: &Thread, process: &Process, dead_on_arrival: bool) {
    let Some(teb) = thread.take_teb() else {
        return;
    };
    if let Some(handle) = teb.debugger_handle {
        if process.handles().close(handle).is_err() {
            debug!("debugger handle {:?} already closed", handle);
        }
    }
    if let Some(stack) = teb.user_stack {
        if teb.free_stack_on_exit && !dead_on_arrival {
            drop(stack);
        } else {
            process.park_user_stack(stack);
        }
    }
}

/// Process-wide teardown run by the last thread
fn rundown_process(kernel: &Kernel, process: &Arc<Process>) {
    process.test_and_set(ProcessFlags::EXITING);
    let status = process.exit_status();

    kernel.notify().process_exited(process.pid(), status);

    if let SecurityPort::Connected(_) = process.close_security_port() {
        debug!("security port of PID {} closed", process.pid());
    }
    kernel.collaborators().audit.process_exit(process.pid(), status);

    if let Some(job) = process.job() {
        if !process.test_and_set(ProcessFlags::EXIT_REPORTED) {
            job.report_exit(process.pid(), status);
        }
        job.fold_exit(process, status);
    }

    process.handles().kill();
}
