/*!
 * Thread Startup
 *
 * Each simulated thread runs on its own host thread through a trampoline:
 * wait to be released by the creator, install the thread context, run the
 * body, then exit. The exit routine unwinds back here with a private
 * payload; a bug check unwinds with its own and is recorded on the kernel.
 */

use crate::core::bugcheck::as_bugcheck;
use crate::core::Status;
use crate::kernel::Kernel;
use crate::process::thread::{CrossThreadFlags, ThreadState};
use crate::process::{Process, Thread, ThreadCtx};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::error;

/// Code a simulated thread runs
pub type ThreadBody = Box<dyn FnOnce(&ThreadCtx) + Send + 'static>;

/// Unwind payload of a thread that finished its exit path
pub(crate) struct ThreadExited;

pub(crate) fn spawn_host(
    kernel: &Kernel,
    thread: &Arc<Thread>,
    process: &Arc<Process>,
    body: ThreadBody,
) -> std::io::Result<JoinHandle<()>> {
    let kernel = kernel.clone();
    let thread = Arc::clone(thread);
    let process = Arc::clone(process);
    std::thread::Builder::new()
        .name(format!("kthread-{}-{}", process.pid(), thread.tid()))
        .spawn(move || trampoline(kernel, thread, process, body))
}

fn trampoline(kernel: Kernel, thread: Arc<Thread>, process: Arc<Process>, body: ThreadBody) {
    thread.wait_host_ready();
    let ctx = ThreadCtx::new(kernel, thread, process);
    let _installed = ctx.clone().install();

    let outcome = catch_unwind(AssertUnwindSafe(|| run(&ctx, body)));
    if let Err(payload) = outcome {
        absorb(&ctx, payload);
    }
}

fn run(ctx: &ThreadCtx, body: ThreadBody) {
    let thread = ctx.thread();

    // Kernel callbacks still run while the thread sits suspended
    ctx.wait_for(thread.resume_gate(), None);
    thread.advance(ThreadState::Running);

    if thread.is_terminating() {
        thread.test_and_set(CrossThreadFlags::DEAD_ON_ARRIVAL);
        ctx.exit(Status::THREAD_IS_TERMINATING);
    }

    ctx.test_alert();
    thread.mark_ran_body();
    body(ctx);

    ctx.return_to_user();
    ctx.exit(Status::SUCCESS);
}

/// Settle whatever unwound out of the thread
fn absorb(ctx: &ThreadCtx, payload: Box<dyn Any + Send>) {
    if payload.is::<ThreadExited>() {
        return;
    }
    if let Some(check) = as_bugcheck(payload.as_ref()) {
        ctx.kernel().record_halt(check);
        return;
    }

    let thread = ctx.thread();
    if thread.state() >= ThreadState::ExitRunning {
        error!(
            tid = thread.tid(),
            "thread panicked inside its exit path; teardown abandoned"
        );
        return;
    }

    error!(tid = thread.tid(), "unhandled exception in thread body");
    let retry = catch_unwind(AssertUnwindSafe(|| {
        ctx.exit(Status::UNHANDLED_EXCEPTION);
    }));
    if let Err(payload) = retry {
        absorb(ctx, payload);
    }
}
