/*!
 * Current Thread Context
 *
 * Every simulated thread runs on its own host thread with its context
 * installed in a thread-local. The body reaches delivery points through it:
 *
 * - `test_alert`: deliver queued kernel-mode callbacks
 * - `return_to_user`: kernel-mode callbacks, then user-mode ones if pending
 * - `alertable_wait`: block until a user-mode callback arrives or time out
 * - `wait_for` / `sleep`: non-alertable waits that still take kernel-mode delivery
 *
 * Host threads with no installed context are kernel-mode callers on
 * behalf of the System process.
 */

use super::context::Context;
use super::ports::{MessagePort, TerminationPort};
use super::{Process, Thread};
use crate::apc::WakeReason;
use crate::core::errors::KernelResult;
use crate::core::limits::TERMINATION_PORT_SIZE;
use crate::core::sync::Event;
use crate::core::types::{Pid, Tid};
use crate::core::Status;
use crate::kernel::Kernel;
use crate::process::lifecycle;
use crate::quota::QuotaKind;
use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

thread_local! {
    static CURRENT: RefCell<Option<ThreadCtx>> = const { RefCell::new(None) };
}

/// Outcome of an alertable wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// At least one user-mode callback ran
    UserApc,
    Timeout,
}

/// Context of a running simulated thread; bound to its host thread
#[derive(Clone)]
pub struct ThreadCtx {
    kernel: Kernel,
    thread: Arc<Thread>,
    process: Arc<Process>,
    _host_bound: PhantomData<*const ()>,
}

/// Clears the installed context when dropped
pub(crate) struct InstalledCtx(());

impl Drop for InstalledCtx {
    fn drop(&mut self) {
        CURRENT.with(|slot| slot.borrow_mut().take());
    }
}

impl ThreadCtx {
    pub(crate) fn new(kernel: Kernel, thread: Arc<Thread>, process: Arc<Process>) -> Self {
        Self {
            kernel,
            thread,
            process,
            _host_bound: PhantomData,
        }
    }

    /// Context of the simulated thread running on this host thread
    pub fn current() -> Option<ThreadCtx> {
        CURRENT.with(|slot| slot.borrow().clone())
    }

    pub(crate) fn install(self) -> InstalledCtx {
        CURRENT.with(|slot| *slot.borrow_mut() = Some(self));
        InstalledCtx(())
    }

    #[inline]
    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    #[inline]
    pub fn thread(&self) -> &Arc<Thread> {
        &self.thread
    }

    #[inline]
    pub fn process(&self) -> &Arc<Process> {
        &self.process
    }

    #[inline]
    pub fn tid(&self) -> Tid {
        self.thread.tid()
    }

    #[inline]
    pub fn pid(&self) -> Pid {
        self.process.pid()
    }

    /// Whether `thread` is the one this context belongs to
    #[inline]
    pub fn is(&self, thread: &Thread) -> bool {
        std::ptr::eq(Arc::as_ptr(&self.thread), thread)
    }

    /// Deliver queued kernel-mode callbacks; returns how many ran
    pub fn test_alert(&self) -> usize {
        let mut delivered = 0;
        while let Some(envelope) = self.thread.apc().next_kernel() {
            self.kernel.stats().inc_apcs_delivered();
            envelope.run(self);
            delivered += 1;
        }
        delivered
    }

    fn deliver_user(&self) -> usize {
        let mut delivered = 0;
        while let Some(envelope) = self.thread.apc().next_user() {
            self.kernel.stats().inc_apcs_delivered();
            envelope.run(self);
            delivered += 1;
        }
        delivered
    }

    /// Transition back to user mode, running whatever is deliverable
    pub fn return_to_user(&self) -> usize {
        let kernel = self.test_alert();
        kernel + self.deliver_user()
    }

    /// Block until a user-mode callback runs or `timeout` elapses
    pub fn alertable_wait(&self, timeout: Option<Duration>) -> WaitStatus {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            match self.thread.apc().wait(true, deadline) {
                WakeReason::KernelApc => {
                    self.test_alert();
                }
                WakeReason::UserApc => {
                    self.test_alert();
                    if self.deliver_user() > 0 {
                        return WaitStatus::UserApc;
                    }
                }
                WakeReason::Resumed => {}
                WakeReason::Timeout => return WaitStatus::Timeout,
            }
        }
    }

    /// Non-alertable sleep; kernel-mode callbacks still run
    pub fn sleep(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        loop {
            match self.thread.apc().wait(false, Some(deadline)) {
                WakeReason::KernelApc => {
                    self.test_alert();
                }
                WakeReason::Timeout => return,
                WakeReason::UserApc | WakeReason::Resumed => {}
            }
        }
    }

    /// Non-alertable wait on `event`; returns false on timeout
    ///
    /// Polls so kernel-mode callbacks queued meanwhile are delivered.
    pub fn wait_for(&self, event: &Event, timeout: Option<Duration>) -> bool {
        let poll = self.kernel.config().wait_poll_interval;
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return event.is_set();
                    }
                    poll.min(deadline - now)
                }
                None => poll,
            };
            if event.wait(Some(slice)) {
                return true;
            }
            self.test_alert();
        }
    }

    /// Exit the current thread; never returns
    pub fn exit(&self, status: Status) -> ! {
        lifecycle::exit_thread(self, status)
    }

    /// Register a port notified when this thread dies
    ///
    /// The registration is charged to the process's paged quota.
    pub fn register_termination_port(&self, port: Arc<dyn MessagePort>) -> KernelResult<()> {
        self.kernel
            .quota()
            .charge_process(self.process.quota(), QuotaKind::Paged, TERMINATION_PORT_SIZE)?;
        self.thread.push_termination_port(TerminationPort { port });
        Ok(())
    }

    /// Own saved register state
    pub fn registers(&self) -> Context {
        self.thread.trap_frame()
    }

    /// Update own saved register state, as user code running would
    pub fn update_registers(&self, f: impl FnOnce(&mut Context)) {
        self.thread.with_trap_frame(f);
    }
}

impl std::fmt::Debug for ThreadCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadCtx")
            .field("pid", &self.pid())
            .field("tid", &self.tid())
            .finish()
    }
}
