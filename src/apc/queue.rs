/*!
 * Per-Thread Delivery Queues
 *
 * Two FIFO queues, one per delivery mode, plus the thread's wait state.
 *
 * # Delivery rules
 *
 * - Kernel-mode envelopes run at the thread's next delivery point unless
 *   it is inside a critical region
 * - User-mode envelopes run only on return to user mode or during an
 *   alertable wait, and only once `user_apc_pending` is raised
 * - Once queuing is disabled every insert fails and the caller runs the
 *   envelope down
 */

use super::envelope::ApcEnvelope;
use crate::core::types::ProcessorMode;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

/// Why a wait on the thread's queue state ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    KernelApc,
    UserApc,
    Timeout,
    /// Forced resume with nothing deliverable
    Resumed,
}

#[derive(Debug)]
struct ApcQueues {
    kernel: VecDeque<ApcEnvelope>,
    user: VecDeque<ApcEnvelope>,
    queueable: bool,
    user_apc_pending: bool,
    alertable_wait: bool,
    resume_requested: bool,
}

/// Delivery state of one thread
#[derive(Debug)]
pub struct ApcState {
    queues: Mutex<ApcQueues>,
    wake: Condvar,
    /// Critical-region depth; kernel-mode delivery is held off while non-zero
    kernel_disable: AtomicU32,
}

impl Default for ApcState {
    fn default() -> Self {
        Self::new()
    }
}

impl ApcState {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(ApcQueues {
                kernel: VecDeque::new(),
                user: VecDeque::new(),
                queueable: true,
                user_apc_pending: false,
                alertable_wait: false,
                resume_requested: false,
            }),
            wake: Condvar::new(),
            kernel_disable: AtomicU32::new(0),
        }
    }

    /// Queue `envelope` on the queue of its mode
    ///
    /// Hands the envelope back when queuing is disabled.
    pub fn insert(&self, envelope: ApcEnvelope) -> Result<(), ApcEnvelope> {
        self.insert_inner(envelope, false)
    }

    /// Queue a user-mode envelope and mark user delivery pending at once
    pub fn insert_alerting(&self, envelope: ApcEnvelope) -> Result<(), ApcEnvelope> {
        self.insert_inner(envelope, true)
    }

    fn insert_inner(&self, envelope: ApcEnvelope, alert: bool) -> Result<(), ApcEnvelope> {
        let mut queues = self.queues.lock();
        if !queues.queueable {
            return Err(envelope);
        }
        match envelope.mode() {
            ProcessorMode::Kernel => {
                queues.kernel.push_back(envelope);
                self.wake.notify_all();
            }
            ProcessorMode::User => {
                queues.user.push_back(envelope);
                if alert || queues.alertable_wait {
                    queues.user_apc_pending = true;
                    self.wake.notify_all();
                }
            }
        }
        Ok(())
    }

    /// Stop accepting envelopes; returns false if already disabled
    pub fn disable_queuing(&self) -> bool {
        let mut queues = self.queues.lock();
        std::mem::replace(&mut queues.queueable, false)
    }

    #[inline]
    pub fn is_queueable(&self) -> bool {
        self.queues.lock().queueable
    }

    pub fn pending(&self, mode: ProcessorMode) -> usize {
        let queues = self.queues.lock();
        match mode {
            ProcessorMode::Kernel => queues.kernel.len(),
            ProcessorMode::User => queues.user.len(),
        }
    }

    #[inline]
    pub fn user_apc_pending(&self) -> bool {
        self.queues.lock().user_apc_pending
    }

    /// Take every queued envelope of `mode`
    pub fn flush(&self, mode: ProcessorMode) -> Vec<ApcEnvelope> {
        let mut queues = self.queues.lock();
        match mode {
            ProcessorMode::Kernel => queues.kernel.drain(..).collect(),
            ProcessorMode::User => {
                queues.user_apc_pending = false;
                queues.user.drain(..).collect()
            }
        }
    }

    /// Next kernel-mode envelope, unless delivery is held off
    pub(crate) fn next_kernel(&self) -> Option<ApcEnvelope> {
        if self.kernel_disable.load(Ordering::Acquire) > 0 {
            return None;
        }
        self.queues.lock().kernel.pop_front()
    }

    /// Next user-mode envelope when user delivery is pending
    pub(crate) fn next_user(&self) -> Option<ApcEnvelope> {
        let mut queues = self.queues.lock();
        if !queues.user_apc_pending {
            return None;
        }
        let next = queues.user.pop_front();
        if queues.user.is_empty() {
            queues.user_apc_pending = false;
        }
        next
    }

    /// Hold off kernel-mode delivery until the returned guard drops
    pub fn enter_critical_region(&self) -> CriticalRegion<'_> {
        self.kernel_disable.fetch_add(1, Ordering::AcqRel);
        CriticalRegion { state: self }
    }

    #[inline]
    pub fn kernel_apc_disable(&self) -> u32 {
        self.kernel_disable.load(Ordering::Acquire)
    }

    /// Wake the thread out of any wait it is in
    pub fn force_resume(&self) {
        let mut queues = self.queues.lock();
        queues.resume_requested = true;
        self.wake.notify_all();
    }

    /// Block until something is deliverable, a forced resume, or `deadline`
    ///
    /// An alertable wait raises `user_apc_pending` if user envelopes are
    /// already queued, and lets later user inserts wake it.
    pub(crate) fn wait(&self, alertable: bool, deadline: Option<Instant>) -> WakeReason {
        let mut queues = self.queues.lock();
        queues.alertable_wait = alertable;
        if alertable && !queues.user.is_empty() {
            queues.user_apc_pending = true;
        }

        let reason = loop {
            if !queues.kernel.is_empty() && self.kernel_disable.load(Ordering::Acquire) == 0 {
                break WakeReason::KernelApc;
            }
            if alertable && queues.user_apc_pending {
                break WakeReason::UserApc;
            }
            if std::mem::take(&mut queues.resume_requested) {
                break WakeReason::Resumed;
            }
            match deadline {
                Some(deadline) => {
                    if self.wake.wait_until(&mut queues, deadline).timed_out() {
                        break WakeReason::Timeout;
                    }
                }
                None => self.wake.wait(&mut queues),
            }
        };

        queues.alertable_wait = false;
        reason
    }
}

/// Guard for a critical region
#[must_use = "the region ends when the guard drops"]
pub struct CriticalRegion<'a> {
    state: &'a ApcState,
}

impl Drop for CriticalRegion<'_> {
    fn drop(&mut self) {
        self.state.kernel_disable.fetch_sub(1, Ordering::AcqRel);
    }
}
