/*!
 * Delivery Envelope
 *
 * A callback addressed to one thread, tagged with the mode it is delivered
 * in. The requester may wait on the completion event; it is signaled
 * whether the callback ran, was run down because the target died first,
 * or was dropped during an unwind.
 */

use crate::core::sync::Event;
use crate::core::types::{ProcessorMode, Tid};
use crate::process::collaborators::PoolAllocation;
use crate::process::ThreadCtx;
use crate::quota::ProcessCharge;
use std::fmt;
use std::sync::Arc;

/// Callback run in the context of the target thread
pub trait ApcRoutine: Send {
    /// Run on the target thread at a delivery point
    fn run(self: Box<Self>, ctx: &ThreadCtx);

    /// Discard without running; the target will never reach a delivery point
    fn rundown(self: Box<Self>) {}

    fn name(&self) -> &'static str;
}

/// Signals on drop, so every way an envelope ends releases its waiter
struct CompletionSignal(Option<Arc<Event>>);

impl Drop for CompletionSignal {
    fn drop(&mut self) {
        if let Some(event) = self.0.take() {
            event.set();
        }
    }
}

pub struct ApcEnvelope {
    target: Tid,
    mode: ProcessorMode,
    routine: Box<dyn ApcRoutine>,
    completion: CompletionSignal,
    allocation: Option<PoolAllocation>,
    charge: Option<ProcessCharge>,
}

impl ApcEnvelope {
    pub fn new(target: Tid, mode: ProcessorMode, routine: Box<dyn ApcRoutine>) -> Self {
        Self {
            target,
            mode,
            routine,
            completion: CompletionSignal(None),
            allocation: None,
            charge: None,
        }
    }

    #[inline]
    #[must_use]
    pub fn with_completion(mut self, event: Arc<Event>) -> Self {
        self.completion = CompletionSignal(Some(event));
        self
    }

    /// Pool memory backing the envelope; freed with it
    #[inline]
    #[must_use]
    pub fn with_allocation(mut self, allocation: PoolAllocation) -> Self {
        self.allocation = Some(allocation);
        self
    }

    /// Quota charged for the envelope; returned with it
    #[inline]
    #[must_use]
    pub fn with_charge(mut self, charge: ProcessCharge) -> Self {
        self.charge = Some(charge);
        self
    }

    #[inline]
    pub fn target(&self) -> Tid {
        self.target
    }

    #[inline]
    pub fn mode(&self) -> ProcessorMode {
        self.mode
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.routine.name()
    }

    /// Run on the target thread; may not return if the callback exits the thread
    pub fn run(self, ctx: &ThreadCtx) {
        let ApcEnvelope {
            routine,
            completion,
            allocation,
            charge,
            ..
        } = self;
        routine.run(ctx);
        drop(allocation);
        drop(charge);
        drop(completion);
    }

    /// Discard without running
    pub fn rundown(self) {
        log::trace!("Callback {} for TID {} run down", self.name(), self.target);
        let ApcEnvelope {
            routine,
            completion,
            ..
        } = self;
        routine.rundown();
        drop(completion);
    }
}

impl fmt::Debug for ApcEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApcEnvelope")
            .field("target", &self.target)
            .field("mode", &self.mode)
            .field("routine", &self.routine.name())
            .finish()
    }
}
