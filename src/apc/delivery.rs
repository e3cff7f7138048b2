/*!
 * Cross-Thread Delivery
 *
 * Run a callback in the context of a target thread: inline when the target
 * is the caller and the callback is kernel-mode, otherwise through the
 * target's queue. A disabled queue means the target is past its rundown
 * point; the envelope is run down and the caller sees `TargetGone`.
 */

use super::envelope::ApcEnvelope;
use crate::core::errors::{KernelError, KernelResult};
use crate::core::types::ProcessorMode;
use crate::process::{Thread, ThreadCtx};
use std::sync::Arc;

/// How a delivered envelope reached its target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Ran synchronously on the caller, which is the target
    Inline,
    /// Waiting on the target's queue
    Queued,
}

/// Deliver `envelope` to `target`
///
/// Successful queuing says nothing about when the callback runs; waiters
/// use the envelope's completion event.
pub fn deliver(target: &Arc<Thread>, envelope: ApcEnvelope) -> KernelResult<Delivery> {
    if envelope.mode() == ProcessorMode::Kernel {
        if let Some(ctx) = ThreadCtx::current().filter(|ctx| ctx.is(target)) {
            let _region = target.apc().enter_critical_region();
            envelope.run(&ctx);
            return Ok(Delivery::Inline);
        }
    }

    match target.apc().insert(envelope) {
        Ok(()) => Ok(Delivery::Queued),
        Err(rejected) => {
            log::debug!(
                "TID {} no longer accepts callbacks, {} run down",
                target.tid(),
                rejected.name()
            );
            rejected.rundown();
            Err(KernelError::thread_gone(target.tid()))
        }
    }
}
