/*!
 * Bug Checks
 *
 * Invariant violations halt the system. A bug check logs the stop code and
 * unwinds with a `BugCheck` payload; the thread trampoline records it on the
 * kernel so the halt is observable.
 */

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stop codes raised by the lifecycle core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum BugCheckCode {
    /// Kernel callbacks still queued, or delivery disabled, at thread teardown
    KernelApcPendingDuringExit = 0x20,
    /// A quota return would take usage below zero
    QuotaUnderflow = 0x21,
    /// A critical thread or process was terminated without a debugger
    CriticalObjectTermination = 0xF4,
    /// The last thread of a critical process exited
    CriticalProcessDied = 0xEF,
}

/// Payload carried by a bug check unwind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BugCheck {
    pub code: BugCheckCode,
    pub parameters: [u64; 4],
}

impl fmt::Display for BugCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "*** STOP 0x{:08X} {:?} (0x{:X}, 0x{:X}, 0x{:X}, 0x{:X})",
            self.code as u32,
            self.code,
            self.parameters[0],
            self.parameters[1],
            self.parameters[2],
            self.parameters[3]
        )
    }
}

/// Halt on an invariant violation
#[cold]
pub fn bugcheck(code: BugCheckCode, parameters: [u64; 4]) -> ! {
    let check = BugCheck { code, parameters };
    tracing::error!(stop_code = code as u32, "{}", check);
    std::panic::panic_any(check)
}

/// Recover the bug check from a caught unwind payload
pub fn as_bugcheck(payload: &(dyn std::any::Any + Send)) -> Option<&BugCheck> {
    payload.downcast_ref::<BugCheck>()
}
