/*!
 * Status Codes
 * 32-bit completion codes returned by every kernel entry point
 */

use serde::{Deserialize, Serialize};
use std::fmt;

/// Completion code of a kernel operation
///
/// The top two bits carry the severity: `00` success, `01` informational,
/// `10` warning, `11` error.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Status(pub u32);

impl Status {
    pub const SUCCESS: Status = Status(0x0000_0000);
    pub const PENDING: Status = Status(0x0000_0103);
    pub const NOTHING_TO_TERMINATE: Status = Status(0x0000_0122);

    pub const DBG_TERMINATE_THREAD: Status = Status(0x4001_0003);
    pub const DBG_TERMINATE_PROCESS: Status = Status(0x4001_0004);
    pub const DBG_CONTROL_C: Status = Status(0x4001_0005);
    pub const DBG_CONTROL_BREAK: Status = Status(0x4001_0008);

    pub const GUARD_PAGE_VIOLATION: Status = Status(0x8000_0001);
    pub const DATATYPE_MISALIGNMENT: Status = Status(0x8000_0002);
    pub const BREAKPOINT: Status = Status(0x8000_0003);
    pub const SINGLE_STEP: Status = Status(0x8000_0004);

    pub const UNSUCCESSFUL: Status = Status(0xC000_0001);
    pub const ACCESS_VIOLATION: Status = Status(0xC000_0005);
    pub const IN_PAGE_ERROR: Status = Status(0xC000_0006);
    pub const INVALID_HANDLE: Status = Status(0xC000_0008);
    pub const INVALID_PARAMETER: Status = Status(0xC000_000D);
    pub const NO_MEMORY: Status = Status(0xC000_0017);
    pub const ILLEGAL_INSTRUCTION: Status = Status(0xC000_001D);
    pub const NONCONTINUABLE_EXCEPTION: Status = Status(0xC000_0025);
    pub const INVALID_DISPOSITION: Status = Status(0xC000_0026);
    pub const ACCESS_DENIED: Status = Status(0xC000_0022);
    pub const BUFFER_TOO_SMALL: Status = Status(0xC000_0023);
    pub const OBJECT_TYPE_MISMATCH: Status = Status(0xC000_0024);
    pub const INVALID_CID: Status = Status(0xC000_000B);
    pub const QUOTA_EXCEEDED: Status = Status(0xC000_0044);
    pub const THREAD_IS_TERMINATING: Status = Status(0xC000_004B);
    pub const ARRAY_BOUNDS_EXCEEDED: Status = Status(0xC000_008C);
    pub const FLOAT_DENORMAL_OPERAND: Status = Status(0xC000_008D);
    pub const FLOAT_DIVIDE_BY_ZERO: Status = Status(0xC000_008E);
    pub const FLOAT_INEXACT_RESULT: Status = Status(0xC000_008F);
    pub const FLOAT_INVALID_OPERATION: Status = Status(0xC000_0090);
    pub const FLOAT_OVERFLOW: Status = Status(0xC000_0091);
    pub const FLOAT_STACK_CHECK: Status = Status(0xC000_0092);
    pub const FLOAT_UNDERFLOW: Status = Status(0xC000_0093);
    pub const INTEGER_DIVIDE_BY_ZERO: Status = Status(0xC000_0094);
    pub const INTEGER_OVERFLOW: Status = Status(0xC000_0095);
    pub const PRIVILEGED_INSTRUCTION: Status = Status(0xC000_0096);
    pub const INSUFFICIENT_RESOURCES: Status = Status(0xC000_009A);
    pub const CANT_TERMINATE_SELF: Status = Status(0xC000_00DB);
    pub const PROCESS_IS_TERMINATING: Status = Status(0xC000_010A);
    pub const PAGEFILE_QUOTA_EXCEEDED: Status = Status(0xC000_012C);
    pub const CONTROL_C_EXIT: Status = Status(0xC000_013A);
    pub const UNHANDLED_EXCEPTION: Status = Status(0xC000_0144);
    pub const STACK_OVERFLOW: Status = Status(0xC000_00FD);
    pub const SYSTEM_SHUTDOWN: Status = Status(0xC000_02EB);
    pub const FLOAT_MULTIPLE_FAULTS: Status = Status(0xC000_02B4);
    pub const FLOAT_MULTIPLE_TRAPS: Status = Status(0xC000_02B5);
    pub const REG_NAT_CONSUMPTION: Status = Status(0xC000_02C9);
    pub const PORT_DISCONNECTED: Status = Status(0xC000_0037);

    #[inline]
    pub const fn code(self) -> u32 {
        self.0
    }

    /// Success and informational codes
    #[inline]
    pub const fn is_success(self) -> bool {
        self.0 >> 30 <= 1
    }

    #[inline]
    pub const fn is_error(self) -> bool {
        self.0 >> 30 == 3
    }

    /// Symbolic name, when the code is one this crate produces
    pub fn name(self) -> Option<&'static str> {
        let name = match self {
            Status::SUCCESS => "STATUS_SUCCESS",
            Status::PENDING => "STATUS_PENDING",
            Status::NOTHING_TO_TERMINATE => "STATUS_NOTHING_TO_TERMINATE",
            Status::DBG_TERMINATE_PROCESS => "DBG_TERMINATE_PROCESS",
            Status::DBG_TERMINATE_THREAD => "DBG_TERMINATE_THREAD",
            Status::ACCESS_VIOLATION => "STATUS_ACCESS_VIOLATION",
            Status::ACCESS_DENIED => "STATUS_ACCESS_DENIED",
            Status::INVALID_HANDLE => "STATUS_INVALID_HANDLE",
            Status::INVALID_PARAMETER => "STATUS_INVALID_PARAMETER",
            Status::QUOTA_EXCEEDED => "STATUS_QUOTA_EXCEEDED",
            Status::PAGEFILE_QUOTA_EXCEEDED => "STATUS_PAGEFILE_QUOTA_EXCEEDED",
            Status::THREAD_IS_TERMINATING => "STATUS_THREAD_IS_TERMINATING",
            Status::PROCESS_IS_TERMINATING => "STATUS_PROCESS_IS_TERMINATING",
            Status::INSUFFICIENT_RESOURCES => "STATUS_INSUFFICIENT_RESOURCES",
            Status::CANT_TERMINATE_SELF => "STATUS_CANT_TERMINATE_SELF",
            Status::SYSTEM_SHUTDOWN => "STATUS_SYSTEM_SHUTDOWN",
            Status::UNHANDLED_EXCEPTION => "STATUS_UNHANDLED_EXCEPTION",
            Status::UNSUCCESSFUL => "STATUS_UNSUCCESSFUL",
            Status::BUFFER_TOO_SMALL => "STATUS_BUFFER_TOO_SMALL",
            _ => return None,
        };
        Some(name)
    }
}

impl Default for Status {
    fn default() -> Self {
        Status::SUCCESS
    }
}

impl From<u32> for Status {
    fn from(code: u32) -> Self {
        Status(code)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} (0x{:08X})", name, self.0),
            None => write!(f, "0x{:08X}", self.0),
        }
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
