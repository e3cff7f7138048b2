/*!
 * Core Types
 * Common types used across the kernel
 */

use serde::{Deserialize, Serialize};
use smartstring::alias::String as SmartString;
use std::fmt;

pub use super::errors::KernelResult;

/// Process ID type
pub type Pid = u32;

/// Thread ID type
pub type Tid = u32;

/// Pid of the System process that owns every kernel-only thread
pub const SYSTEM_PID: Pid = 4;

/// Mode a request originates from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessorMode {
    Kernel,
    User,
}

/// Whether a thread ever runs user-mode code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadKind {
    User,
    /// Kernel-only thread with no user-mode presence
    System,
}

/// Handle value in a process handle table
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Handle(pub u32);

impl Handle {
    pub const NULL: Handle = Handle(0);
    /// Pseudo handle that always names the calling process
    pub const CURRENT_PROCESS: Handle = Handle(u32::MAX);
    /// Pseudo handle that always names the calling thread
    pub const CURRENT_THREAD: Handle = Handle(u32::MAX - 1);

    #[inline]
    pub const fn value(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn is_pseudo(self) -> bool {
        self.0 >= u32::MAX - 1
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Handle::CURRENT_PROCESS => write!(f, "Handle(current process)"),
            Handle::CURRENT_THREAD => write!(f, "Handle(current thread)"),
            Handle(v) => write!(f, "Handle(0x{:X})", v),
        }
    }
}

/// Access rights recorded in a handle table entry
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct AccessMask(pub u32);

impl AccessMask {
    pub const PROCESS_TERMINATE: AccessMask = AccessMask(0x0001);
    pub const PROCESS_SET_QUOTA: AccessMask = AccessMask(0x0100);
    pub const PROCESS_QUERY_INFORMATION: AccessMask = AccessMask(0x0400);
    pub const PROCESS_ALL_ACCESS: AccessMask = AccessMask(0x001F_FFFF);

    pub const THREAD_TERMINATE: AccessMask = AccessMask(0x0001);
    pub const THREAD_GET_CONTEXT: AccessMask = AccessMask(0x0008);
    pub const THREAD_SET_CONTEXT: AccessMask = AccessMask(0x0010);
    pub const THREAD_QUERY_INFORMATION: AccessMask = AccessMask(0x0040);
    pub const THREAD_ALL_ACCESS: AccessMask = AccessMask(0x001F_FFFF);

    #[inline]
    pub const fn contains(self, other: AccessMask) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub const fn union(self, other: AccessMask) -> AccessMask {
        AccessMask(self.0 | other.0)
    }
}

impl fmt::Debug for AccessMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccessMask(0x{:08X})", self.0)
    }
}

/// Image file name, truncated to the 15 bytes a process record keeps
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct ImageName {
    inner: SmartString,
}

impl ImageName {
    pub const MAX_LEN: usize = 15;

    pub fn new(name: &str) -> Self {
        let mut end = name.len().min(Self::MAX_LEN);
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        Self {
            inner: SmartString::from(&name[..end]),
        }
    }

    #[inline(always)]
    pub fn as_str(&self) -> &str {
        self.inner.as_str()
    }
}

impl From<&str> for ImageName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl fmt::Display for ImageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for ImageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}
