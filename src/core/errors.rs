/*!
 * Error Types
 * Centralized error handling with thiserror and miette, mapped onto status codes
 */

use super::status::Status;
use super::types::{Pid, Tid};
use crate::quota::QuotaKind;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which kind of object went away underneath a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Process,
    Thread,
}

/// Kernel errors with serialization support
#[derive(Error, Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Diagnostic)]
#[serde(tag = "error_type", content = "details", rename_all = "snake_case")]
pub enum KernelError {
    #[error("Access denied: requested 0x{requested:08X}, granted 0x{granted:08X}")]
    #[diagnostic(
        code(kernel::access_denied),
        help("Open the object with the access the operation needs.")
    )]
    AccessDenied { requested: u32, granted: u32 },

    #[error("Invalid handle 0x{0:X}")]
    #[diagnostic(
        code(kernel::invalid_handle),
        help("The handle was closed, never existed, or names an object of another type.")
    )]
    InvalidHandle(u32),

    #[error("Invalid client id {0}")]
    #[diagnostic(
        code(kernel::invalid_cid),
        help("The process or thread id does not name a live object.")
    )]
    InvalidCid(u32),

    #[error("Invalid parameter: {0}")]
    #[diagnostic(code(kernel::invalid_parameter))]
    InvalidParameter(String),

    #[error("{object:?} {id} is already terminating")]
    #[diagnostic(
        code(kernel::target_gone),
        help("The target progressed past the point where this request is meaningful.")
    )]
    TargetGone { object: ObjectKind, id: u32 },

    #[error("{kind:?} quota exceeded")]
    #[diagnostic(
        code(kernel::quota_exceeded),
        help("Return unused quota or raise the quota block limits.")
    )]
    QuotaExceeded { kind: QuotaKind },

    #[error("Insufficient resources: {0}")]
    #[diagnostic(
        code(kernel::insufficient_resources),
        help("The pool is exhausted. Retry once memory pressure drops.")
    )]
    InsufficientResources(String),

    #[error("Thread {0} is the last thread of its process")]
    #[diagnostic(
        code(kernel::cant_terminate_self),
        help("Terminate the process instead of its last thread.")
    )]
    CantTerminateSelf(Tid),

    #[error("Process {0} is terminating")]
    #[diagnostic(code(kernel::process_is_terminating))]
    ProcessIsTerminating(Pid),

    #[error("Caller buffer rejected: {reason}")]
    #[diagnostic(
        code(kernel::buffer_validation),
        help("Caller-supplied buffers must have the exact record size.")
    )]
    BufferValidation { reason: String },

    #[error("Wait timed out")]
    #[diagnostic(code(kernel::timeout))]
    Timeout,

    #[error("Configuration error: {0}")]
    #[diagnostic(code(kernel::config))]
    Config(String),

    #[error("Operation unsuccessful: {0}")]
    #[diagnostic(code(kernel::unsuccessful))]
    Unsuccessful(String),
}

impl KernelError {
    /// Status code reported to the caller for this error
    pub fn status(&self) -> Status {
        match self {
            KernelError::AccessDenied { .. } => Status::ACCESS_DENIED,
            KernelError::InvalidHandle(_) => Status::INVALID_HANDLE,
            KernelError::InvalidCid(_) => Status::INVALID_CID,
            KernelError::InvalidParameter(_) | KernelError::Config(_) => Status::INVALID_PARAMETER,
            KernelError::TargetGone {
                object: ObjectKind::Thread,
                ..
            } => Status::THREAD_IS_TERMINATING,
            KernelError::TargetGone {
                object: ObjectKind::Process,
                ..
            }
            | KernelError::ProcessIsTerminating(_) => Status::PROCESS_IS_TERMINATING,
            KernelError::QuotaExceeded { kind } => kind.exceeded_status(),
            KernelError::InsufficientResources(_) => Status::INSUFFICIENT_RESOURCES,
            KernelError::CantTerminateSelf(_) => Status::CANT_TERMINATE_SELF,
            KernelError::BufferValidation { .. } => Status::BUFFER_TOO_SMALL,
            KernelError::Timeout | KernelError::Unsuccessful(_) => Status::UNSUCCESSFUL,
        }
    }

    #[inline]
    pub fn thread_gone(tid: Tid) -> Self {
        KernelError::TargetGone {
            object: ObjectKind::Thread,
            id: tid,
        }
    }

    #[inline]
    pub fn process_gone(pid: Pid) -> Self {
        KernelError::TargetGone {
            object: ObjectKind::Process,
            id: pid,
        }
    }

    #[inline]
    pub fn is_target_gone(&self) -> bool {
        matches!(self, KernelError::TargetGone { .. })
    }
}

impl From<KernelError> for Status {
    fn from(err: KernelError) -> Self {
        err.status()
    }
}

/// Collapse a unit result into the status an entry point returns
pub fn into_status(result: KernelResult<()>) -> Status {
    match result {
        Ok(()) => Status::SUCCESS,
        Err(e) => e.status(),
    }
}

pub type KernelResult<T> = Result<T, KernelError>;
