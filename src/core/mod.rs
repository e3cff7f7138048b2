/*!
 * Core Module
 * Fundamental types, errors, configuration and synchronization
 */

pub mod bugcheck;
pub mod config;
pub mod errors;
pub mod limits;
pub mod status;
pub mod sync;
pub mod types;

pub use bugcheck::{bugcheck, BugCheck, BugCheckCode};
pub use config::{KernelConfig, QuotaConfig};
pub use errors::{into_status, KernelError, KernelResult, ObjectKind};
pub use status::Status;
pub use types::{
    AccessMask, Handle, ImageName, Pid, ProcessorMode, ThreadKind, Tid, SYSTEM_PID,
};
