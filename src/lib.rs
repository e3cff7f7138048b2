/*!
 * Process Lifecycle Library
 * Thread and process termination, cross-thread callbacks and pool quota
 * accounting for a hosted kernel simulation
 */

pub mod apc;
pub mod core;
pub mod kernel;
pub mod monitoring;
pub mod process;
pub mod quota;

// Re-exports
pub use crate::core::{
    AccessMask, BugCheck, BugCheckCode, Handle, KernelConfig, KernelError, KernelResult, Pid,
    ProcessorMode, QuotaConfig, Status, ThreadKind, Tid,
};
pub use kernel::{Kernel, KernelBuilder, ProcessOptions, ThreadOptions, UserApcRoutine};
pub use monitoring::{init_tracing, StatsSnapshot};
pub use process::{Context, ContextFlags, Process, ShutdownReport, Thread, ThreadCtx};
pub use quota::{QuotaKind, QuotaLimits, QuotaLedger};
