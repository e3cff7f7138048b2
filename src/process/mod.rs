/*!
 * Process Module
 *
 * Process and thread objects, handle tables, jobs, ports, the current
 * thread context and the lifecycle that takes threads from creation to
 * reaping.
 */

pub mod collaborators;
pub mod context;
mod ctx;
pub mod handles;
pub mod job;
pub mod lifecycle;
pub mod object;
pub mod ports;
pub mod resources;
pub mod thread;

pub use collaborators::{
    AddressSpaceManager, AuditLog, AuditRecord, Collaborators, KernelStack,
    KernelStackAllocator, PoolAllocation, PoolAllocator, SecurityAudit, SimulatedAddressSpaces,
    SimulatedPool, SimulatedStacks, StackRelease,
};
pub use context::{Context, ContextFlags};
pub use ctx::{ThreadCtx, WaitStatus};
pub use handles::{HandleTable, KernelObject};
pub use job::{classify_exit, Job, JobAccounting};
pub use lifecycle::{Reaper, ShutdownReport, ThreadBody};
pub use object::{Process, ProcessFlags, ProcessInfo};
pub use ports::{JobExitReason, MessagePort, PortError, PortMessage, QueuePort, SecurityPort};
pub use resources::{
    IoCancellation, IoRequest, RegistryNotifyRundown, RundownOrchestrator, RundownResult,
    RundownStats, SubsystemRundown, TimerId, TimerRundown,
};
pub use thread::{CrossThreadFlags, Teb, Thread, ThreadInfo, ThreadState};
