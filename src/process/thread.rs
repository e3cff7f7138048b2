/*!
 * Thread Object
 *
 * Identity, cross-thread flags, termination state, the delivery queues and
 * everything the exit path tears down. The owning process is a weak
 * back-reference; the process owns its thread list.
 */

use super::collaborators::{KernelStack, PoolAllocation};
use super::context::Context;
use super::ports::TerminationPort;
use super::Process;
use crate::apc::ApcState;
use crate::core::sync::{Event, RundownProtection};
use crate::core::types::{Handle, Pid, ThreadKind, Tid};
use crate::core::Status;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::SystemTime;

/// Flags other threads may set on a thread
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CrossThreadFlags(pub u32);

impl CrossThreadFlags {
    pub const TERMINATED: CrossThreadFlags = CrossThreadFlags(0x1);
    /// Terminated before its body ever ran
    pub const DEAD_ON_ARRIVAL: CrossThreadFlags = CrossThreadFlags(0x2);
    pub const BREAK_ON_TERMINATION: CrossThreadFlags = CrossThreadFlags(0x4);
    pub const HIDE_FROM_DEBUGGER: CrossThreadFlags = CrossThreadFlags(0x8);

    #[inline]
    pub const fn contains(self, other: CrossThreadFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl fmt::Debug for CrossThreadFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CrossThreadFlags(0x{:X})", self.0)
    }
}

/// Lifecycle state; only ever moves forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ThreadState {
    Initialized = 0,
    Running = 1,
    TerminationRequested = 2,
    ExitRunning = 3,
    ThreadRundown = 4,
    ProcessRundown = 5,
    /// Torn down, waiting for the reaper
    Terminated = 6,
    Reaped = 7,
}

impl ThreadState {
    fn from_u8(value: u8) -> ThreadState {
        match value {
            0 => ThreadState::Initialized,
            1 => ThreadState::Running,
            2 => ThreadState::TerminationRequested,
            3 => ThreadState::ExitRunning,
            4 => ThreadState::ThreadRundown,
            5 => ThreadState::ProcessRundown,
            6 => ThreadState::Terminated,
            _ => ThreadState::Reaped,
        }
    }
}

/// User-mode environment block of a thread
#[derive(Debug, Default)]
pub struct Teb {
    pub user_stack: Option<PoolAllocation>,
    /// The stack was allocated on the thread's behalf and goes with it
    pub free_stack_on_exit: bool,
    /// Debugger handle stored for the thread, closed at exit
    pub debugger_handle: Option<Handle>,
}

/// Point-in-time view of a thread
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadInfo {
    pub tid: Tid,
    pub pid: Pid,
    pub kind: ThreadKind,
    pub state: ThreadState,
    pub flags: CrossThreadFlags,
    pub exit_status: Status,
    pub create_time: SystemTime,
    pub exit_time: Option<SystemTime>,
    pub pending_kernel_apcs: usize,
    pub pending_user_apcs: usize,
}

pub struct Thread {
    tid: Tid,
    pid: Pid,
    kind: ThreadKind,
    process: Weak<Process>,
    flags: AtomicU32,
    state: AtomicU8,
    exit_status: AtomicU32,
    create_time: SystemTime,
    exit_time: Mutex<Option<SystemTime>>,
    termination_ports: Mutex<Vec<TerminationPort>>,
    rundown: RundownProtection,
    apc: ApcState,
    trap_frame: Mutex<Context>,
    teb: Mutex<Option<Teb>>,
    exited: Event,
    kernel_stack: Mutex<Option<KernelStack>>,
    host: Mutex<Option<JoinHandle<()>>>,
    /// Set once the creator has stored the host handle
    host_ready: Event,
    /// Set when the thread may start running its body
    resumed: Event,
    ran_body: AtomicBool,
}

impl Thread {
    pub(crate) fn new(
        tid: Tid,
        process: &Arc<Process>,
        kind: ThreadKind,
        flags: CrossThreadFlags,
        kernel_stack: KernelStack,
        teb: Option<Teb>,
    ) -> Self {
        Self {
            tid,
            pid: process.pid(),
            kind,
            process: Arc::downgrade(process),
            flags: AtomicU32::new(flags.0),
            state: AtomicU8::new(ThreadState::Initialized as u8),
            exit_status: AtomicU32::new(Status::PENDING.code()),
            create_time: SystemTime::now(),
            exit_time: Mutex::new(None),
            termination_ports: Mutex::new(Vec::new()),
            rundown: RundownProtection::new(),
            apc: ApcState::new(),
            trap_frame: Mutex::new(Context::default()),
            teb: Mutex::new(teb),
            exited: Event::new(),
            kernel_stack: Mutex::new(Some(kernel_stack)),
            host: Mutex::new(None),
            host_ready: Event::new(),
            resumed: Event::new(),
            ran_body: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn tid(&self) -> Tid {
        self.tid
    }

    #[inline]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    #[inline]
    pub fn kind(&self) -> ThreadKind {
        self.kind
    }

    #[inline]
    pub fn is_system(&self) -> bool {
        self.kind == ThreadKind::System
    }

    /// Owning process, while it is still alive
    pub fn process(&self) -> Option<Arc<Process>> {
        self.process.upgrade()
    }

    #[inline]
    pub fn flags(&self) -> CrossThreadFlags {
        CrossThreadFlags(self.flags.load(Ordering::Acquire))
    }

    #[inline]
    pub fn has_flag(&self, flag: CrossThreadFlags) -> bool {
        self.flags().contains(flag)
    }

    /// Set `flag`, returning whether it was already set
    #[inline]
    pub(crate) fn test_and_set(&self, flag: CrossThreadFlags) -> bool {
        self.flags.fetch_or(flag.0, Ordering::AcqRel) & flag.0 != 0
    }

    pub(crate) fn clear_flag(&self, flag: CrossThreadFlags) {
        self.flags.fetch_and(!flag.0, Ordering::AcqRel);
    }

    #[inline]
    pub fn is_terminating(&self) -> bool {
        self.has_flag(CrossThreadFlags::TERMINATED)
    }

    #[inline]
    pub fn state(&self) -> ThreadState {
        ThreadState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move forward to `state`; earlier states are ignored
    pub(crate) fn advance(&self, state: ThreadState) {
        self.state.fetch_max(state as u8, Ordering::AcqRel);
    }

    #[inline]
    pub fn exit_status(&self) -> Status {
        Status(self.exit_status.load(Ordering::Acquire))
    }

    pub(crate) fn set_exit_status(&self, status: Status) {
        self.exit_status.store(status.code(), Ordering::Release);
        *self.exit_time.lock() = Some(SystemTime::now());
    }

    #[inline]
    pub fn create_time(&self) -> SystemTime {
        self.create_time
    }

    pub fn exit_time(&self) -> Option<SystemTime> {
        *self.exit_time.lock()
    }

    #[inline]
    pub fn rundown(&self) -> &RundownProtection {
        &self.rundown
    }

    #[inline]
    pub fn apc(&self) -> &ApcState {
        &self.apc
    }

    pub(crate) fn push_termination_port(&self, port: TerminationPort) {
        self.termination_ports.lock().push(port);
    }

    pub(crate) fn take_termination_ports(&self) -> Vec<TerminationPort> {
        std::mem::take(&mut *self.termination_ports.lock())
    }

    pub fn termination_port_count(&self) -> usize {
        self.termination_ports.lock().len()
    }

    /// Saved user-mode register state
    pub fn trap_frame(&self) -> Context {
        self.trap_frame.lock().clone()
    }

    pub(crate) fn with_trap_frame<R>(&self, f: impl FnOnce(&mut Context) -> R) -> R {
        f(&mut self.trap_frame.lock())
    }

    pub(crate) fn take_teb(&self) -> Option<Teb> {
        self.teb.lock().take()
    }

    #[inline]
    pub fn has_teb(&self) -> bool {
        self.teb.lock().is_some()
    }

    /// Signaled once the thread's own teardown is complete
    #[inline]
    pub fn exited(&self) -> &Event {
        &self.exited
    }

    pub(crate) fn take_kernel_stack(&self) -> Option<KernelStack> {
        self.kernel_stack.lock().take()
    }

    #[inline]
    pub fn has_kernel_stack(&self) -> bool {
        self.kernel_stack.lock().is_some()
    }

    pub(crate) fn attach_host(&self, handle: JoinHandle<()>) {
        *self.host.lock() = Some(handle);
        self.host_ready.set();
    }

    pub(crate) fn take_host(&self) -> Option<JoinHandle<()>> {
        self.host.lock().take()
    }

    pub(crate) fn wait_host_ready(&self) {
        self.host_ready.wait(None);
    }

    /// Let a suspended thread run
    pub(crate) fn resume(&self) {
        self.resumed.set();
    }

    /// Wake the thread from a suspension or a wait so it reaches a delivery point
    pub(crate) fn force_resume(&self) {
        self.resumed.set();
        self.apc.force_resume();
    }

    /// Set once the thread may leave its creation suspend
    pub(crate) fn resume_gate(&self) -> &Event {
        &self.resumed
    }

    pub(crate) fn mark_ran_body(&self) {
        self.ran_body.store(true, Ordering::Release);
    }

    #[inline]
    pub fn ran_body(&self) -> bool {
        self.ran_body.load(Ordering::Acquire)
    }

    pub fn info(&self) -> ThreadInfo {
        ThreadInfo {
            tid: self.tid,
            pid: self.pid,
            kind: self.kind,
            state: self.state(),
            flags: self.flags(),
            exit_status: self.exit_status(),
            create_time: self.create_time,
            exit_time: self.exit_time(),
            pending_kernel_apcs: self.apc.pending(crate::core::types::ProcessorMode::Kernel),
            pending_user_apcs: self.apc.pending(crate::core::types::ProcessorMode::User),
        }
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("tid", &self.tid)
            .field("pid", &self.pid)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .field("flags", &self.flags())
            .finish()
    }
}
