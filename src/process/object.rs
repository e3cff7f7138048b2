/*!
 * Process Object
 *
 * Thread list and active-thread count under the process lock, exit status
 * bookkeeping, ports, the handle table and the quota attachment.
 *
 * The active-thread count reaches zero exactly once, under the write lock;
 * the thread that observes it is the last thread and runs process rundown.
 */

use super::collaborators::PoolAllocation;
use super::handles::HandleTable;
use super::job::Job;
use super::ports::{MessagePort, SecurityPort};
use super::Thread;
use crate::core::sync::{Event, RundownProtection};
use crate::core::types::{ImageName, Pid};
use crate::core::Status;
use crate::quota::ProcessQuota;
use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

/// Process flags
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessFlags(pub u32);

impl ProcessFlags {
    /// Process rundown has started
    pub const EXITING: ProcessFlags = ProcessFlags(0x1);
    /// Marked for deletion; no new threads
    pub const DELETE: ProcessFlags = ProcessFlags(0x2);
    pub const BREAK_ON_TERMINATION: ProcessFlags = ProcessFlags(0x4);
    pub const HAS_ADDRESS_SPACE: ProcessFlags = ProcessFlags(0x8);
    /// Job completion message already sent
    pub const EXIT_REPORTED: ProcessFlags = ProcessFlags(0x10);

    #[inline]
    pub const fn contains(self, other: ProcessFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl fmt::Debug for ProcessFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProcessFlags(0x{:X})", self.0)
    }
}

/// State guarded by the process lock
pub(crate) struct ProcessInner {
    pub threads: Vec<Arc<Thread>>,
    pub active_threads: u32,
    pub exit_status: Status,
    pub last_thread_exit_status: Status,
    pub exit_time: Option<SystemTime>,
}

/// Point-in-time view of a process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: Pid,
    pub image_name: String,
    pub parent: Option<Pid>,
    pub flags: ProcessFlags,
    pub threads: usize,
    pub active_threads: u32,
    pub exit_status: Status,
    pub exit_time: Option<SystemTime>,
}

pub struct Process {
    pid: Pid,
    image_name: ImageName,
    parent: Option<Pid>,
    is_system: bool,
    flags: AtomicU32,
    inner: RwLock<ProcessInner>,
    rundown: RundownProtection,
    exited: Event,
    quota: Arc<ProcessQuota>,
    job: Option<Arc<Job>>,
    debug_port: Mutex<Option<Arc<dyn MessagePort>>>,
    exception_port: Mutex<Option<Arc<dyn MessagePort>>>,
    security_port: Mutex<SecurityPort>,
    handles: HandleTable,
    /// User stacks left behind by exited threads; go with the address space
    orphan_stacks: Mutex<Vec<PoolAllocation>>,
    create_time: SystemTime,
}

impl Process {
    pub(crate) fn new(
        pid: Pid,
        image_name: ImageName,
        parent: Option<Pid>,
        is_system: bool,
        job: Option<Arc<Job>>,
    ) -> Self {
        Self {
            pid,
            image_name,
            parent,
            is_system,
            flags: AtomicU32::new(0),
            inner: RwLock::new(ProcessInner {
                threads: Vec::new(),
                active_threads: 0,
                exit_status: Status::PENDING,
                last_thread_exit_status: Status::SUCCESS,
                exit_time: None,
            }),
            rundown: RundownProtection::new(),
            exited: Event::new(),
            quota: Arc::new(ProcessQuota::new(pid)),
            job,
            debug_port: Mutex::new(None),
            exception_port: Mutex::new(None),
            security_port: Mutex::new(SecurityPort::None),
            handles: HandleTable::new(),
            orphan_stacks: Mutex::new(Vec::new()),
            create_time: SystemTime::now(),
        }
    }

    #[inline]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    #[inline]
    pub fn image_name(&self) -> &ImageName {
        &self.image_name
    }

    #[inline]
    pub fn parent(&self) -> Option<Pid> {
        self.parent
    }

    #[inline]
    pub fn is_system(&self) -> bool {
        self.is_system
    }

    #[inline]
    pub fn flags(&self) -> ProcessFlags {
        ProcessFlags(self.flags.load(Ordering::Acquire))
    }

    #[inline]
    pub fn has_flag(&self, flag: ProcessFlags) -> bool {
        self.flags().contains(flag)
    }

    /// Set `flag`, returning whether it was already set
    pub(crate) fn test_and_set(&self, flag: ProcessFlags) -> bool {
        self.flags.fetch_or(flag.0, Ordering::AcqRel) & flag.0 != 0
    }

    #[inline]
    pub fn is_exiting(&self) -> bool {
        self.has_flag(ProcessFlags::EXITING)
    }

    #[inline]
    pub fn is_delete_marked(&self) -> bool {
        self.has_flag(ProcessFlags::DELETE)
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, ProcessInner> {
        self.inner.write()
    }

    /// Snapshot of the thread list
    pub fn threads(&self) -> Vec<Arc<Thread>> {
        self.inner.read().threads.clone()
    }

    pub fn thread_count(&self) -> usize {
        self.inner.read().threads.len()
    }

    pub fn active_threads(&self) -> u32 {
        self.inner.read().active_threads
    }

    /// Exit status; `PENDING` while the process is alive
    pub fn exit_status(&self) -> Status {
        self.inner.read().exit_status
    }

    pub fn exit_time(&self) -> Option<SystemTime> {
        self.inner.read().exit_time
    }

    #[inline]
    pub fn create_time(&self) -> SystemTime {
        self.create_time
    }

    pub(crate) fn remove_thread(&self, thread: &Thread) {
        self.inner
            .write()
            .threads
            .retain(|t| !std::ptr::eq(Arc::as_ptr(t), thread));
    }

    #[inline]
    pub fn rundown(&self) -> &RundownProtection {
        &self.rundown
    }

    /// Signaled once process rundown completes
    #[inline]
    pub fn exited(&self) -> &Event {
        &self.exited
    }

    #[inline]
    pub fn quota(&self) -> &Arc<ProcessQuota> {
        &self.quota
    }

    #[inline]
    pub fn job(&self) -> Option<&Arc<Job>> {
        self.job.as_ref()
    }

    #[inline]
    pub fn handles(&self) -> &HandleTable {
        &self.handles
    }

    pub fn debug_port(&self) -> Option<Arc<dyn MessagePort>> {
        self.debug_port.lock().clone()
    }

    pub fn set_debug_port(&self, port: Option<Arc<dyn MessagePort>>) {
        *self.debug_port.lock() = port;
    }

    pub fn exception_port(&self) -> Option<Arc<dyn MessagePort>> {
        self.exception_port.lock().clone()
    }

    pub fn set_exception_port(&self, port: Option<Arc<dyn MessagePort>>) {
        *self.exception_port.lock() = port;
    }

    pub fn security_port(&self) -> SecurityPort {
        self.security_port.lock().clone()
    }

    /// Connect a security port; refused once rundown has closed the slot
    pub fn connect_security_port(&self, port: Arc<dyn MessagePort>) -> bool {
        let mut slot = self.security_port.lock();
        if slot.is_closed() {
            return false;
        }
        *slot = SecurityPort::Connected(port);
        true
    }

    pub(crate) fn close_security_port(&self) -> SecurityPort {
        std::mem::replace(&mut *self.security_port.lock(), SecurityPort::Closed)
    }

    pub(crate) fn park_user_stack(&self, stack: PoolAllocation) {
        self.orphan_stacks.lock().push(stack);
    }

    /// Free every parked user stack; returns how many there were
    pub(crate) fn release_user_stacks(&self) -> usize {
        let stacks = std::mem::take(&mut *self.orphan_stacks.lock());
        stacks.len()
    }

    pub fn orphaned_stacks(&self) -> usize {
        self.orphan_stacks.lock().len()
    }

    pub fn info(&self) -> ProcessInfo {
        let inner = self.inner.read();
        ProcessInfo {
            pid: self.pid,
            image_name: self.image_name.to_string(),
            parent: self.parent,
            flags: self.flags(),
            threads: inner.threads.len(),
            active_threads: inner.active_threads,
            exit_status: inner.exit_status,
            exit_time: inner.exit_time,
        }
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("image_name", &self.image_name.as_str())
            .field("flags", &self.flags())
            .finish()
    }
}
