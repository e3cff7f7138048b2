/*!
 * Kernel
 *
 * Owns the cid table, the System process, the quota ledger, the reaper,
 * notify routines, subsystem rundown and the external collaborators.
 * Cheap to clone; every running thread holds a clone through its context.
 *
 * # Callers
 *
 * Entry points resolve the caller from the current host thread: a simulated
 * thread of this kernel calls as itself, any other host thread calls as a
 * kernel-mode thread of the System process.
 */

mod builder;
mod cid;
mod notify;
mod objects;
mod syscalls;

pub use builder::KernelBuilder;
pub use cid::CidTable;
pub use notify::{ProcessNotify, ThreadNotify};
pub use objects::{ProcessOptions, ThreadOptions};
pub use syscalls::UserApcRoutine;

pub(crate) use notify::NotifyRegistry;

use crate::core::bugcheck::{bugcheck, BugCheck, BugCheckCode};
use crate::core::errors::{KernelError, KernelResult};
use crate::core::sync::Event;
use crate::core::types::{AccessMask, Handle};
use crate::core::KernelConfig;
use crate::monitoring::{LifecycleStats, StatsSnapshot};
use crate::process::{
    Collaborators, IoCancellation, Process, RegistryNotifyRundown, Reaper, RundownOrchestrator,
    Thread, ThreadCtx, TimerRundown,
};
use crate::quota::QuotaLedger;
use arc_swap::ArcSwap;
use log::info;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub(crate) struct KernelInner {
    config: ArcSwap<KernelConfig>,
    cids: Arc<CidTable>,
    system: Arc<Process>,
    quota: QuotaLedger,
    reaper: Reaper,
    collaborators: Collaborators,
    rundown: RundownOrchestrator,
    io: Arc<IoCancellation>,
    timers: Arc<TimerRundown>,
    registry: Arc<RegistryNotifyRundown>,
    notify: NotifyRegistry,
    stats: Arc<LifecycleStats>,
    halted: Mutex<Option<BugCheck>>,
    shutdown: AtomicBool,
    next_job: AtomicU32,
}

#[derive(Clone)]
pub struct Kernel {
    inner: Arc<KernelInner>,
}

impl Kernel {
    /// Kernel with default configuration, environment overrides applied,
    /// and in-memory collaborators
    pub fn new() -> KernelResult<Self> {
        KernelBuilder::new()
            .with_config(KernelConfig::default().with_env_overrides())
            .build()
    }

    pub fn builder() -> KernelBuilder {
        KernelBuilder::new()
    }

    #[inline]
    pub fn ptr_eq(&self, other: &Kernel) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn config(&self) -> Arc<KernelConfig> {
        self.inner.config.load_full()
    }

    /// Swap in a new configuration; threads pick it up at their next read
    pub fn reconfigure(&self, config: KernelConfig) {
        self.inner.quota.reconfigure(config.quota.clone());
        self.inner.config.store(Arc::new(config));
        info!("Kernel configuration replaced");
    }

    #[inline]
    pub fn quota(&self) -> &QuotaLedger {
        &self.inner.quota
    }

    #[inline]
    pub fn stats(&self) -> &LifecycleStats {
        &self.inner.stats
    }

    pub fn stats_snapshot(&self) -> StatsSnapshot {
        self.inner.stats.snapshot(self.inner.quota.stats())
    }

    #[inline]
    pub fn reaper(&self) -> &Reaper {
        &self.inner.reaper
    }

    #[inline]
    pub fn cids(&self) -> &CidTable {
        &self.inner.cids
    }

    #[inline]
    pub fn collaborators(&self) -> &Collaborators {
        &self.inner.collaborators
    }

    #[inline]
    pub fn system_process(&self) -> &Arc<Process> {
        &self.inner.system
    }

    #[inline]
    pub fn io(&self) -> &IoCancellation {
        &self.inner.io
    }

    #[inline]
    pub fn timers(&self) -> &TimerRundown {
        &self.inner.timers
    }

    #[inline]
    pub fn registry_notify(&self) -> &RegistryNotifyRundown {
        &self.inner.registry
    }

    #[inline]
    pub fn rundown_orchestrator(&self) -> &RundownOrchestrator {
        &self.inner.rundown
    }

    #[inline]
    pub(crate) fn notify(&self) -> &NotifyRegistry {
        &self.inner.notify
    }

    pub fn register_thread_notify(&self, routine: Arc<dyn ThreadNotify>) {
        self.inner.notify.add_thread(routine);
    }

    pub fn register_process_notify(&self, routine: Arc<dyn ProcessNotify>) {
        self.inner.notify.add_process(routine);
    }

    /// The bug check that halted the system, if one did
    pub fn halted(&self) -> Option<BugCheck> {
        self.inner.halted.lock().clone()
    }

    /// Record the halt and bug check
    pub fn halt(&self, code: BugCheckCode, parameters: [u64; 4]) -> ! {
        self.record_halt(&BugCheck { code, parameters });
        bugcheck(code, parameters)
    }

    /// First bug check wins
    pub(crate) fn record_halt(&self, check: &BugCheck) {
        let mut halted = self.inner.halted.lock();
        if halted.is_none() {
            *halted = Some(check.clone());
        }
    }

    /// Claim the one shutdown; false if it already started
    pub(crate) fn begin_shutdown(&self) -> bool {
        !self.inner.shutdown.swap(true, Ordering::AcqRel)
    }

    #[inline]
    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn next_job_id(&self) -> u32 {
        self.inner.next_job.fetch_add(1, Ordering::Relaxed)
    }

    /// Context of the calling thread, if it is a thread of this kernel
    pub(crate) fn current(&self) -> Option<ThreadCtx> {
        ThreadCtx::current().filter(|ctx| ctx.kernel().ptr_eq(self))
    }

    /// Process on whose behalf the caller runs
    pub(crate) fn caller_process(&self) -> Arc<Process> {
        match self.current() {
            Some(ctx) => Arc::clone(ctx.process()),
            None => Arc::clone(&self.inner.system),
        }
    }

    /// Back off for `duration`; a simulated caller keeps taking kernel callbacks
    pub(crate) fn delay(&self, duration: Duration) {
        match self.current() {
            Some(ctx) => ctx.sleep(duration),
            None => std::thread::sleep(duration),
        }
    }

    /// Wait on `event`; false on timeout
    pub(crate) fn wait_event(&self, event: &Event, timeout: Option<Duration>) -> bool {
        match self.current() {
            Some(ctx) => ctx.wait_for(event, timeout),
            None => event.wait(timeout),
        }
    }

    pub(crate) fn resolve_thread(
        &self,
        handle: Handle,
        access: AccessMask,
    ) -> KernelResult<Arc<Thread>> {
        if handle == Handle::CURRENT_THREAD {
            return self
                .current()
                .map(|ctx| Arc::clone(ctx.thread()))
                .ok_or(KernelError::InvalidHandle(handle.value()));
        }
        self.caller_process().handles().lookup_thread(handle, access)
    }

    pub(crate) fn resolve_process(
        &self,
        handle: Handle,
        access: AccessMask,
    ) -> KernelResult<Arc<Process>> {
        if handle == Handle::CURRENT_PROCESS {
            return Ok(self.caller_process());
        }
        self.caller_process().handles().lookup_process(handle, access)
    }
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("cids", &self.inner.cids)
            .field("reaper", &self.inner.reaper)
            .field("halted", &self.halted())
            .finish()
    }
}
