/*!
 * Entry Points
 *
 * Termination, context, callback and quota calls as a caller sees them.
 * Every call resolves its target through the caller's handle table with
 * the access it needs and reports a status; only malformed caller buffers
 * surface as errors at the boundary.
 *
 * Context requests are carried out on the target thread by a kernel-mode
 * callback. The caller holds the target's rundown protection only while
 * queuing, never while waiting, or a target exiting meanwhile would wait
 * on the caller forever.
 */

use super::Kernel;
use crate::apc::{deliver, ApcEnvelope, ApcRoutine, Delivery};
use crate::core::errors::{into_status, KernelError, KernelResult};
use crate::core::limits::APC_ENVELOPE_SIZE;
use crate::core::sync::Event;
use crate::core::types::{AccessMask, Handle, ProcessorMode, SYSTEM_PID};
use crate::core::Status;
use crate::monitoring::SyscallSpan;
use crate::process::lifecycle::{
    critical_break, shutdown_system, terminate_by_pointer, terminate_job, terminate_threads,
    wait_for_all_processes,
};
use crate::process::object::ProcessFlags;
use crate::process::{
    Context, ContextFlags, Job, PoolAllocation, Process, ShutdownReport, Thread, ThreadCtx,
    ThreadInfo,
};
use crate::quota::{ProcessQuotaSnapshot, QuotaBlockRef, QuotaKind, QuotaLimits};
use log::{debug, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

/// User-mode callback queued by `queue_user_apc`, called with its three arguments
pub type UserApcRoutine = Box<dyn FnOnce(&ThreadCtx, u64, u64, u64) + Send>;

struct GetContextApc {
    flags: ContextFlags,
    result: Arc<Mutex<Option<Context>>>,
}

impl ApcRoutine for GetContextApc {
    fn run(self: Box<Self>, ctx: &ThreadCtx) {
        let frame = ctx.thread().trap_frame();
        *self.result.lock() = Some(Context::capture(&frame, self.flags));
    }

    fn name(&self) -> &'static str {
        "get-context"
    }
}

struct SetContextApc {
    context: Context,
    mode: ProcessorMode,
    applied: Arc<AtomicBool>,
}

impl ApcRoutine for SetContextApc {
    fn run(self: Box<Self>, ctx: &ThreadCtx) {
        ctx.thread()
            .with_trap_frame(|frame| self.context.apply_to(frame, self.mode));
        self.applied.store(true, Ordering::Release);
    }

    fn name(&self) -> &'static str {
        "set-context"
    }
}

struct UserApc {
    routine: UserApcRoutine,
    args: [u64; 3],
}

impl ApcRoutine for UserApc {
    fn run(self: Box<Self>, ctx: &ThreadCtx) {
        let UserApc {
            routine,
            args: [a1, a2, a3],
        } = *self;
        routine(ctx, a1, a2, a3);
    }

    fn name(&self) -> &'static str {
        "user"
    }
}

impl Kernel {
    fn syscall_span(&self, name: &'static str) -> SyscallSpan {
        match self.current() {
            Some(ctx) => SyscallSpan::new(name, ctx.pid(), Some(ctx.tid())),
            None => SyscallSpan::new(name, SYSTEM_PID, None),
        }
    }

    /// Deliver and count how it went
    fn post(&self, thread: &Arc<Thread>, envelope: ApcEnvelope) -> KernelResult<Delivery> {
        let stats = self.stats();
        match deliver(thread, envelope) {
            Ok(Delivery::Inline) => {
                stats.inc_apcs_inline();
                Ok(Delivery::Inline)
            }
            Ok(Delivery::Queued) => {
                stats.inc_apcs_queued();
                Ok(Delivery::Queued)
            }
            Err(e) => {
                stats.inc_apcs_rejected();
                Err(e)
            }
        }
    }

    /// Pool memory for an envelope, retried a bounded number of times
    fn allocate_envelope(&self) -> KernelResult<PoolAllocation> {
        let config = self.config();
        let pool = &self.collaborators().pool;
        for attempt in 0..=config.user_apc_alloc_retries {
            if let Some(allocation) = PoolAllocation::allocate(pool, APC_ENVELOPE_SIZE) {
                return Ok(allocation);
            }
            if attempt < config.user_apc_alloc_retries {
                self.stats().inc_allocation_retries();
                self.delay(config.short_delay);
            }
        }
        Err(KernelError::InsufficientResources(
            "callback envelope".to_string(),
        ))
    }

    // -------------------------------------------------------------------------
    // Termination
    // -------------------------------------------------------------------------

    /// Terminate a thread; `None` means the caller, which must not be its
    /// process's last thread
    ///
    /// Never returns when the target is the caller.
    pub fn terminate_thread(&self, handle: Option<Handle>, status: Status) -> Status {
        let span = self.syscall_span("terminate_thread");
        span.finish(into_status(self.terminate_thread_inner(handle, status)))
    }

    fn terminate_thread_inner(&self, handle: Option<Handle>, status: Status) -> KernelResult<()> {
        let caller = self.current();
        let thread = match handle {
            None => {
                let ctx = caller
                    .as_ref()
                    .ok_or(KernelError::InvalidHandle(Handle::CURRENT_THREAD.value()))?;
                if ctx.process().active_threads() <= 1 {
                    return Err(KernelError::CantTerminateSelf(ctx.tid()));
                }
                Arc::clone(ctx.thread())
            }
            Some(handle) => self.resolve_thread(handle, AccessMask::THREAD_TERMINATE)?,
        };
        let is_self = caller.as_ref().is_some_and(|ctx| ctx.is(&thread));
        terminate_by_pointer(self, &thread, status, is_self)
    }

    /// Terminate a process
    ///
    /// `None` asks every other thread of the caller's process to exit and
    /// returns. A handle to the caller's own process does the same and then
    /// exits the caller. Returns `NOTHING_TO_TERMINATE` for a process with
    /// no threads.
    pub fn terminate_process(&self, handle: Option<Handle>, status: Status) -> Status {
        let span = self.syscall_span("terminate_process");
        let result = match self.terminate_process_inner(handle, status) {
            Ok(status) => status,
            Err(e) => e.status(),
        };
        span.finish(result)
    }

    fn terminate_process_inner(&self, handle: Option<Handle>, status: Status) -> KernelResult<Status> {
        let caller = self.current();
        let process = self.resolve_process(
            handle.unwrap_or(Handle::CURRENT_PROCESS),
            AccessMask::PROCESS_TERMINATE,
        )?;
        if process.is_system() {
            return Err(KernelError::AccessDenied {
                requested: AccessMask::PROCESS_TERMINATE.0,
                granted: 0,
            });
        }
        if process.has_flag(ProcessFlags::BREAK_ON_TERMINATION) {
            critical_break(self, "process", process.pid());
        }

        let result = {
            let _guard = process
                .rundown()
                .acquire()
                .ok_or(KernelError::ProcessIsTerminating(process.pid()))?;
            if handle.is_some() {
                process.test_and_set(ProcessFlags::DELETE);
            }
            terminate_threads(self, &process, status)
        };

        let own = caller
            .as_ref()
            .filter(|ctx| Arc::ptr_eq(ctx.process(), &process));
        match own {
            Some(ctx) if handle.is_some() => {
                terminate_by_pointer(self, ctx.thread(), status, true)?;
            }
            Some(_) => {}
            None => {
                if status == Status::DBG_TERMINATE_PROCESS {
                    process.set_debug_port(None);
                }
            }
        }

        if result == Status::NOTHING_TO_TERMINATE
            || (handle.is_some() && process.debug_port().is_some())
        {
            let closed = process.handles().kill();
            debug!("PID {} handle table killed ({} entries)", process.pid(), closed);
        }
        Ok(result)
    }

    /// Exit the calling system thread; anything else is rejected
    pub fn terminate_system_thread(&self, status: Status) -> Status {
        let span = self.syscall_span("terminate_system_thread");
        let result = match self.current() {
            Some(ctx) if ctx.thread().is_system() => {
                into_status(terminate_by_pointer(self, ctx.thread(), status, true))
            }
            _ => Status::INVALID_PARAMETER,
        };
        span.finish(result)
    }

    #[inline]
    pub fn is_thread_terminating(&self, thread: &Thread) -> bool {
        thread.is_terminating()
    }

    #[inline]
    pub fn process_exit_time(&self, process: &Process) -> Option<SystemTime> {
        process.exit_time()
    }

    /// Terminate every member of a job
    pub fn terminate_job(&self, job: &Job, status: Status) -> Status {
        terminate_job(self, job, status)
    }

    /// Terminate every non-system process and wait for them
    pub fn shutdown_system(&self) -> ShutdownReport {
        shutdown_system(self)
    }

    /// True once every non-system process has exited
    pub fn wait_for_all_processes(&self) -> bool {
        wait_for_all_processes(self)
    }

    // -------------------------------------------------------------------------
    // Context
    // -------------------------------------------------------------------------

    /// Capture the register groups in `flags` from a thread
    ///
    /// Runs on the target at its next kernel delivery point. A target that
    /// exits first yields `TargetGone`, never a partial record.
    pub fn get_context(
        &self,
        handle: Handle,
        flags: ContextFlags,
        mode: ProcessorMode,
    ) -> KernelResult<Context> {
        let span = self.syscall_span("get_context");
        let result = self.get_context_inner(handle, flags, mode);
        span.record_status(match &result {
            Ok(_) => Status::SUCCESS,
            Err(e) => e.status(),
        });
        result
    }

    fn get_context_inner(
        &self,
        handle: Handle,
        flags: ContextFlags,
        mode: ProcessorMode,
    ) -> KernelResult<Context> {
        flags.validate()?;
        let thread = self.resolve_thread(handle, AccessMask::THREAD_GET_CONTEXT)?;
        if mode == ProcessorMode::User && thread.is_system() {
            return Err(KernelError::InvalidHandle(handle.value()));
        }

        let result = Arc::new(Mutex::new(None));
        let done = Arc::new(Event::new());
        let envelope = ApcEnvelope::new(
            thread.tid(),
            ProcessorMode::Kernel,
            Box::new(GetContextApc {
                flags,
                result: Arc::clone(&result),
            }),
        )
        .with_completion(Arc::clone(&done));

        let delivery = {
            let _guard = thread
                .rundown()
                .acquire()
                .ok_or_else(|| KernelError::thread_gone(thread.tid()))?;
            self.post(&thread, envelope)?
        };
        if delivery == Delivery::Queued
            && !self.wait_event(&done, self.config().context_wait_timeout)
        {
            warn!("Get-context on TID {} timed out", thread.tid());
            return Err(KernelError::Timeout);
        }

        let captured = result.lock().take();
        captured.ok_or_else(|| KernelError::thread_gone(thread.tid()))
    }

    /// Replace the register groups flagged in `context`
    ///
    /// A user-mode request is sanitized so it cannot raise privilege.
    pub fn set_context(&self, handle: Handle, context: &Context, mode: ProcessorMode) -> Status {
        let span = self.syscall_span("set_context");
        span.finish(into_status(self.set_context_inner(handle, context, mode)))
    }

    fn set_context_inner(
        &self,
        handle: Handle,
        context: &Context,
        mode: ProcessorMode,
    ) -> KernelResult<()> {
        context.flags.validate()?;
        let thread = self.resolve_thread(handle, AccessMask::THREAD_SET_CONTEXT)?;
        if mode == ProcessorMode::User && thread.is_system() {
            return Err(KernelError::InvalidHandle(handle.value()));
        }

        let applied = Arc::new(AtomicBool::new(false));
        let done = Arc::new(Event::new());
        let envelope = ApcEnvelope::new(
            thread.tid(),
            ProcessorMode::Kernel,
            Box::new(SetContextApc {
                context: context.clone(),
                mode,
                applied: Arc::clone(&applied),
            }),
        )
        .with_completion(Arc::clone(&done));

        let delivery = {
            let _guard = thread
                .rundown()
                .acquire()
                .ok_or_else(|| KernelError::thread_gone(thread.tid()))?;
            self.post(&thread, envelope)?
        };
        if delivery == Delivery::Queued
            && !self.wait_event(&done, self.config().context_wait_timeout)
        {
            warn!("Set-context on TID {} timed out", thread.tid());
            return Err(KernelError::Timeout);
        }

        if applied.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(KernelError::thread_gone(thread.tid()))
        }
    }

    /// `get_context` into a caller-supplied record buffer
    ///
    /// A buffer of the wrong size is rejected before anything else happens;
    /// every other failure is reported in the status.
    pub fn get_context_buffer(
        &self,
        handle: Handle,
        flags: ContextFlags,
        mode: ProcessorMode,
        buffer: &mut [u8],
    ) -> KernelResult<Status> {
        if buffer.len() != Context::RECORD_SIZE {
            return Err(KernelError::BufferValidation {
                reason: format!(
                    "context buffer is {} bytes, expected {}",
                    buffer.len(),
                    Context::RECORD_SIZE
                ),
            });
        }
        match self.get_context(handle, flags, mode) {
            Ok(context) => {
                context.write_to(buffer)?;
                Ok(Status::SUCCESS)
            }
            Err(e) => Ok(e.status()),
        }
    }

    /// `set_context` from a caller-supplied record
    pub fn set_context_buffer(
        &self,
        handle: Handle,
        record: &[u8],
        mode: ProcessorMode,
    ) -> KernelResult<Status> {
        let context = Context::from_bytes(record)?;
        Ok(self.set_context(handle, &context, mode))
    }

    // -------------------------------------------------------------------------
    // Callbacks
    // -------------------------------------------------------------------------

    /// Queue `routine` to run in user mode on a thread
    ///
    /// The envelope is charged to the caller's non-paged quota until it runs
    /// or is run down. A target already past rundown is not an error.
    pub fn queue_user_apc(
        &self,
        handle: Handle,
        routine: UserApcRoutine,
        arg1: u64,
        arg2: u64,
        arg3: u64,
    ) -> Status {
        let span = self.syscall_span("queue_user_apc");
        span.finish(into_status(
            self.queue_user_apc_inner(handle, routine, [arg1, arg2, arg3]),
        ))
    }

    fn queue_user_apc_inner(
        &self,
        handle: Handle,
        routine: UserApcRoutine,
        args: [u64; 3],
    ) -> KernelResult<()> {
        let thread = self.resolve_thread(handle, AccessMask::THREAD_SET_CONTEXT)?;
        if thread.is_system() {
            return Err(KernelError::InvalidHandle(handle.value()));
        }

        let caller = self.caller_process();
        // Quota refusal is an envelope allocation failure to the caller
        let charge = self
            .quota()
            .charge_process_held(caller.quota(), QuotaKind::NonPaged, APC_ENVELOPE_SIZE)
            .map_err(|e| match e {
                KernelError::QuotaExceeded { .. } => {
                    KernelError::InsufficientResources("callback envelope quota".to_string())
                }
                other => other,
            })?;
        let allocation = self.allocate_envelope()?;
        let envelope = ApcEnvelope::new(
            thread.tid(),
            ProcessorMode::User,
            Box::new(UserApc { routine, args }),
        )
        .with_allocation(allocation)
        .with_charge(charge);

        match self.post(&thread, envelope) {
            Ok(_) => Ok(()),
            Err(e) if e.is_target_gone() => {
                debug!("User callback to exiting TID {} dropped", thread.tid());
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    // -------------------------------------------------------------------------
    // Queries and quota
    // -------------------------------------------------------------------------

    /// Snapshot of a thread, taken under its rundown protection
    pub fn query_thread(&self, handle: Handle) -> KernelResult<ThreadInfo> {
        let thread = self.resolve_thread(handle, AccessMask::THREAD_QUERY_INFORMATION)?;
        let _guard = thread
            .rundown()
            .acquire()
            .ok_or_else(|| KernelError::thread_gone(thread.tid()))?;
        Ok(thread.info())
    }

    /// Quota usage of a process; `TargetGone` once its attachment is released
    pub fn query_quota(&self, handle: Handle) -> KernelResult<ProcessQuotaSnapshot> {
        let process = self.resolve_process(handle, AccessMask::PROCESS_QUERY_INFORMATION)?;
        self.quota().query(process.quota())
    }

    /// Give a process its own quota block, or adjust the one it has
    pub fn set_quota_limits(&self, handle: Handle, limits: QuotaLimits) -> Status {
        let span = self.syscall_span("set_quota_limits");
        let result = self
            .resolve_process(handle, AccessMask::PROCESS_SET_QUOTA)
            .and_then(|process| self.quota().set_limits(process.quota(), limits));
        span.finish(into_status(result))
    }

    /// Charge an object shared across processes to `process`'s block
    pub fn charge_shared_pool_quota(
        &self,
        process: &Process,
        paged: usize,
        non_paged: usize,
    ) -> KernelResult<QuotaBlockRef> {
        self.quota().charge_shared(process.quota(), paged, non_paged)
    }

    /// Return a shared charge to the block it was taken from
    pub fn return_shared_pool_quota(&self, block: QuotaBlockRef, paged: usize, non_paged: usize) {
        self.quota().return_shared(block, paged, non_paged);
    }
}
