/*!
 * Object Creation and Lookup
 *
 * Processes, threads, handles and jobs. A new thread's host is started
 * immediately but holds until the thread is resumed.
 */

use super::Kernel;
use crate::core::errors::{into_status, KernelError, KernelResult};
use crate::core::types::{AccessMask, Handle, ImageName, Pid, ThreadKind, Tid};
use crate::core::Status;
use crate::process::lifecycle::spawn_host;
use crate::process::object::ProcessFlags;
use crate::process::{
    CrossThreadFlags, Job, KernelObject, MessagePort, PoolAllocation, Process, Teb, Thread,
    ThreadCtx,
};
use log::{debug, info};
use std::sync::Arc;

/// Parameters of a new process
#[derive(Clone, Default)]
pub struct ProcessOptions {
    pub image_name: String,
    /// Shares the parent's quota block when the parent has its own
    pub parent: Option<Pid>,
    pub job: Option<Arc<Job>>,
    /// Terminating the process, or losing its last thread, halts the system
    pub critical: bool,
    pub debug_port: Option<Arc<dyn MessagePort>>,
    pub exception_port: Option<Arc<dyn MessagePort>>,
}

impl ProcessOptions {
    pub fn new(image_name: &str) -> Self {
        Self {
            image_name: image_name.to_string(),
            ..Self::default()
        }
    }

    #[inline]
    #[must_use]
    pub fn with_parent(mut self, parent: Pid) -> Self {
        self.parent = Some(parent);
        self
    }

    #[inline]
    #[must_use]
    pub fn with_job(mut self, job: Arc<Job>) -> Self {
        self.job = Some(job);
        self
    }

    #[inline]
    #[must_use]
    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_debug_port(mut self, port: Arc<dyn MessagePort>) -> Self {
        self.debug_port = Some(port);
        self
    }

    #[inline]
    #[must_use]
    pub fn with_exception_port(mut self, port: Arc<dyn MessagePort>) -> Self {
        self.exception_port = Some(port);
        self
    }
}

/// Parameters of a new thread
#[derive(Debug, Clone)]
pub struct ThreadOptions {
    pub kind: ThreadKind,
    pub critical: bool,
    pub hide_from_debugger: bool,
    /// Hold the thread until `resume_thread`
    pub suspended: bool,
    /// Pool bytes for a user stack
    pub user_stack: Option<usize>,
    pub free_stack_on_exit: bool,
    pub debugger_handle: Option<Handle>,
}

impl Default for ThreadOptions {
    fn default() -> Self {
        Self::user()
    }
}

impl ThreadOptions {
    pub fn user() -> Self {
        Self {
            kind: ThreadKind::User,
            critical: false,
            hide_from_debugger: false,
            suspended: false,
            user_stack: None,
            free_stack_on_exit: true,
            debugger_handle: None,
        }
    }

    /// Kernel-only thread of the System process
    pub fn system() -> Self {
        Self {
            kind: ThreadKind::System,
            ..Self::user()
        }
    }

    #[inline]
    #[must_use]
    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    #[inline]
    #[must_use]
    pub fn hidden_from_debugger(mut self) -> Self {
        self.hide_from_debugger = true;
        self
    }

    #[inline]
    #[must_use]
    pub fn suspended(mut self) -> Self {
        self.suspended = true;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_user_stack(mut self, size: usize, free_on_exit: bool) -> Self {
        self.user_stack = Some(size);
        self.free_stack_on_exit = free_on_exit;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_debugger_handle(mut self, handle: Handle) -> Self {
        self.debugger_handle = Some(handle);
        self
    }
}

impl Kernel {
    pub fn create_process(&self, options: ProcessOptions) -> KernelResult<Arc<Process>> {
        let parent = match options.parent {
            Some(pid) => Some(self.cids().process(pid).ok_or(KernelError::InvalidCid(pid))?),
            None => None,
        };

        let pid = self.cids().allocate();
        let process = Arc::new(Process::new(
            pid,
            ImageName::new(&options.image_name),
            options.parent,
            false,
            options.job.clone(),
        ));
        self.quota()
            .inherit(process.quota(), parent.as_deref().map(|p| p.quota().as_ref()));

        if !self.collaborators().address_spaces.create(pid) {
            self.quota().detach(process.quota());
            return Err(KernelError::InsufficientResources(format!(
                "no address space for PID {}",
                pid
            )));
        }
        process.test_and_set(ProcessFlags::HAS_ADDRESS_SPACE);
        if options.critical {
            process.test_and_set(ProcessFlags::BREAK_ON_TERMINATION);
        }
        process.set_debug_port(options.debug_port);
        process.set_exception_port(options.exception_port);
        if let Some(job) = &options.job {
            job.add_process(&process);
        }

        self.cids().insert_process(process.clone());
        self.stats().inc_processes_created();
        self.notify().process_created(pid, options.parent);
        info!("Created process {} ({})", pid, process.image_name());
        Ok(process)
    }

    /// Create a thread in `process` running `body`
    pub fn create_thread<F>(
        &self,
        process: &Arc<Process>,
        options: ThreadOptions,
        body: F,
    ) -> KernelResult<Arc<Thread>>
    where
        F: FnOnce(&ThreadCtx) + Send + 'static,
    {
        match (options.kind, process.is_system()) {
            (ThreadKind::User, true) => {
                return Err(KernelError::InvalidParameter(
                    "user threads cannot run in the System process".to_string(),
                ))
            }
            (ThreadKind::System, false) => {
                return Err(KernelError::InvalidParameter(
                    "system threads belong to the System process".to_string(),
                ))
            }
            _ => {}
        }

        let stacks = &self.collaborators().stacks;
        let tid = self.cids().allocate();
        let kernel_stack = stacks
            .allocate(tid)
            .ok_or_else(|| KernelError::InsufficientResources("kernel stack".to_string()))?;

        let teb = if options.kind == ThreadKind::User {
            let user_stack = match options.user_stack {
                Some(size) => match PoolAllocation::allocate(&self.collaborators().pool, size) {
                    Some(stack) => Some(stack),
                    None => {
                        stacks.free(kernel_stack);
                        return Err(KernelError::InsufficientResources("user stack".to_string()));
                    }
                },
                None => None,
            };
            Some(Teb {
                user_stack,
                free_stack_on_exit: options.free_stack_on_exit,
                debugger_handle: options.debugger_handle,
            })
        } else {
            None
        };

        let mut flags = 0;
        if options.critical {
            flags |= CrossThreadFlags::BREAK_ON_TERMINATION.0;
        }
        if options.hide_from_debugger {
            flags |= CrossThreadFlags::HIDE_FROM_DEBUGGER.0;
        }
        let thread = Arc::new(Thread::new(
            tid,
            process,
            options.kind,
            CrossThreadFlags(flags),
            kernel_stack,
            teb,
        ));

        {
            let mut inner = process.write();
            if process.is_delete_marked() {
                drop(inner);
                if let Some(stack) = thread.take_kernel_stack() {
                    stacks.free(stack);
                }
                return Err(KernelError::ProcessIsTerminating(process.pid()));
            }
            inner.threads.push(thread.clone());
            inner.active_threads += 1;
        }
        self.cids().insert_thread(thread.clone());

        let host = match spawn_host(self, &thread, process, Box::new(body)) {
            Ok(host) => host,
            Err(e) => {
                {
                    let mut inner = process.write();
                    inner.threads.retain(|t| !Arc::ptr_eq(t, &thread));
                    inner.active_threads = inner.active_threads.saturating_sub(1);
                }
                self.cids().remove_thread(tid);
                if let Some(stack) = thread.take_kernel_stack() {
                    stacks.free(stack);
                }
                return Err(KernelError::InsufficientResources(format!(
                    "host thread: {}",
                    e
                )));
            }
        };
        thread.attach_host(host);
        if !options.suspended {
            thread.resume();
        }

        self.stats().inc_threads_created();
        self.notify().thread_created(process.pid(), tid);
        debug!(
            "Created {:?} thread {} in process {}",
            options.kind,
            tid,
            process.pid()
        );
        Ok(thread)
    }

    /// Let a thread created suspended start running
    pub fn resume_thread(&self, thread: &Thread) {
        thread.resume();
    }

    /// Open a handle to a process in the caller's handle table
    pub fn open_process(&self, pid: Pid, access: AccessMask) -> KernelResult<Handle> {
        let process = self.cids().process(pid).ok_or(KernelError::InvalidCid(pid))?;
        self.caller_process()
            .handles()
            .insert(KernelObject::Process(process), access)
    }

    /// Open a handle to a thread in the caller's handle table
    pub fn open_thread(&self, tid: Tid, access: AccessMask) -> KernelResult<Handle> {
        let thread = self.cids().thread(tid).ok_or(KernelError::InvalidCid(tid))?;
        self.caller_process()
            .handles()
            .insert(KernelObject::Thread(thread), access)
    }

    pub fn close_handle(&self, handle: Handle) -> Status {
        if handle.is_pseudo() {
            return Status::SUCCESS;
        }
        into_status(self.caller_process().handles().close(handle))
    }

    pub fn lookup_process(&self, pid: Pid) -> Option<Arc<Process>> {
        self.cids().process(pid)
    }

    pub fn lookup_thread(&self, tid: Tid) -> Option<Arc<Thread>> {
        self.cids().thread(tid)
    }

    pub fn create_job(&self) -> Arc<Job> {
        let job = Arc::new(Job::new(self.next_job_id()));
        debug!("Created job {}", job.id());
        job
    }
}
