/*!
 * Object Tests
 * Process and thread creation, handles and lookup
 */

use crate::common::{idle, kernel, wait_until, WAIT};
use ps_lifecycle::core::types::SYSTEM_PID;
use ps_lifecycle::kernel::ThreadNotify;
use ps_lifecycle::process::{ProcessFlags, SimulatedPool, SimulatedStacks};
use ps_lifecycle::{
    AccessMask, Handle, Kernel, KernelConfig, KernelError, Pid, ProcessOptions, Status,
    ThreadOptions, Tid,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use parking_lot::Mutex;

#[derive(Default)]
struct CreateLog {
    created: Mutex<Vec<(Pid, Tid)>>,
}

impl ThreadNotify for CreateLog {
    fn thread_created(&self, pid: Pid, tid: Tid) {
        self.created.lock().push((pid, tid));
    }
}

#[test]
fn test_processes_get_distinct_ids() {
    let kernel = kernel();
    let first = kernel.create_process(ProcessOptions::new("one")).unwrap();
    let second = kernel.create_process(ProcessOptions::new("two")).unwrap();

    assert_ne!(first.pid(), second.pid());
    assert_ne!(first.pid(), SYSTEM_PID);
    assert!(!first.is_system());
    assert!(kernel.system_process().is_system());
    assert_eq!(kernel.system_process().pid(), SYSTEM_PID);

    let found = kernel.lookup_process(first.pid()).unwrap();
    assert!(Arc::ptr_eq(&found, &first));
    assert_eq!(found.image_name().as_str(), "one");
    assert_eq!(kernel.stats_snapshot().processes_created, 2);
}

#[test]
fn test_unknown_parent_is_rejected() {
    let kernel = kernel();
    let result = kernel.create_process(ProcessOptions::new("orphan").with_parent(0xFFF0));
    assert!(matches!(result, Err(KernelError::InvalidCid(0xFFF0))));
}

#[test]
fn test_thread_kind_must_match_process() {
    let kernel = kernel();
    let process = kernel.create_process(ProcessOptions::new("app")).unwrap();

    let system_in_user = kernel.create_thread(&process, ThreadOptions::system(), idle);
    assert!(matches!(system_in_user, Err(KernelError::InvalidParameter(_))));

    let system = kernel.system_process().clone();
    let user_in_system = kernel.create_thread(&system, ThreadOptions::user(), idle);
    assert!(matches!(user_in_system, Err(KernelError::InvalidParameter(_))));

    assert_eq!(process.thread_count(), 0);
    assert_eq!(system.thread_count(), 0);
}

#[test]
fn test_created_threads_are_registered() {
    let kernel = kernel();
    let log = Arc::new(CreateLog::default());
    kernel.register_thread_notify(log.clone());

    let process = kernel.create_process(ProcessOptions::new("app")).unwrap();
    let thread = kernel
        .create_thread(&process, ThreadOptions::user(), idle)
        .unwrap();

    assert_eq!(thread.pid(), process.pid());
    assert!(thread.has_teb());
    assert!(thread.has_kernel_stack());
    assert_eq!(process.active_threads(), 1);
    assert!(Arc::ptr_eq(
        &kernel.lookup_thread(thread.tid()).unwrap(),
        &thread
    ));
    assert_eq!(*log.created.lock(), vec![(process.pid(), thread.tid())]);
    assert!(wait_until(WAIT, || thread.ran_body()));
}

#[test]
fn test_kernel_stack_failure_leaves_nothing_behind() {
    let stacks = Arc::new(SimulatedStacks::new());
    let kernel = Kernel::builder()
        .with_config(KernelConfig::testing())
        .with_stacks(stacks.clone())
        .build()
        .unwrap();
    let process = kernel.create_process(ProcessOptions::new("app")).unwrap();

    stacks.fail_next(1);
    let result = kernel.create_thread(&process, ThreadOptions::user(), idle);
    assert!(matches!(result, Err(KernelError::InsufficientResources(_))));
    assert_eq!(process.thread_count(), 0);
    assert_eq!(process.active_threads(), 0);
    assert_eq!(stacks.live(), 0);
}

#[test]
fn test_user_stack_failure_frees_kernel_stack() {
    let stacks = Arc::new(SimulatedStacks::new());
    let pool = Arc::new(SimulatedPool::default());
    let kernel = Kernel::builder()
        .with_config(KernelConfig::testing())
        .with_stacks(stacks.clone())
        .with_pool(pool.clone())
        .build()
        .unwrap();
    let process = kernel.create_process(ProcessOptions::new("app")).unwrap();

    pool.fail_next(1);
    let result = kernel.create_thread(
        &process,
        ThreadOptions::user().with_user_stack(64 * 1024, true),
        idle,
    );
    assert!(matches!(result, Err(KernelError::InsufficientResources(_))));
    assert_eq!(stacks.live(), 0);
    assert_eq!(pool.in_use(), 0);
    assert_eq!(process.thread_count(), 0);
}

#[test]
fn test_open_requires_a_live_cid() {
    let kernel = kernel();
    assert!(matches!(
        kernel.open_process(0xFFF0, AccessMask::PROCESS_ALL_ACCESS),
        Err(KernelError::InvalidCid(0xFFF0))
    ));
    assert!(matches!(
        kernel.open_thread(0xFFF4, AccessMask::THREAD_ALL_ACCESS),
        Err(KernelError::InvalidCid(0xFFF4))
    ));
}

#[test]
fn test_handles_close_once() {
    let kernel = kernel();
    let process = kernel.create_process(ProcessOptions::new("app")).unwrap();
    let handle = kernel
        .open_process(process.pid(), AccessMask::PROCESS_ALL_ACCESS)
        .unwrap();

    assert_eq!(kernel.close_handle(handle), Status::SUCCESS);
    assert_eq!(kernel.close_handle(handle), Status::INVALID_HANDLE);
    assert_eq!(kernel.close_handle(Handle::CURRENT_PROCESS), Status::SUCCESS);
    assert_eq!(
        kernel.terminate_process(Some(handle), Status::SUCCESS),
        Status::INVALID_HANDLE
    );
}

#[test]
fn test_thread_handle_is_not_a_process_handle() {
    let kernel = kernel();
    let process = kernel.create_process(ProcessOptions::new("app")).unwrap();
    let thread = kernel
        .create_thread(&process, ThreadOptions::user(), idle)
        .unwrap();
    let handle = kernel
        .open_thread(thread.tid(), AccessMask::THREAD_ALL_ACCESS)
        .unwrap();

    assert_eq!(
        kernel.terminate_process(Some(handle), Status::SUCCESS),
        Status::INVALID_HANDLE
    );
    assert!(!process.is_delete_marked());
}

#[test]
fn test_empty_process_has_nothing_to_terminate() {
    let kernel = kernel();
    let process = kernel.create_process(ProcessOptions::new("empty")).unwrap();
    let handle = kernel
        .open_process(process.pid(), AccessMask::PROCESS_TERMINATE)
        .unwrap();

    assert_eq!(
        kernel.terminate_process(Some(handle), Status(0x5)),
        Status::NOTHING_TO_TERMINATE
    );
    assert!(process.handles().is_killed());
    assert!(process.has_flag(ProcessFlags::DELETE));

    let result = kernel.create_thread(&process, ThreadOptions::user(), idle);
    assert!(matches!(
        result,
        Err(KernelError::ProcessIsTerminating(pid)) if pid == process.pid()
    ));
}

#[test]
fn test_system_process_cannot_be_terminated() {
    let kernel = kernel();
    let handle = kernel
        .open_process(SYSTEM_PID, AccessMask::PROCESS_ALL_ACCESS)
        .unwrap();
    assert_eq!(
        kernel.terminate_process(Some(handle), Status::SUCCESS),
        Status::ACCESS_DENIED
    );
    assert!(!kernel.system_process().is_delete_marked());
}

#[test]
fn test_jobs_get_distinct_ids() {
    let kernel = kernel();
    let first = kernel.create_job();
    let second = kernel.create_job();
    assert_ne!(first.id(), second.id());

    let member = kernel
        .create_process(ProcessOptions::new("member").with_job(first.clone()))
        .unwrap();
    let members = first.processes();
    assert_eq!(members.len(), 1);
    assert!(Arc::ptr_eq(&members[0], &member));
    assert_eq!(first.accounting().total_processes, 1);
    assert_eq!(first.accounting().active_processes, 1);
    assert!(second.processes().is_empty());
}
