/*!
 * Thread Termination Tests
 * Self and cross-thread termination, idempotence and the last-thread race
 */

use crate::common::{idle, kernel, wait_until, WAIT};
use ps_lifecycle::core::bugcheck::as_bugcheck;
use ps_lifecycle::kernel::ProcessNotify;
use ps_lifecycle::process::{
    AuditLog, CrossThreadFlags, PortMessage, QueuePort, SimulatedStacks, ThreadState,
};
use ps_lifecycle::{
    AccessMask, BugCheckCode, Handle, Kernel, KernelConfig, Pid, ProcessOptions, Status,
    ThreadOptions,
};
use pretty_assertions::assert_eq;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};

#[derive(Default)]
struct ExitCounter {
    exits: AtomicUsize,
}

impl ProcessNotify for ExitCounter {
    fn process_exited(&self, _pid: Pid, _status: Status) {
        self.exits.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_self_termination_notifies_port_once_and_reaps_off_thread() {
    let stacks = Arc::new(SimulatedStacks::new());
    let kernel = Kernel::builder()
        .with_config(KernelConfig::testing())
        .with_stacks(stacks.clone())
        .build()
        .unwrap();
    let process = kernel.create_process(ProcessOptions::new("notepad")).unwrap();
    let _sibling = kernel
        .create_thread(&process, ThreadOptions::user(), idle)
        .unwrap();

    let (port, messages) = QueuePort::new();
    let (host_tx, host_rx) = flume::bounded(1);
    let target = kernel
        .create_thread(&process, ThreadOptions::user(), move |ctx| {
            ctx.register_termination_port(port).unwrap();
            host_tx.send(std::thread::current().id()).unwrap();
            let status = ctx.kernel().terminate_thread(None, Status::ACCESS_VIOLATION);
            panic!("self termination returned {}", status);
        })
        .unwrap();

    assert!(target.exited().wait(Some(WAIT)));
    assert_eq!(target.exit_status(), Status::ACCESS_VIOLATION);
    assert!(!process.exited().is_set());
    assert_eq!(process.active_threads(), 1);

    let host = host_rx.recv_timeout(WAIT).unwrap();
    assert!(wait_until(WAIT, || target.state() == ThreadState::Reaped));
    assert!(!stacks.is_live(target.tid()));

    let releases: Vec<_> = stacks
        .releases()
        .into_iter()
        .filter(|r| r.tid == target.tid())
        .collect();
    assert_eq!(releases.len(), 1);
    assert_ne!(releases[0].released_on, host);
    assert_eq!(releases[0].released_on, kernel.reaper().worker_thread());

    let received: Vec<PortMessage> = messages.try_iter().collect();
    assert_eq!(received.len(), 1);
    assert!(matches!(
        received[0],
        PortMessage::ClientDied { pid, tid, .. } if pid == process.pid() && tid == target.tid()
    ));
    assert_eq!(kernel.halted(), None);
}

#[test]
fn test_terminate_process_runs_rundown_once() {
    let audit = Arc::new(AuditLog::default());
    let kernel = Kernel::builder()
        .with_config(KernelConfig::testing())
        .with_audit(audit.clone())
        .build()
        .unwrap();
    let exits = Arc::new(ExitCounter::default());
    kernel.register_process_notify(exits.clone());

    let process = kernel.create_process(ProcessOptions::new("worker")).unwrap();
    let threads: Vec<_> = (0..3)
        .map(|_| {
            kernel
                .create_thread(&process, ThreadOptions::user(), idle)
                .unwrap()
        })
        .collect();
    assert!(wait_until(WAIT, || threads.iter().all(|t| t.ran_body())));

    let status = Status(0x0000_1234);
    let handle = kernel
        .open_process(process.pid(), AccessMask::PROCESS_TERMINATE)
        .unwrap();
    assert_eq!(kernel.terminate_process(Some(handle), status), Status::SUCCESS);

    for thread in &threads {
        assert!(thread.exited().wait(Some(WAIT)));
        assert_eq!(thread.exit_status(), status);
    }
    assert!(process.exited().wait(Some(WAIT)));
    assert_eq!(process.exit_status(), status);
    assert!(process.exit_time().is_some());
    assert_eq!(exits.exits.load(Ordering::SeqCst), 1);
    assert_eq!(
        audit
            .records()
            .iter()
            .filter(|r| r.pid == process.pid())
            .count(),
        1
    );
    assert_eq!(kernel.stats_snapshot().processes_exited, 1);
}

#[test]
fn test_repeated_termination_is_a_no_op() {
    let stacks = Arc::new(SimulatedStacks::new());
    let kernel = Kernel::builder()
        .with_config(KernelConfig::testing())
        .with_stacks(stacks.clone())
        .build()
        .unwrap();
    let process = kernel.create_process(ProcessOptions::new("victim")).unwrap();

    let (port, messages) = QueuePort::new();
    let (ready_tx, ready_rx) = flume::bounded(1);
    let thread = kernel
        .create_thread(&process, ThreadOptions::user(), move |ctx| {
            ctx.register_termination_port(port).unwrap();
            ready_tx.send(()).unwrap();
            idle(ctx);
        })
        .unwrap();
    ready_rx.recv_timeout(WAIT).unwrap();

    let handle = kernel
        .open_thread(thread.tid(), AccessMask::THREAD_TERMINATE)
        .unwrap();
    let status = Status(0x0000_0042);
    assert_eq!(kernel.terminate_thread(Some(handle), status), Status::SUCCESS);
    assert_eq!(kernel.terminate_thread(Some(handle), status), Status::SUCCESS);

    assert!(thread.exited().wait(Some(WAIT)));
    assert_eq!(thread.exit_status(), status);
    assert!(wait_until(WAIT, || thread.state() == ThreadState::Reaped));

    // Long gone by now, still a no-op
    assert_eq!(
        kernel.terminate_thread(Some(handle), Status(0x99)),
        Status::SUCCESS
    );
    assert_eq!(thread.exit_status(), status);

    assert_eq!(messages.try_iter().count(), 1);
    assert_eq!(
        stacks
            .releases()
            .iter()
            .filter(|r| r.tid == thread.tid())
            .count(),
        1
    );
    assert_eq!(kernel.stats_snapshot().duplicate_terminations, 2);
}

#[test]
fn test_exactly_one_last_thread() {
    const THREADS: usize = 8;

    let audit = Arc::new(AuditLog::default());
    let kernel = Kernel::builder()
        .with_config(KernelConfig::testing())
        .with_audit(audit.clone())
        .build()
        .unwrap();
    let exits = Arc::new(ExitCounter::default());
    kernel.register_process_notify(exits.clone());

    let process = kernel.create_process(ProcessOptions::new("racer")).unwrap();
    let barrier = Arc::new(Barrier::new(THREADS));
    let threads: Vec<_> = (0..THREADS)
        .map(|_| {
            let barrier = barrier.clone();
            kernel
                .create_thread(&process, ThreadOptions::user(), move |ctx| {
                    barrier.wait();
                    ctx.kernel()
                        .terminate_thread(Some(Handle::CURRENT_THREAD), Status::SUCCESS);
                })
                .unwrap()
        })
        .collect();

    for thread in &threads {
        assert!(thread.exited().wait(Some(WAIT)));
    }
    assert!(process.exited().wait(Some(WAIT)));
    assert_eq!(process.active_threads(), 0);
    assert_eq!(exits.exits.load(Ordering::SeqCst), 1);
    assert_eq!(audit.records().len(), 1);
    assert!(process.handles().is_killed());
}

#[test]
fn test_sibling_terminates_sibling() {
    let kernel = kernel();
    let process = kernel.create_process(ProcessOptions::new("pair")).unwrap();
    let victim = kernel
        .create_thread(&process, ThreadOptions::user(), idle)
        .unwrap();

    let victim_tid = victim.tid();
    let (tx, rx) = flume::bounded(1);
    let _killer = kernel
        .create_thread(&process, ThreadOptions::user(), move |ctx| {
            let kernel = ctx.kernel();
            let handle = kernel
                .open_thread(victim_tid, AccessMask::THREAD_TERMINATE)
                .unwrap();
            tx.send(kernel.terminate_thread(Some(handle), Status(0x77)))
                .unwrap();
        })
        .unwrap();

    assert_eq!(rx.recv_timeout(WAIT).unwrap(), Status::SUCCESS);
    assert!(victim.exited().wait(Some(WAIT)));
    assert_eq!(victim.exit_status(), Status(0x77));
    assert!(process.exited().wait(Some(WAIT)));
}

#[test]
fn test_last_thread_cannot_terminate_itself_by_null_handle() {
    let kernel = kernel();
    let process = kernel.create_process(ProcessOptions::new("lonely")).unwrap();
    let (tx, rx) = flume::bounded(1);
    let thread = kernel
        .create_thread(&process, ThreadOptions::user(), move |ctx| {
            tx.send(ctx.kernel().terminate_thread(None, Status::ACCESS_VIOLATION))
                .unwrap();
        })
        .unwrap();

    assert_eq!(rx.recv_timeout(WAIT).unwrap(), Status::CANT_TERMINATE_SELF);
    assert!(thread.exited().wait(Some(WAIT)));
    assert_eq!(thread.exit_status(), Status::SUCCESS);
}

#[test]
fn test_terminate_requires_access() {
    let kernel = kernel();
    let process = kernel.create_process(ProcessOptions::new("guarded")).unwrap();
    let thread = kernel
        .create_thread(&process, ThreadOptions::user(), idle)
        .unwrap();

    let weak = kernel
        .open_thread(thread.tid(), AccessMask::THREAD_QUERY_INFORMATION)
        .unwrap();
    assert_eq!(
        kernel.terminate_thread(Some(weak), Status::SUCCESS),
        Status::ACCESS_DENIED
    );
    assert_eq!(
        kernel.terminate_thread(Some(Handle(0x7FF0)), Status::SUCCESS),
        Status::INVALID_HANDLE
    );
    assert!(!thread.is_terminating());

    let weak_process = kernel
        .open_process(process.pid(), AccessMask::PROCESS_QUERY_INFORMATION)
        .unwrap();
    assert_eq!(
        kernel.terminate_process(Some(weak_process), Status::SUCCESS),
        Status::ACCESS_DENIED
    );
    assert_eq!(
        kernel.terminate_process(None, Status::SUCCESS),
        Status::ACCESS_DENIED
    );
}

#[test]
fn test_system_threads_only_exit_themselves() {
    let kernel = kernel();
    let system = kernel.system_process().clone();
    let worker = kernel
        .create_thread(&system, ThreadOptions::system(), idle)
        .unwrap();

    let handle = kernel
        .open_thread(worker.tid(), AccessMask::THREAD_ALL_ACCESS)
        .unwrap();
    assert_eq!(
        kernel.terminate_thread(Some(handle), Status::SUCCESS),
        Status::ACCESS_DENIED
    );
    assert!(!worker.is_terminating());
    assert_eq!(kernel.terminate_system_thread(Status::SUCCESS), Status::INVALID_PARAMETER);

    let exiting = kernel
        .create_thread(&system, ThreadOptions::system(), |ctx| {
            let status = ctx.kernel().terminate_system_thread(Status(0x55));
            panic!("system thread exit returned {}", status);
        })
        .unwrap();
    assert!(exiting.exited().wait(Some(WAIT)));
    assert_eq!(exiting.exit_status(), Status(0x55));
}

#[test]
fn test_terminated_before_first_run_is_dead_on_arrival() {
    let kernel = kernel();
    let process = kernel.create_process(ProcessOptions::new("stillborn")).unwrap();
    let thread = kernel
        .create_thread(&process, ThreadOptions::user().suspended(), |_ctx| {
            panic!("body of a dead-on-arrival thread ran");
        })
        .unwrap();

    let handle = kernel
        .open_thread(thread.tid(), AccessMask::THREAD_TERMINATE)
        .unwrap();
    assert_eq!(
        kernel.terminate_thread(Some(handle), Status::ACCESS_VIOLATION),
        Status::SUCCESS
    );

    assert!(thread.exited().wait(Some(WAIT)));
    assert!(thread.has_flag(CrossThreadFlags::DEAD_ON_ARRIVAL));
    assert!(!thread.ran_body());
    assert_eq!(thread.exit_status(), Status::THREAD_IS_TERMINATING);
}

#[test]
fn test_panicking_body_exits_with_unhandled_exception() {
    let kernel = kernel();
    let process = kernel.create_process(ProcessOptions::new("crashy")).unwrap();
    let thread = kernel
        .create_thread(&process, ThreadOptions::user(), |_ctx| {
            panic!("simulated fault");
        })
        .unwrap();

    assert!(thread.exited().wait(Some(WAIT)));
    assert_eq!(thread.exit_status(), Status::UNHANDLED_EXCEPTION);
    assert!(process.exited().wait(Some(WAIT)));
    assert_eq!(kernel.halted(), None);
}

#[test]
fn test_critical_thread_termination_halts_without_debugger() {
    let kernel = kernel();
    let process = kernel.create_process(ProcessOptions::new("csrss")).unwrap();
    let thread = kernel
        .create_thread(&process, ThreadOptions::user().critical(), idle)
        .unwrap();
    let handle = kernel
        .open_thread(thread.tid(), AccessMask::THREAD_TERMINATE)
        .unwrap();

    let payload = catch_unwind(AssertUnwindSafe(|| {
        kernel.terminate_thread(Some(handle), Status::SUCCESS)
    }))
    .unwrap_err();
    let check = as_bugcheck(payload.as_ref()).unwrap();
    assert_eq!(check.code, BugCheckCode::CriticalObjectTermination);
    assert_eq!(
        kernel.halted().map(|c| c.code),
        Some(BugCheckCode::CriticalObjectTermination)
    );
    assert!(!thread.is_terminating());
}

#[test]
fn test_critical_thread_termination_breaks_into_debugger() {
    let kernel = Kernel::builder()
        .with_config(KernelConfig::testing().with_debugger(true))
        .build()
        .unwrap();
    let process = kernel.create_process(ProcessOptions::new("csrss")).unwrap();
    let thread = kernel
        .create_thread(&process, ThreadOptions::user().critical(), idle)
        .unwrap();
    let handle = kernel
        .open_thread(thread.tid(), AccessMask::THREAD_TERMINATE)
        .unwrap();

    assert_eq!(
        kernel.terminate_thread(Some(handle), Status(0x10)),
        Status::SUCCESS
    );
    assert!(thread.exited().wait(Some(WAIT)));
    assert_eq!(thread.exit_status(), Status(0x10));
    assert_eq!(kernel.halted(), None);
}

#[test]
fn test_critical_process_death_is_recorded() {
    let kernel = kernel();
    let process = kernel
        .create_process(ProcessOptions::new("wininit").critical())
        .unwrap();
    let _thread = kernel
        .create_thread(&process, ThreadOptions::user(), |_ctx| {})
        .unwrap();

    assert!(wait_until(WAIT, || kernel.halted().is_some()));
    assert_eq!(
        kernel.halted().map(|c| c.code),
        Some(BugCheckCode::CriticalProcessDied)
    );
}
