/*!
 * Context Tests
 * Get and set register state through a target thread's callbacks
 */

use crate::common::{idle, kernel, wait_until, WAIT};
use ps_lifecycle::process::context::{USER_CS, USER_SS};
use ps_lifecycle::{
    AccessMask, Context, ContextFlags, Handle, Kernel, KernelConfig, KernelError, ProcessOptions,
    ProcessorMode, Status, ThreadOptions,
};
use pretty_assertions::assert_eq;
use serial_test::serial;
use std::time::Duration;

#[test]
fn test_get_context_reads_target_registers() {
    let kernel = kernel();
    let process = kernel.create_process(ProcessOptions::new("target")).unwrap();
    let (ready_tx, ready_rx) = flume::bounded(1);
    let thread = kernel
        .create_thread(&process, ThreadOptions::user(), move |ctx| {
            ctx.update_registers(|regs| {
                regs.ip = 0x1000;
                regs.sp = 0x7FF0;
                regs.gpr[0] = 42;
                regs.dr[0] = 0xDEAD;
            });
            ready_tx.send(()).unwrap();
            idle(ctx);
        })
        .unwrap();
    ready_rx.recv_timeout(WAIT).unwrap();

    let handle = kernel
        .open_thread(thread.tid(), AccessMask::THREAD_GET_CONTEXT)
        .unwrap();
    let context = kernel
        .get_context(handle, ContextFlags::FULL, ProcessorMode::User)
        .unwrap();

    assert_eq!(context.flags, ContextFlags::FULL);
    assert_eq!(context.ip, 0x1000);
    assert_eq!(context.sp, 0x7FF0);
    assert_eq!(context.gpr[0], 42);
    // Not requested
    assert_eq!(context.dr[0], 0);
    assert!(kernel.stats_snapshot().apcs_queued >= 1);
}

#[test]
fn test_set_context_sanitizes_user_requests() {
    let kernel = kernel();
    let process = kernel.create_process(ProcessOptions::new("target")).unwrap();
    let thread = kernel
        .create_thread(&process, ThreadOptions::user(), idle)
        .unwrap();
    let handle = kernel
        .open_thread(
            thread.tid(),
            AccessMask::THREAD_SET_CONTEXT.union(AccessMask::THREAD_GET_CONTEXT),
        )
        .unwrap();

    let mut request = Context::request(ContextFlags::CONTROL.union(ContextFlags::DEBUG_REGISTERS));
    request.ip = 0x2000;
    request.seg_cs = 0x10;
    request.seg_ss = 0x18;
    request.dr[0] = 0xFFFF_8000_0000_0000;
    request.dr[1] = 0x4000;
    assert_eq!(
        kernel.set_context(handle, &request, ProcessorMode::User),
        Status::SUCCESS
    );

    let frame = thread.trap_frame();
    assert_eq!(frame.ip, 0x2000);
    assert_eq!(frame.seg_cs, USER_CS);
    assert_eq!(frame.seg_ss, USER_SS);
    assert_eq!(frame.dr[0], 0);
    assert_eq!(frame.dr[1], 0x4000);

    assert_eq!(
        kernel.set_context(handle, &request, ProcessorMode::Kernel),
        Status::SUCCESS
    );
    let frame = thread.trap_frame();
    assert_eq!(frame.seg_cs, 0x10);
    assert_eq!(frame.dr[0], 0xFFFF_8000_0000_0000);
}

#[test]
fn test_own_context_is_captured_inline() {
    let kernel = kernel();
    let process = kernel.create_process(ProcessOptions::new("self")).unwrap();
    let (tx, rx) = flume::bounded(1);
    let _thread = kernel
        .create_thread(&process, ThreadOptions::user(), move |ctx| {
            ctx.update_registers(|regs| regs.ip = 0x4242);
            let result = ctx.kernel().get_context(
                Handle::CURRENT_THREAD,
                ContextFlags::CONTROL,
                ProcessorMode::User,
            );
            tx.send(result.map(|c| c.ip)).unwrap();
        })
        .unwrap();

    assert_eq!(rx.recv_timeout(WAIT).unwrap(), Ok(0x4242));
    assert_eq!(kernel.stats_snapshot().apcs_inline, 1);
}

#[test]
fn test_suspended_thread_still_answers() {
    let kernel = kernel();
    let process = kernel.create_process(ProcessOptions::new("frozen")).unwrap();
    let thread = kernel
        .create_thread(&process, ThreadOptions::user().suspended(), idle)
        .unwrap();
    let handle = kernel
        .open_thread(thread.tid(), AccessMask::THREAD_ALL_ACCESS)
        .unwrap();

    let mut request = Context::request(ContextFlags::INTEGER);
    request.gpr[3] = 7;
    assert_eq!(
        kernel.set_context(handle, &request, ProcessorMode::User),
        Status::SUCCESS
    );
    let context = kernel
        .get_context(handle, ContextFlags::INTEGER, ProcessorMode::User)
        .unwrap();
    assert_eq!(context.gpr[3], 7);
    assert!(!thread.ran_body());

    kernel.resume_thread(&thread);
    assert!(wait_until(WAIT, || thread.ran_body()));
}

#[test]
fn test_exited_thread_leaves_buffer_untouched() {
    let kernel = kernel();
    let process = kernel.create_process(ProcessOptions::new("gone")).unwrap();
    let thread = kernel
        .create_thread(&process, ThreadOptions::user(), |_| {})
        .unwrap();
    let handle = kernel
        .open_thread(
            thread.tid(),
            AccessMask::THREAD_GET_CONTEXT.union(AccessMask::THREAD_SET_CONTEXT),
        )
        .unwrap();
    assert!(thread.exited().wait(Some(WAIT)));

    let mut buffer = vec![0xAA; Context::RECORD_SIZE];
    assert_eq!(
        kernel
            .get_context_buffer(handle, ContextFlags::FULL, ProcessorMode::User, &mut buffer)
            .unwrap(),
        Status::THREAD_IS_TERMINATING
    );
    assert!(buffer.iter().all(|b| *b == 0xAA));

    assert!(matches!(
        kernel.get_context(handle, ContextFlags::FULL, ProcessorMode::User),
        Err(KernelError::TargetGone { .. })
    ));
    assert_eq!(
        kernel.set_context(handle, &Context::default(), ProcessorMode::User),
        Status::THREAD_IS_TERMINATING
    );
}

#[test]
fn test_buffers_are_validated_first() {
    let kernel = kernel();
    let process = kernel.create_process(ProcessOptions::new("buffers")).unwrap();
    let thread = kernel
        .create_thread(&process, ThreadOptions::user(), move |ctx| {
            ctx.update_registers(|regs| regs.sp = 0x8000);
            idle(ctx);
        })
        .unwrap();
    assert!(wait_until(WAIT, || thread.ran_body()));
    let handle = kernel
        .open_thread(thread.tid(), AccessMask::THREAD_ALL_ACCESS)
        .unwrap();

    let mut short = vec![0u8; Context::RECORD_SIZE - 1];
    assert!(matches!(
        kernel.get_context_buffer(handle, ContextFlags::FULL, ProcessorMode::User, &mut short),
        Err(KernelError::BufferValidation { .. })
    ));
    assert!(matches!(
        kernel.set_context_buffer(handle, &short, ProcessorMode::User),
        Err(KernelError::BufferValidation { .. })
    ));

    let mut buffer = vec![0u8; Context::RECORD_SIZE];
    assert_eq!(
        kernel
            .get_context_buffer(handle, ContextFlags::CONTROL, ProcessorMode::User, &mut buffer)
            .unwrap(),
        Status::SUCCESS
    );
    let decoded = Context::from_bytes(&buffer).unwrap();
    assert_eq!(decoded.flags, ContextFlags::CONTROL);
    assert_eq!(decoded.sp, 0x8000);

    let mut request = Context::request(ContextFlags::CONTROL);
    request.sp = 0x9000;
    assert_eq!(
        kernel
            .set_context_buffer(handle, &request.to_bytes(), ProcessorMode::User)
            .unwrap(),
        Status::SUCCESS
    );
    assert_eq!(thread.trap_frame().sp, 0x9000);
}

#[test]
fn test_requests_are_checked_before_delivery() {
    let kernel = kernel();
    let process = kernel.create_process(ProcessOptions::new("checked")).unwrap();
    let thread = kernel
        .create_thread(&process, ThreadOptions::user(), idle)
        .unwrap();

    let query_only = kernel
        .open_thread(thread.tid(), AccessMask::THREAD_QUERY_INFORMATION)
        .unwrap();
    assert!(matches!(
        kernel.get_context(query_only, ContextFlags::FULL, ProcessorMode::User),
        Err(KernelError::AccessDenied { .. })
    ));
    assert_eq!(
        kernel.set_context(query_only, &Context::default(), ProcessorMode::User),
        Status::ACCESS_DENIED
    );

    let full = kernel
        .open_thread(thread.tid(), AccessMask::THREAD_ALL_ACCESS)
        .unwrap();
    assert!(matches!(
        kernel.get_context(full, ContextFlags(0x1), ProcessorMode::User),
        Err(KernelError::InvalidParameter(_))
    ));
    assert!(matches!(
        kernel.get_context(full, ContextFlags(0x0010_0100), ProcessorMode::User),
        Err(KernelError::InvalidParameter(_))
    ));
    assert_eq!(kernel.stats_snapshot().apcs_queued, 0);
}

#[test]
fn test_system_threads_hide_from_user_requests() {
    let kernel = kernel();
    let system = kernel.system_process().clone();
    let worker = kernel
        .create_thread(&system, ThreadOptions::system(), |ctx| {
            ctx.update_registers(|regs| regs.ip = 0xFFFF_F800_0000_1000);
            idle(ctx);
        })
        .unwrap();
    assert!(wait_until(WAIT, || worker.ran_body()));
    let handle = kernel
        .open_thread(worker.tid(), AccessMask::THREAD_ALL_ACCESS)
        .unwrap();

    assert!(matches!(
        kernel.get_context(handle, ContextFlags::CONTROL, ProcessorMode::User),
        Err(KernelError::InvalidHandle(_))
    ));
    let context = kernel
        .get_context(handle, ContextFlags::CONTROL, ProcessorMode::Kernel)
        .unwrap();
    assert_eq!(context.ip, 0xFFFF_F800_0000_1000);
}

#[test]
#[serial]
fn test_bounded_wait_gives_up_on_a_busy_target() {
    let kernel = Kernel::builder()
        .with_config(KernelConfig::testing().with_context_timeout(Duration::from_millis(30)))
        .build()
        .unwrap();
    let process = kernel.create_process(ProcessOptions::new("busy")).unwrap();
    let (go_tx, go_rx) = flume::bounded::<()>(1);
    let thread = kernel
        .create_thread(&process, ThreadOptions::user(), move |ctx| {
            // No delivery point until released
            let _ = go_rx.recv();
            idle(ctx);
        })
        .unwrap();
    assert!(wait_until(WAIT, || thread.ran_body()));
    let handle = kernel
        .open_thread(thread.tid(), AccessMask::THREAD_GET_CONTEXT)
        .unwrap();

    assert_eq!(
        kernel.get_context(handle, ContextFlags::CONTROL, ProcessorMode::User),
        Err(KernelError::Timeout)
    );

    go_tx.send(()).unwrap();
    assert!(kernel
        .get_context(handle, ContextFlags::CONTROL, ProcessorMode::User)
        .is_ok());
    assert_eq!(thread.info().pending_kernel_apcs, 0);
}
