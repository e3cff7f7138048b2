/*!
 * Process Quota Tests
 * Attachment, block moves, split returns and shared charges
 */

use crate::common::{kernel, WAIT};
use ps_lifecycle::quota::{ProcessQuota, QuotaSplit};
use ps_lifecycle::{
    AccessMask, KernelError, ProcessOptions, QuotaConfig, QuotaKind, QuotaLedger, QuotaLimits,
    Status, ThreadOptions,
};
use pretty_assertions::assert_eq;
use std::sync::Barrier;

const RACE_ITERATIONS: usize = 200;
const RACE_CHARGES: usize = 64;

#[test]
fn test_moving_off_default_block_splits_returns() {
    let kernel = kernel();
    let ledger = kernel.quota();
    let process = kernel.create_process(ProcessOptions::new("mover")).unwrap();
    let default_block = ledger.default_block();
    let baseline = default_block.entry(QuotaKind::NonPaged).usage();

    ledger
        .charge_process(process.quota(), QuotaKind::NonPaged, 30)
        .unwrap();
    assert_eq!(
        default_block.entry(QuotaKind::NonPaged).usage(),
        baseline + 30
    );

    let handle = kernel
        .open_process(
            process.pid(),
            AccessMask::PROCESS_SET_QUOTA.union(AccessMask::PROCESS_QUERY_INFORMATION),
        )
        .unwrap();
    assert_eq!(
        kernel.set_quota_limits(handle, QuotaLimits::new(1000, 1000, 1000)),
        Status::SUCCESS
    );
    let attachment = process.quota().attachment().unwrap();
    assert!(!attachment.block().is_default());
    assert_eq!(attachment.default_share(QuotaKind::NonPaged), 30);

    ledger
        .charge_process(process.quota(), QuotaKind::NonPaged, 20)
        .unwrap();
    let own = attachment.block();
    assert_eq!(own.entry(QuotaKind::NonPaged).usage(), 20);
    assert_eq!(process.quota().usage(QuotaKind::NonPaged), 50);

    let snapshot = kernel.query_quota(handle).unwrap();
    assert_eq!(snapshot.usage[QuotaKind::NonPaged.index()], 50);
    assert!(!snapshot.block.is_default);
    assert_eq!(snapshot.block.entry(QuotaKind::NonPaged).usage, 20);

    assert_eq!(
        ledger.return_process(process.quota(), QuotaKind::NonPaged, 40),
        QuotaSplit {
            block: 20,
            default: 20
        }
    );
    assert_eq!(
        ledger.return_process(process.quota(), QuotaKind::NonPaged, 10),
        QuotaSplit {
            block: 0,
            default: 10
        }
    );
    assert_eq!(own.entry(QuotaKind::NonPaged).usage(), 0);
    assert_eq!(default_block.entry(QuotaKind::NonPaged).usage(), baseline);
    assert_eq!(process.quota().peak(QuotaKind::NonPaged), 50);
}

#[test]
fn test_charges_racing_a_block_move_return_to_their_blocks() {
    for _ in 0..RACE_ITERATIONS {
        let ledger = QuotaLedger::with_pool_backing(QuotaConfig::default());
        let quota = ProcessQuota::new(100);
        ledger.inherit(&quota, None);
        let barrier = Barrier::new(2);

        std::thread::scope(|s| {
            s.spawn(|| {
                barrier.wait();
                for _ in 0..RACE_CHARGES {
                    ledger.charge_process(&quota, QuotaKind::Paged, 1).unwrap();
                }
            });
            s.spawn(|| {
                barrier.wait();
                ledger
                    .set_limits(&quota, QuotaLimits::new(1000, 1000, 1000))
                    .unwrap();
            });
        });

        let attachment = quota.attachment().unwrap();
        let own = attachment.block().clone();
        let default_block = ledger.default_block();
        assert_eq!(
            own.entry(QuotaKind::Paged).usage() + default_block.entry(QuotaKind::Paged).usage(),
            RACE_CHARGES
        );
        assert_eq!(
            attachment.default_share(QuotaKind::Paged),
            default_block.entry(QuotaKind::Paged).usage()
        );

        for _ in 0..RACE_CHARGES {
            ledger.return_process(&quota, QuotaKind::Paged, 1);
        }
        assert_eq!(quota.usage(QuotaKind::Paged), 0);
        assert_eq!(own.entry(QuotaKind::Paged).usage(), 0);
        assert_eq!(default_block.entry(QuotaKind::Paged).usage(), 0);
        assert_eq!(attachment.default_share(QuotaKind::Paged), 0);
    }
}

#[test]
fn test_returns_racing_detach_are_not_returned_twice() {
    for round in 0..RACE_ITERATIONS {
        let ledger = QuotaLedger::with_pool_backing(QuotaConfig::default());
        let quota = ProcessQuota::new(100);
        ledger.inherit(&quota, None);
        ledger.charge_process(&quota, QuotaKind::NonPaged, 8).unwrap();
        // Half the rounds race on a block of the process's own
        if round % 2 == 1 {
            ledger
                .set_limits(&quota, QuotaLimits::new(1000, 1000, 1000))
                .unwrap();
        }
        for _ in 0..RACE_CHARGES {
            ledger.charge_process(&quota, QuotaKind::NonPaged, 1).unwrap();
        }
        let own = quota.attachment().unwrap().block().clone();
        let barrier = Barrier::new(2);

        std::thread::scope(|s| {
            s.spawn(|| {
                barrier.wait();
                for _ in 0..RACE_CHARGES {
                    ledger.return_process(&quota, QuotaKind::NonPaged, 1);
                }
            });
            s.spawn(|| {
                barrier.wait();
                ledger.detach(&quota);
            });
        });

        assert!(!quota.is_attached());
        assert_eq!(quota.usage(QuotaKind::NonPaged), 0);
        assert_eq!(own.entry(QuotaKind::NonPaged).usage(), 0);
        assert_eq!(
            ledger.default_block().entry(QuotaKind::NonPaged).usage(),
            0
        );
    }
}

#[test]
fn test_adjusting_own_block_limits() {
    let kernel = kernel();
    let process = kernel.create_process(ProcessOptions::new("tuned")).unwrap();
    let handle = kernel
        .open_process(process.pid(), AccessMask::PROCESS_SET_QUOTA)
        .unwrap();
    assert_eq!(
        kernel.set_quota_limits(handle, QuotaLimits::new(100, 100, 100)),
        Status::SUCCESS
    );
    kernel
        .quota()
        .charge_process(process.quota(), QuotaKind::PageFile, 80)
        .unwrap();

    assert_eq!(
        kernel.set_quota_limits(handle, QuotaLimits::new(100, 100, 50)),
        Status::INVALID_PARAMETER
    );
    assert_eq!(
        kernel.set_quota_limits(handle, QuotaLimits::new(200, 200, 90)),
        Status::SUCCESS
    );
    let block = process.quota().attachment().unwrap().block().clone();
    assert_eq!(block.entry(QuotaKind::PageFile).limit(), 90);
    assert_eq!(
        kernel
            .quota()
            .charge_process(process.quota(), QuotaKind::PageFile, 11),
        Err(KernelError::QuotaExceeded {
            kind: QuotaKind::PageFile
        })
    );
}

#[test]
fn test_set_quota_requires_access() {
    let kernel = kernel();
    let process = kernel.create_process(ProcessOptions::new("locked")).unwrap();
    let handle = kernel
        .open_process(process.pid(), AccessMask::PROCESS_QUERY_INFORMATION)
        .unwrap();
    assert_eq!(
        kernel.set_quota_limits(handle, QuotaLimits::new(1, 1, 1)),
        Status::ACCESS_DENIED
    );
    assert!(process.quota().attachment().unwrap().block().is_default());
}

#[test]
fn test_child_shares_parent_block() {
    let kernel = kernel();
    let parent = kernel.create_process(ProcessOptions::new("parent")).unwrap();
    let handle = kernel
        .open_process(parent.pid(), AccessMask::PROCESS_SET_QUOTA)
        .unwrap();
    assert_eq!(
        kernel.set_quota_limits(handle, QuotaLimits::new(500, 500, 500)),
        Status::SUCCESS
    );

    let child = kernel
        .create_process(ProcessOptions::new("child").with_parent(parent.pid()))
        .unwrap();
    let parent_block = parent.quota().attachment().unwrap().block().clone();
    let child_block = child.quota().attachment().unwrap().block().clone();
    assert!(parent_block.same_block(&child_block));
    assert_eq!(parent_block.process_count(), 2);

    // A parent still on the default block passes the default block on
    let plain = kernel.create_process(ProcessOptions::new("plain")).unwrap();
    let grandchild = kernel
        .create_process(ProcessOptions::new("grandchild").with_parent(plain.pid()))
        .unwrap();
    assert!(grandchild.quota().attachment().unwrap().block().is_default());
}

#[test]
fn test_shared_charge_returns_to_its_block() {
    let kernel = kernel();
    let process = kernel.create_process(ProcessOptions::new("sharer")).unwrap();
    let default_block = kernel.quota().default_block();
    let paged = default_block.entry(QuotaKind::Paged).usage();
    let non_paged = default_block.entry(QuotaKind::NonPaged).usage();

    let charged = kernel
        .charge_shared_pool_quota(&process, 64, 32)
        .unwrap();
    assert!(charged.is_default());
    assert_eq!(default_block.entry(QuotaKind::Paged).usage(), paged + 64);

    // Moving away does not move the shared charge
    let handle = kernel
        .open_process(process.pid(), AccessMask::PROCESS_SET_QUOTA)
        .unwrap();
    assert_eq!(
        kernel.set_quota_limits(handle, QuotaLimits::new(1000, 1000, 1000)),
        Status::SUCCESS
    );
    kernel.return_shared_pool_quota(charged, 64, 32);

    assert_eq!(default_block.entry(QuotaKind::Paged).usage(), paged);
    assert_eq!(default_block.entry(QuotaKind::NonPaged).usage(), non_paged);
    assert_eq!(process.quota().usage(QuotaKind::Paged), 0);
}

#[test]
fn test_exit_returns_outstanding_charges() {
    let kernel = kernel();
    let process = kernel.create_process(ProcessOptions::new("leaky")).unwrap();
    let handle = kernel
        .open_process(
            process.pid(),
            AccessMask::PROCESS_SET_QUOTA.union(AccessMask::PROCESS_QUERY_INFORMATION),
        )
        .unwrap();
    assert_eq!(
        kernel.set_quota_limits(handle, QuotaLimits::new(4096, 4096, 4096)),
        Status::SUCCESS
    );
    let block = process.quota().attachment().unwrap().block().clone();

    let thread = kernel
        .create_thread(&process, ThreadOptions::user(), |ctx| {
            ctx.kernel()
                .quota()
                .charge_process(ctx.process().quota(), QuotaKind::Paged, 256)
                .unwrap();
        })
        .unwrap();
    assert!(thread.exited().wait(Some(WAIT)));
    assert!(process.exited().wait(Some(WAIT)));

    assert!(!process.quota().is_attached());
    assert_eq!(block.entry(QuotaKind::Paged).usage(), 0);
    assert_eq!(block.process_count(), 0);
    assert!(matches!(
        kernel.query_quota(handle),
        Err(KernelError::TargetGone { .. })
    ));
    assert_eq!(
        kernel.set_quota_limits(handle, QuotaLimits::new(1, 1, 1)),
        Status::PROCESS_IS_TERMINATING
    );
}
