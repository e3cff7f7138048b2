/*!
 * Ledger Tests
 * Charge, expansion and return on raw blocks
 */

use ps_lifecycle::core::bugcheck::as_bugcheck;
use ps_lifecycle::quota::{QuotaBlockRef, QuotaKind, QuotaLedger, QuotaLimits};
use ps_lifecycle::{BugCheckCode, KernelError, QuotaConfig};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Barrier;

fn ledger(capacity: usize) -> QuotaLedger {
    QuotaLedger::with_pool_backing(
        QuotaConfig::default()
            .with_backing_capacity(QuotaLimits::new(capacity, capacity, 0))
            .with_expansion_increment(1)
            .without_giveback(),
    )
}

/// Block with `limit` on both pool kinds and `charged` already non-paged
fn loaded_block(ledger: &QuotaLedger, limit: usize, charged: usize) -> QuotaBlockRef {
    let block = ledger.create_block(QuotaLimits::new(limit, limit, 0));
    ledger.charge(&block, QuotaKind::NonPaged, charged).unwrap();
    block
}

/// Charge both amounts to `block` at once; returns which succeeded
fn race(ledger: &QuotaLedger, block: &QuotaBlockRef, a: usize, b: usize) -> (bool, bool) {
    let barrier = Barrier::new(2);
    std::thread::scope(|s| {
        let first = s.spawn(|| {
            barrier.wait();
            ledger.charge(block, QuotaKind::NonPaged, a).is_ok()
        });
        let second = s.spawn(|| {
            barrier.wait();
            ledger.charge(block, QuotaKind::NonPaged, b).is_ok()
        });
        (first.join().unwrap(), second.join().unwrap())
    })
}

#[test]
fn test_concurrent_charges_expand_once() {
    for _ in 0..50 {
        let ledger = ledger(1000);
        let block = loaded_block(&ledger, 100, 90);

        assert_eq!(race(&ledger, &block, 8, 7), (true, true));
        let entry = block.entry(QuotaKind::NonPaged);
        assert_eq!(entry.usage(), 105);
        assert_eq!(entry.limit(), 105);
        assert_eq!(ledger.stats().expansions, 1);
    }
}

#[test]
fn test_concurrent_charges_with_exhausted_backing() {
    for _ in 0..50 {
        let ledger = ledger(0);
        let block = loaded_block(&ledger, 100, 90);

        let outcome = race(&ledger, &block, 8, 7);
        let usage = block.entry(QuotaKind::NonPaged).usage();
        match outcome {
            (true, false) => assert_eq!(usage, 98),
            (false, true) => assert_eq!(usage, 97),
            other => panic!("expected exactly one charge to land, got {:?}", other),
        }
        assert_eq!(ledger.stats().failures, 1);
        assert_eq!(ledger.stats().expansions, 0);
    }
}

#[test]
fn test_refused_charge_reports_kind() {
    let ledger = ledger(0);
    let block = loaded_block(&ledger, 10, 0);
    assert_eq!(
        ledger.charge(&block, QuotaKind::Paged, 11),
        Err(KernelError::QuotaExceeded {
            kind: QuotaKind::Paged
        })
    );
    assert_eq!(
        KernelError::QuotaExceeded {
            kind: QuotaKind::PageFile
        }
        .status(),
        ps_lifecycle::Status::PAGEFILE_QUOTA_EXCEEDED
    );
    assert_eq!(block.entry(QuotaKind::Paged).usage(), 0);
}

#[test]
fn test_zero_amounts_are_free() {
    let ledger = ledger(0);
    let block = loaded_block(&ledger, 0, 0);
    ledger.charge(&block, QuotaKind::NonPaged, 0).unwrap();
    ledger.return_quota(&block, QuotaKind::NonPaged, 0);
    assert_eq!(ledger.stats().charges, 0);
    assert_eq!(ledger.stats().returns, 0);
}

#[test]
fn test_giveback_hands_slack_to_backing_store() {
    let ledger = QuotaLedger::with_pool_backing(
        QuotaConfig::default()
            .with_backing_capacity(QuotaLimits::new(1000, 1000, 0))
            .with_expansion_increment(100)
            .with_giveback(10, 50),
    );
    let block = ledger.create_block(QuotaLimits::new(0, 0, 0));
    ledger.charge(&block, QuotaKind::NonPaged, 100).unwrap();
    assert_eq!(
        ledger.backing_store().available(QuotaKind::NonPaged),
        900
    );

    ledger.return_quota(&block, QuotaKind::NonPaged, 100);
    let entry = block.entry(QuotaKind::NonPaged);
    assert_eq!(entry.usage(), 0);
    assert_eq!(entry.limit(), 50);
    // 50 pending was over the threshold, so it went straight back
    assert_eq!(entry.pending_return(), 0);
    assert_eq!(
        ledger.backing_store().available(QuotaKind::NonPaged),
        950
    );
    assert_eq!(ledger.stats().givebacks, 1);
}

#[test]
fn test_default_block_never_gives_back() {
    let ledger = QuotaLedger::with_pool_backing(QuotaConfig::default().with_giveback(0, 1));
    let block = ledger.default_block();
    assert!(block.is_default());
    ledger.charge(&block, QuotaKind::Paged, 64).unwrap();
    ledger.return_quota(&block, QuotaKind::Paged, 64);
    assert_eq!(ledger.stats().givebacks, 0);
    assert_eq!(block.entry(QuotaKind::Paged).pending_return(), 0);
}

#[test]
fn test_destroyed_block_returns_residual_limit() {
    let ledger = ledger(1000);
    let block = ledger.create_block(QuotaLimits::new(0, 0, 0));
    ledger.charge(&block, QuotaKind::NonPaged, 40).unwrap();
    ledger.return_quota(&block, QuotaKind::NonPaged, 40);
    assert_eq!(ledger.backing_store().available(QuotaKind::NonPaged), 960);

    drop(block);
    assert_eq!(ledger.backing_store().available(QuotaKind::NonPaged), 1000);
    assert_eq!(ledger.live_blocks(), 1);
}

#[test]
fn test_over_return_halts() {
    let ledger = ledger(0);
    let block = loaded_block(&ledger, 100, 10);

    let payload = catch_unwind(AssertUnwindSafe(|| {
        ledger.return_quota(&block, QuotaKind::NonPaged, 11);
    }))
    .unwrap_err();
    let check = as_bugcheck(payload.as_ref()).unwrap();
    assert_eq!(check.code, BugCheckCode::QuotaUnderflow);
    assert_eq!(check.parameters[2], 11);
    assert_eq!(block.entry(QuotaKind::NonPaged).usage(), 10);
}

#[derive(Debug, Clone)]
enum Op {
    Charge(usize),
    Return(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1usize..64).prop_map(Op::Charge),
        (1usize..64).prop_map(Op::Return),
    ]
}

proptest! {
    #[test]
    fn prop_usage_tracks_net_charges(
        capacity in 0usize..256,
        start in 0usize..64,
        giveback in any::<bool>(),
        ops in prop::collection::vec(op(), 1..64),
    ) {
        let config = QuotaConfig::default()
            .with_backing_capacity(QuotaLimits::new(capacity, capacity, 0))
            .with_expansion_increment(8);
        let config = if giveback { config.with_giveback(16, 8) } else { config.without_giveback() };
        let ledger = QuotaLedger::with_pool_backing(config);
        let block = ledger.create_block(QuotaLimits::new(start, start, 0));

        let mut net = 0usize;
        for op in ops {
            match op {
                Op::Charge(amount) => {
                    if ledger.charge(&block, QuotaKind::NonPaged, amount).is_ok() {
                        net += amount;
                    }
                }
                Op::Return(amount) => {
                    let amount = amount.min(net);
                    ledger.return_quota(&block, QuotaKind::NonPaged, amount);
                    net -= amount;
                }
            }
            let entry = block.entry(QuotaKind::NonPaged);
            prop_assert_eq!(entry.usage(), net);
            prop_assert!(entry.usage() <= entry.limit());
            prop_assert!(entry.peak() >= entry.usage());
        }
    }
}
