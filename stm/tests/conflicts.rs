// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::sync::{Arc, Barrier};
use stm::{JournalKind, LockMode, Stm, StmConfig, TRef, TxError, TxStatus};
use stronghold_stm as stm;

#[cfg(test)]
#[ctor::ctor]
/// This function will be run before any of the tests
fn init_logger() {
    let _ = env_logger::builder()
        .is_test(true)
        .filter_level(log::LevelFilter::Debug)
        .try_init();
}

#[test]
fn test_stale_read_fails_later_write() {
    let stm = Stm::default();
    let x = stm.create(0);
    let y = stm.create(0);

    for value in 1..=5 {
        x.atomic_set(value).expect("atomic set failed");
    }
    assert_eq!(x.version(), 5);

    let mut tx = stm.begin(stm.tx_config());
    assert_eq!(x.read(&mut tx), Ok(5));

    // a concurrent commit moves x to version 6
    stm.atomic(|other| x.write(other, 6)).expect("concurrent commit failed");
    assert_eq!(x.version(), 6);

    let result = y.write(&mut tx, 1).and_then(|_| tx.commit());
    assert_eq!(result, Err(TxError::ReadWriteConflict));
    assert_eq!(tx.status(), TxStatus::Aborted);
    assert_eq!(y.atomic_get(), Ok(0));
    assert_eq!(y.version(), 0);
}

#[test]
fn test_conflict_is_detected_at_commit() {
    let stm = Stm::default();
    let x = stm.create(0);
    let y = stm.create(0);

    let mut tx = stm.begin(stm.tx_config());
    x.read(&mut tx).expect("read failed");
    y.write(&mut tx, 1).expect("write failed");

    x.atomic_set(10).expect("atomic set failed");

    assert_eq!(tx.commit(), Err(TxError::ReadWriteConflict));
    assert_eq!(y.version(), 0);
    assert_eq!(y.orec_state().lock_mode(), LockMode::None);
    assert_eq!(x.orec_state().surplus(), 0);
}

#[test]
fn test_dirty_check_skips_unchanged_writes() {
    let stm = Stm::default();
    let tref = stm.create(7);

    // a reader keeps a surplus on the object
    let mut reader = stm.begin(stm.tx_config());
    tref.read(&mut reader).expect("read failed");

    let count = stm.conflict_counter().count();
    stm.atomic(|tx| {
        let value = tref.read(tx)?;
        tref.write(tx, value)
    })
    .expect("transaction failed");

    assert_eq!(tref.version(), 0);
    assert_eq!(stm.conflict_counter().count(), count);
    reader.commit().expect("reader commit failed");

    // without dirty checks the same write is published
    let config = stm.tx_config().with_dirty_check(false);
    stm.atomic_with(config, |tx| tref.write(tx, 7)).expect("transaction failed");
    assert_eq!(tref.version(), 1);
}

#[test]
fn test_conflict_is_signalled_once_per_commit() {
    let stm = Stm::default();
    let x = stm.create(0);
    let y = stm.create(0);

    let mut reader = stm.begin(stm.tx_config());
    x.read(&mut reader).expect("read failed");
    y.read(&mut reader).expect("read failed");

    let count = stm.conflict_counter().count();
    stm.atomic(|tx| {
        x.write(tx, 1)?;
        y.write(tx, 1)
    })
    .expect("transaction failed");
    assert_eq!(stm.conflict_counter().count(), count + 1);

    // without readers there is nothing to signal
    reader.abort().expect("abort failed");
    stm.atomic(|tx| x.write(tx, 2)).expect("transaction failed");
    assert_eq!(stm.conflict_counter().count(), count + 1);
}

#[test]
fn test_exclusive_lock_is_mutually_exclusive() {
    let stm = Stm::default();
    let tref = stm.create(0);

    let mut first = stm.begin(stm.tx_config().with_spin_count(4));
    let mut second = stm.begin(stm.tx_config().with_spin_count(4));

    tref.acquire(&mut first, LockMode::Exclusive).expect("acquire failed");
    let result = tref.acquire(&mut second, LockMode::Exclusive);
    assert_eq!(result, Err(TxError::LockedConflict(tref.id())));
    assert_eq!(second.status(), TxStatus::Aborted);

    // the holder can still update and commit
    tref.write(&mut first, 1).expect("write failed");
    first.commit().expect("commit failed");
    assert_eq!(tref.atomic_get(), Ok(1));
}

#[test]
fn test_threaded_exclusive_acquire() {
    let stm = Stm::default();
    let tref = stm.create(0);
    let barrier = Arc::new(Barrier::new(4));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let stm = stm.clone();
            let tref = tref.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                let mut tx = stm.begin(stm.tx_config().with_spin_count(0));
                barrier.wait();
                let acquired = tref.acquire(&mut tx, LockMode::Exclusive).is_ok();
                // keep the lock until everybody tried
                barrier.wait();
                acquired
            })
        })
        .collect();

    let winners = handles
        .into_iter()
        .map(|handle| handle.join().expect("Failed to join thread"))
        .filter(|acquired| *acquired)
        .count();
    assert_eq!(winners, 1);
    assert_eq!(tref.orec_state().lock_mode(), LockMode::None);
}

#[test]
fn test_write_lock_blocks_other_writers_only() {
    let stm = Stm::default();
    let tref = stm.create(0);

    let mut writer = stm.begin(stm.tx_config().with_write_lock_mode(LockMode::Write));
    tref.write(&mut writer, 1).expect("write failed");
    assert_eq!(tref.lock_mode(&mut writer), LockMode::Write);

    let config = stm.tx_config().with_spin_count(0).with_max_retries(1);
    assert_eq!(stm.atomic_with(config.clone(), |tx| tref.read(tx)), Ok(0));

    let result = stm.atomic_with(config, |tx| tref.write(tx, 2));
    assert!(matches!(result, Err(TxError::TooManyRetries { .. })));

    writer.commit().expect("commit failed");
    assert_eq!(tref.atomic_get(), Ok(1));
}

#[test]
fn test_journal_migration() {
    let stm = Stm::default();
    let trefs: Vec<TRef<usize>> = (0..50).map(|i| stm.create(i)).collect();

    let mut tx = stm.begin(stm.tx_config().with_max_fixed_length(4).with_cheap_scan_ceiling(100));
    assert_eq!(tx.journal_kind(), JournalKind::Mono);

    trefs[0].write(&mut tx, 100).expect("write failed");
    assert_eq!(tx.journal_kind(), JournalKind::Mono);

    trefs[1].read(&mut tx).expect("read failed");
    assert_eq!(tx.journal_kind(), JournalKind::Fixed);

    for tref in &trefs[2..4] {
        tref.read(&mut tx).expect("read failed");
    }
    assert_eq!(tx.journal_kind(), JournalKind::Fixed);

    for tref in &trefs[4..] {
        tref.alter(&mut tx, |v| v + 1).expect("write failed");
    }
    assert_eq!(tx.journal_kind(), JournalKind::Variable);
    assert_eq!(tx.journal_len(), 50);

    // entries survive the migrations
    assert_eq!(trefs[0].read(&mut tx), Ok(100));
    assert_eq!(trefs[49].read(&mut tx), Ok(50));

    tx.commit().expect("commit failed");
    assert_eq!(trefs[0].atomic_get(), Ok(100));
    assert_eq!(trefs[1].version(), 0);
    assert_eq!(trefs[10].atomic_get(), Ok(11));
}

#[test]
fn test_full_scan_family_detects_conflicts() {
    let stm = Stm::default();
    let trefs: Vec<TRef<usize>> = (0..4).map(|i| stm.create(i)).collect();
    let factory = stm.factory(stm.tx_config().with_cheap_scan_ceiling(2));

    // the first transaction outgrows the ceiling and marks the family
    let mut tx = factory.begin();
    assert!(!tx.is_full_scan());
    for tref in &trefs {
        tref.read(&mut tx).expect("read failed");
    }
    assert!(tx.is_full_scan());
    tx.commit().expect("commit failed");

    // later transactions don't arrive
    let mut tx = factory.begin();
    assert!(tx.is_full_scan());
    trefs[0].read(&mut tx).expect("read failed");
    assert_eq!(trefs[0].orec_state().surplus(), 0);

    // an update without visible readers doesn't signal, the scan still catches it
    let count = stm.conflict_counter().count();
    trefs[0].atomic_set(42).expect("atomic set failed");
    assert_eq!(stm.conflict_counter().count(), count);

    assert_eq!(trefs[1].read(&mut tx), Err(TxError::ReadWriteConflict));
}

#[test]
fn test_commuting_transactions_do_not_conflict() {
    let stm = Stm::default();
    let counter = stm.create(0);

    let mut first = stm.begin(stm.tx_config());
    let mut second = stm.begin(stm.tx_config());

    counter.commute(&mut first, |v| v + 1).expect("commute failed");
    counter.commute(&mut first, |v| v * 10).expect("commute failed");
    counter.commute(&mut second, |v| v + 5).expect("commute failed");

    // commutes don't arrive
    assert_eq!(counter.orec_state().surplus(), 0);

    first.commit().expect("commit failed");
    second.commit().expect("commit failed");

    assert_eq!(counter.atomic_get(), Ok(15));
    assert_eq!(counter.version(), 2);
}

#[test]
fn test_read_after_commute_applies_functions() {
    let stm = Stm::default();
    let counter = stm.create(1);

    let mut tx = stm.begin(stm.tx_config());
    counter.commute(&mut tx, |v| v + 1).expect("commute failed");
    assert_eq!(counter.read(&mut tx), Ok(2));

    // the object is now a normal dependency of the transaction
    counter.atomic_set(10).expect("atomic set failed");
    assert_eq!(tx.commit(), Err(TxError::ReadWriteConflict));
    assert_eq!(counter.atomic_get(), Ok(10));
}

#[test]
fn test_commute_on_written_object_is_applied_directly() {
    let stm = Stm::default();
    let counter = stm.create(1);

    stm.atomic(|tx| {
        counter.write(tx, 5)?;
        counter.commute(tx, |v| v * 2)?;
        assert_eq!(counter.read(tx), Ok(10));
        Ok(())
    })
    .expect("transaction failed");

    assert_eq!(counter.atomic_get(), Ok(10));
}

#[test]
fn test_objects_become_read_biased() {
    let stm = Stm::new(StmConfig::default().with_read_biased_threshold(4));
    let tref = stm.create(1);
    let readonly = stm.tx_config().with_readonly(true);

    for _ in 0..4 {
        assert!(!tref.orec_state().is_read_biased());
        stm.atomic_with(readonly.clone(), |tx| tref.read(tx)).expect("read failed");
    }
    assert!(tref.orec_state().is_read_biased());

    // readers are not counted anymore, any update signals a conflict
    let mut reader = stm.begin(readonly);
    tref.read(&mut reader).expect("read failed");
    assert_eq!(tref.orec_state().surplus(), 1);

    let count = stm.conflict_counter().count();
    stm.atomic(|tx| tref.write(tx, 2)).expect("transaction failed");
    assert_eq!(stm.conflict_counter().count(), count + 1);
    assert!(!tref.orec_state().is_read_biased());
    assert_eq!(tref.orec_state().surplus(), 0);

    reader.commit().expect("reader commit failed");
}

#[test]
fn test_readonly_transaction_errors() {
    let stm = Stm::default();
    let tref = stm.create(1);
    let config = stm.tx_config().with_readonly(true).with_family_name("ro");

    let mut tx = stm.begin(config.clone());
    let expected = TxError::ReadonlyTransaction {
        family: "ro".to_string(),
        operation: "write",
    };
    assert_eq!(tref.write(&mut tx, 2), Err(expected));
    assert_eq!(tx.status(), TxStatus::Aborted);

    let mut tx = stm.begin(config.clone());
    assert!(matches!(
        tref.commute(&mut tx, |v| v + 1),
        Err(TxError::ReadonlyTransaction { operation: "commute", .. })
    ));

    let mut tx = stm.begin(config);
    assert!(matches!(
        TRef::construct(&mut tx, 1),
        Err(TxError::ReadonlyTransaction { operation: "construct", .. })
    ));
}

#[test]
fn test_dead_transaction_errors() {
    let stm = Stm::default();
    let tref = stm.create(1);

    let mut tx = stm.begin(stm.tx_config().with_family_name("dead"));
    tx.commit().expect("commit failed");

    let expected = TxError::DeadTransaction {
        family: "dead".to_string(),
        operation: "read",
        status: "committed",
    };
    assert_eq!(tref.read(&mut tx), Err(expected));
    assert!(matches!(tx.retry(), TxError::DeadTransaction { operation: "retry", .. }));

    let mut tx = stm.begin(stm.tx_config());
    tx.abort().expect("abort failed");
    assert!(matches!(
        tx.commit(),
        Err(TxError::DeadTransaction {
            operation: "commit",
            status: "aborted",
            ..
        })
    ));
    assert!(matches!(tx.prepare(), Err(TxError::DeadTransaction { .. })));
}

#[test]
fn test_crossing_transactions_cannot_both_commit() {
    let stm = Stm::default();
    let a = stm.create(1);
    let b = stm.create(1);

    let mut first = stm.begin(stm.tx_config().with_family_name("first"));
    let mut second = stm.begin(stm.tx_config().with_family_name("second"));

    assert_eq!(a.read(&mut first), Ok(1));
    assert_eq!(b.read(&mut first), Ok(1));
    a.write(&mut first, 0).expect("write failed");

    assert_eq!(a.read(&mut second), Ok(1));
    assert_eq!(b.read(&mut second), Ok(1));
    b.write(&mut second, 0).expect("write failed");

    // locking `a` with a reader present is signalled before the commit publishes anything
    let count = stm.conflict_counter().count();
    first.prepare().expect("prepare failed");
    assert_eq!(stm.conflict_counter().count(), count + 1);
    assert_eq!(a.orec_state().lock_mode(), LockMode::Exclusive);

    assert_eq!(second.commit(), Err(TxError::ReadWriteConflict));
    first.commit().expect("commit failed");

    assert_eq!(a.atomic_get(), Ok(0));
    assert_eq!(b.atomic_get(), Ok(1));
    assert_eq!(b.version(), 0);
    assert_eq!(a.orec_state().surplus(), 0);
    assert_eq!(b.orec_state().surplus(), 0);
}

fn run_withdrawals(write_skew_allowed: bool) {
    const ROUNDS: usize = 200;

    let stm = Stm::default();
    let accounts = Arc::new([stm.create(50i64), stm.create(50i64)]);

    for _ in 0..ROUNDS {
        accounts[0].atomic_set(50).expect("atomic set failed");
        accounts[1].atomic_set(50).expect("atomic set failed");

        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = (0..2)
            .map(|index| {
                let stm = stm.clone();
                let accounts = accounts.clone();
                let barrier = barrier.clone();

                std::thread::spawn(move || {
                    let config = stm.tx_config().with_write_skew_allowed(write_skew_allowed);
                    barrier.wait();

                    // withdraw from one account as long as both together stay covered
                    stm.atomic_with(config, |tx| {
                        let total = accounts[0].read(tx)? + accounts[1].read(tx)?;
                        if total >= 100 {
                            accounts[index].alter(tx, |balance| balance - 100)?;
                        }
                        Ok(())
                    })
                    .expect("withdrawal failed");
                })
            })
            .collect();

        for handle in handles {
            handle.join().expect("Failed to join thread");
        }

        let total: i64 = accounts
            .iter()
            .map(|account| account.atomic_get().expect("read failed"))
            .sum();
        assert_eq!(total, 0, "both withdrawals committed");
    }
}

#[test]
fn test_concurrent_withdrawals_are_serialized() {
    run_withdrawals(true);
}

#[test]
fn test_concurrent_withdrawals_without_write_skew() {
    run_withdrawals(false);
}

#[test]
fn test_write_skew_disallowed_locks_read_set() {
    let stm = Stm::default();
    let a = stm.create(1);
    let b = stm.create(1);

    let config = stm.tx_config().with_write_skew_allowed(false).with_spin_count(0);
    let mut tx = stm.begin(config);
    b.read(&mut tx).expect("read failed");
    a.write(&mut tx, 2).expect("write failed");
    tx.prepare().expect("prepare failed");

    assert_eq!(a.orec_state().lock_mode(), LockMode::Exclusive);
    assert_eq!(b.orec_state().lock_mode(), LockMode::Write);
    assert_eq!(b.lock_mode(&mut tx), LockMode::Write);

    // readers pass, writers of the read object don't
    assert_eq!(stm.atomic(|other| b.read(other)), Ok(1));
    let blind = stm.tx_config().with_spin_count(0).with_max_retries(1);
    assert!(matches!(
        stm.atomic_with(blind, |other| b.write(other, 5)),
        Err(TxError::TooManyRetries { .. })
    ));

    tx.commit().expect("commit failed");
    assert_eq!(a.atomic_get(), Ok(2));
    assert_eq!(b.orec_state().lock_mode(), LockMode::None);
    assert_eq!(b.orec_state().surplus(), 0);

    // the default leaves the read set unlocked
    let mut tx = stm.begin(stm.tx_config());
    b.read(&mut tx).expect("read failed");
    a.write(&mut tx, 3).expect("write failed");
    tx.prepare().expect("prepare failed");
    assert_eq!(b.orec_state().lock_mode(), LockMode::None);
    tx.commit().expect("commit failed");
}
