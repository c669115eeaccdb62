// Declare the common module *within this test crate*
mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use seshat::{IsolationLevel, LockMode, Seshat, SeshatError, Signal, TxnConfig};

use common::fail_fast_factory;

#[test]
fn test_contradictory_configurations_are_rejected() {
    // Weaker write than read locking cannot keep its locking promise.
    let err = Seshat::new(
        TxnConfig::default()
            .with_read_lock_mode(LockMode::Write)
            .with_write_lock_mode(LockMode::Read),
    )
    .unwrap_err();
    assert!(matches!(err, SeshatError::Configuration(_)));

    let stm = Seshat::default();

    // Blocking retry needs a recorded read set to wait on.
    let err = stm
        .factory(TxnConfig::default().with_read_tracking(false))
        .unwrap_err();
    assert!(matches!(err, SeshatError::Configuration(_)));

    // Tracking isolation levels need read tracking.
    let err = stm
        .factory(
            TxnConfig::default()
                .with_read_tracking(false)
                .with_blocking(false)
                .with_isolation(IsolationLevel::RepeatableRead),
        )
        .unwrap_err();
    assert!(matches!(err, SeshatError::Configuration(_)));

    // A zero attempt budget could never commit anything.
    let err = stm
        .factory(TxnConfig::default().with_max_retries(0))
        .unwrap_err();
    assert!(matches!(err, SeshatError::Configuration(_)));

    // A zero blocking budget would always time out.
    let err = stm
        .factory(TxnConfig::default().with_timeout(Duration::ZERO))
        .unwrap_err();
    assert!(matches!(err, SeshatError::Configuration(_)));

    // Untracked reads are fine where nothing depends on them.
    stm.factory(
        TxnConfig::default()
            .with_read_tracking(false)
            .with_blocking(false)
            .with_isolation(IsolationLevel::ReadCommitted),
    )
    .expect("read-committed without tracking is a valid combination");
}

#[test]
fn test_attempts_exhausted_reports_final_signal() {
    // Test Scenario: every attempt reads a reference that a saboteur
    // overwrites before the attempt can commit.
    // Expected: with a budget of 3 the engine gives up exactly after the
    // third failed attempt and reports the signal that ended it.
    let stm = Seshat::default();
    let factory = fail_fast_factory(&stm, 3);
    let cell = stm.new_ref(0_i64);

    let runs = AtomicU32::new(0);
    let err = factory
        .execute(|tx| {
            runs.fetch_add(1, Ordering::SeqCst);
            let seen = *cell.read(tx)?;
            // Saboteur: an independent transaction moves the reference
            // before this attempt reaches its commit.
            stm.execute(|inner| cell.write(inner, seen + 1)).unwrap();
            Ok(())
        })
        .unwrap_err();

    assert_eq!(runs.load(Ordering::SeqCst), 3);
    assert!(matches!(
        err,
        SeshatError::AttemptsExhausted {
            attempts: 3,
            last: Signal::ReadWriteConflict,
        }
    ));

    // The exhausted transaction released its whole footprint: the
    // reference commits normally afterwards.
    stm.execute(|tx| cell.modify(tx, |v| v + 1)).unwrap();
    assert_eq!(*cell.atomic_get(), 4);
}

#[test]
fn test_fatal_errors_bypass_the_attempt_loop() {
    // A non-signal error must surface on the first run, not burn attempts.
    let stm = Seshat::default();
    let factory = fail_fast_factory(&stm, 3);
    let cell = stm.new_ref(5_i64);

    let runs = AtomicU32::new(0);
    let err = factory
        .execute(|tx| {
            runs.fetch_add(1, Ordering::SeqCst);
            cell.write(tx, 6)?;
            Err::<(), _>(SeshatError::Configuration("validation elsewhere failed".into()).into())
        })
        .unwrap_err();

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(matches!(err, SeshatError::Configuration(_)));
    assert_eq!(*cell.atomic_get(), 5); // The staged write was discarded.
}
