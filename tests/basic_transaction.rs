use seshat::{
    IsolationLevel, Seshat, SeshatError, Signal, TxnConfig, TxnError, TxnStatus,
};

// Single-threaded lifecycle tests; interleavings with real threads live in
// concurrency_tests.rs.
#[cfg(test)]
mod single_threaded_tests {
    use super::*;

    #[test]
    fn test_basic_engine_creation() {
        let stm = Seshat::default();

        // Transaction ids are engine-unique and increasing; id 0 is
        // reserved for "no owner".
        let first = stm.begin_transaction().id();
        let second = stm.begin_transaction().id();
        assert!(first >= 1);
        assert_eq!(second, first + 1);
    }

    #[test]
    fn test_basic_read_write_commit() {
        let stm = Seshat::default();
        let cell = stm.new_ref(100_i64);

        // Start a transaction, update the value, and commit.
        let mut txn = stm.begin_transaction();
        let current = *cell.read(&mut txn).unwrap();
        assert_eq!(current, 100);
        cell.write(&mut txn, current + 11).unwrap();
        txn.commit().unwrap();
        assert_eq!(txn.status(), TxnStatus::Committed);

        // A later transaction and the lock-free accessor both see the
        // committed value.
        let mut txn2 = stm.begin_transaction();
        assert_eq!(*cell.read(&mut txn2).unwrap(), 111);
        assert_eq!(*cell.atomic_get(), 111);
    }

    #[test]
    fn test_basic_abort() {
        let stm = Seshat::default();
        let cell = stm.new_ref(String::from("original"));

        // Stage a write, then abort instead of committing.
        let mut txn = stm.begin_transaction();
        cell.write(&mut txn, String::from("discarded")).unwrap();
        txn.abort().unwrap();
        assert_eq!(txn.status(), TxnStatus::Aborted);

        // The staged write never became visible.
        assert_eq!(*cell.atomic_get(), "original");

        // Aborting an aborted transaction is a no-op.
        txn.abort().unwrap();
    }

    #[test]
    fn test_repeatable_read_is_stable() {
        let stm = Seshat::default();
        let cell = stm.new_ref(100_i64);

        // Tx1 reads the initial value.
        let mut txn1 = stm.begin_transaction();
        assert_eq!(*cell.read(&mut txn1).unwrap(), 100);

        // Tx2 overwrites and commits while Tx1 is still open.
        let mut txn2 = stm.begin_transaction();
        cell.write(&mut txn2, 200).unwrap();
        txn2.commit().unwrap();

        // Tx1 keeps seeing its recorded value.
        assert_eq!(*cell.read(&mut txn1).unwrap(), 100);

        // But its commit must fail: the snapshot is stale.
        let err = txn1.commit().unwrap_err();
        assert!(matches!(
            err,
            TxnError::Signal(Signal::ReadWriteConflict)
        ));
    }

    #[test]
    fn test_read_committed_sees_latest() {
        let stm = Seshat::new(
            TxnConfig::default().with_isolation(IsolationLevel::ReadCommitted),
        )
        .unwrap();
        let cell = stm.new_ref(100_i64);

        // Tx1 reads the initial value without recording anything.
        let mut txn1 = stm.begin_transaction();
        assert_eq!(*cell.read(&mut txn1).unwrap(), 100);

        // Tx2 overwrites and commits.
        let mut txn2 = stm.begin_transaction();
        cell.write(&mut txn2, 200).unwrap();
        txn2.commit().unwrap();

        // Tx1 sees the newer value on its second read, and commits fine
        // since it tracked no reads.
        assert_eq!(*cell.read(&mut txn1).unwrap(), 200);
        txn1.commit().unwrap();
    }

    #[test]
    fn test_readonly_transactions_reject_writes() {
        let stm = Seshat::new(TxnConfig::default().with_readonly(true)).unwrap();
        let cell = stm.new_ref(1_i64);

        let mut txn = stm.begin_transaction();
        assert_eq!(*cell.read(&mut txn).unwrap(), 1);
        let err = cell.write(&mut txn, 2).unwrap_err();
        assert!(matches!(err, TxnError::Fatal(SeshatError::ReadonlyWrite)));

        // Reading still commits.
        txn.commit().unwrap();
    }

    #[test]
    fn test_write_arc_identity_is_clean() {
        let stm = Seshat::default();
        let cell = stm.new_ref(vec![1_u8, 2, 3]);
        assert_eq!(cell.committed_version(), 1);

        // Writing back the exact Arc that was read is not a real write.
        let mut txn = stm.begin_transaction();
        let value = cell.read(&mut txn).unwrap();
        cell.write_arc(&mut txn, value).unwrap();
        txn.commit().unwrap();

        // No install happened, so the version did not move.
        assert_eq!(cell.committed_version(), 1);
    }

    #[test]
    fn test_modify_applies_closure() {
        let stm = Seshat::default();
        let cell = stm.new_ref(20_i64);

        let mut txn = stm.begin_transaction();
        cell.modify(&mut txn, |v| v * 2).unwrap();
        txn.commit().unwrap();

        assert_eq!(*cell.atomic_get(), 40);
        assert_eq!(cell.committed_version(), 2);
    }

    #[test]
    fn test_blind_write_commits_without_reading() {
        let stm = Seshat::default();
        let cell = stm.new_ref(0_i64);

        let mut txn = stm.begin_transaction();
        cell.write(&mut txn, 77).unwrap();
        txn.commit().unwrap();

        assert_eq!(*cell.atomic_get(), 77);
    }

    #[test]
    fn test_prepare_then_commit() {
        let stm = Seshat::default();
        let cell = stm.new_ref(0_i64);

        // Phase one: locks held, validation done, nothing visible yet.
        let mut txn = stm.begin_transaction();
        cell.write(&mut txn, 7).unwrap();
        txn.prepare().unwrap();
        assert_eq!(txn.status(), TxnStatus::Prepared);
        assert_eq!(*cell.atomic_get(), 0);

        // Phase two: the decided commit cannot fail.
        txn.commit().unwrap();
        assert_eq!(*cell.atomic_get(), 7);
    }

    #[test]
    fn test_prepared_transaction_can_abort() {
        let stm = Seshat::default();
        let cell = stm.new_ref(0_i64);

        let mut txn = stm.begin_transaction();
        cell.write(&mut txn, 9).unwrap();
        txn.prepare().unwrap();
        txn.abort().unwrap();

        // The prepared write was discarded and the reference is free for
        // the next writer.
        assert_eq!(*cell.atomic_get(), 0);
        let mut txn2 = stm.begin_transaction();
        cell.write(&mut txn2, 1).unwrap();
        txn2.commit().unwrap();
        assert_eq!(*cell.atomic_get(), 1);
    }

    #[test]
    fn test_committed_transaction_rejects_operations() {
        let stm = Seshat::default();
        let cell = stm.new_ref(5_i64);

        let mut txn = stm.begin_transaction();
        cell.write(&mut txn, 6).unwrap();
        txn.commit().unwrap();

        // Every further operation reports the illegal state.
        let err = cell.read(&mut txn).unwrap_err();
        assert!(matches!(
            err,
            TxnError::Fatal(SeshatError::IllegalState {
                status: TxnStatus::Committed,
                ..
            })
        ));
        let err = txn.commit().unwrap_err();
        assert!(matches!(
            err,
            TxnError::Fatal(SeshatError::IllegalState {
                status: TxnStatus::Committed,
                ..
            })
        ));
        let err = txn.abort().unwrap_err();
        assert!(matches!(
            err,
            SeshatError::IllegalState {
                status: TxnStatus::Committed,
                ..
            }
        ));
    }

    #[test]
    fn test_execute_returns_closure_value() {
        let stm = Seshat::default();
        let cell = stm.new_ref(3_i64);

        let doubled = stm
            .execute(|tx| {
                let v = *cell.read(tx)?;
                cell.write(tx, v * 2)?;
                Ok(v * 2)
            })
            .unwrap();

        assert_eq!(doubled, 6);
        assert_eq!(*cell.atomic_get(), 6);
    }

    #[test]
    fn test_execute_propagates_fatal_errors() {
        let stm = Seshat::default();
        let cell = stm.new_ref(3_i64);

        // A non-signal error aborts the transaction and surfaces as-is.
        let err = stm
            .execute(|tx| {
                cell.write(tx, 99)?;
                Err::<(), _>(SeshatError::Configuration("business rule violated".into()).into())
            })
            .unwrap_err();

        assert!(matches!(err, SeshatError::Configuration(_)));
        assert_eq!(*cell.atomic_get(), 3); // The staged write was discarded.
    }
}
