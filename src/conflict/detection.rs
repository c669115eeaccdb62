//! Per-reference validation scans.
//!
//! A snapshot is valid while the committed version of its reference still
//! equals the version the transaction observed. These scans are the exact
//! half of conflict detection; the cheap half is the counter comparison the
//! transaction performs before deciding a scan is needed at all.

use log::debug;

use crate::errors::Signal;
use crate::tracking::{Snapshot, SnapshotSet};

/// True while the committed version matches what this transaction observed.
pub(crate) fn snapshot_valid(snapshot: &Snapshot) -> bool {
    snapshot.core.version() == snapshot.read_version
}

/// Re-probes every snapshot in the set.
///
/// Used on the read path when the conflict counter has moved under the
/// transaction, and at commit when the cheap comparison cannot rule out a
/// conflict. The first stale snapshot fails the whole scan.
pub(crate) fn validate_all(txn_id: u64, set: &SnapshotSet) -> Result<(), Signal> {
    for snapshot in set.iter() {
        if !snapshot_valid(snapshot) {
            debug!(
                "transaction {} read reference {} at version {} but found version {}",
                txn_id,
                snapshot.core.id(),
                snapshot.read_version,
                snapshot.core.version(),
            );
            return Err(Signal::ReadWriteConflict);
        }
    }
    Ok(())
}

/// Re-probes only the snapshots that will install a value at commit.
///
/// Written references are validated unconditionally: a blind write never
/// arrived, so a concurrent commit to it cannot be counted on to move the
/// conflict counter, and the cheap comparison says nothing about it.
pub(crate) fn validate_written(
    txn_id: u64,
    set: &SnapshotSet,
    dirty_check: bool,
) -> Result<(), Signal> {
    for snapshot in set.iter() {
        if snapshot.is_dirty(dirty_check) && !snapshot_valid(snapshot) {
            debug!(
                "transaction {} lost reference {} to a concurrent write (saw {}, now {})",
                txn_id,
                snapshot.core.id(),
                snapshot.read_version,
                snapshot.core.version(),
            );
            return Err(Signal::ReadWriteConflict);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LockMode;
    use crate::cell::tref::RefCore;
    use crate::pool::TxnPool;
    use crate::tracking::Representation;
    use std::sync::Arc;

    fn tracked_snapshot(core: &Arc<RefCore>) -> Snapshot {
        let (read_value, read_version) = core.committed_pair();
        Snapshot {
            core: Arc::clone(core),
            read_version,
            read_value,
            staged: None,
            lock: LockMode::None,
            arrived: false,
            read_tracked: true,
            saw_readers: false,
        }
    }

    #[test]
    fn scan_passes_while_nothing_committed() {
        let mut pool = TxnPool::new(true);
        let core = Arc::new(RefCore::new(1, Arc::new(10_u64)));
        let mut set = SnapshotSet::with_representation(Representation::Mono, &mut pool);
        set.insert(tracked_snapshot(&core)).unwrap();

        assert!(validate_all(1, &set).is_ok());
    }

    #[test]
    fn scan_fails_after_a_concurrent_install() {
        let mut pool = TxnPool::new(true);
        let core = Arc::new(RefCore::new(1, Arc::new(10_u64)));
        let mut set = SnapshotSet::with_representation(Representation::Mono, &mut pool);
        set.insert(tracked_snapshot(&core)).unwrap();

        core.install(Arc::new(11_u64));

        assert_eq!(validate_all(1, &set), Err(Signal::ReadWriteConflict));
    }

    #[test]
    fn written_scan_ignores_clean_snapshots() {
        let mut pool = TxnPool::new(true);
        let read = Arc::new(RefCore::new(1, Arc::new(10_u64)));
        let written = Arc::new(RefCore::new(2, Arc::new(20_u64)));

        let mut set = SnapshotSet::with_representation(Representation::Fixed, &mut pool);
        set.insert(tracked_snapshot(&read)).unwrap();
        let mut dirty = tracked_snapshot(&written);
        dirty.staged = Some(Arc::new(21_u64));
        set.insert(dirty).unwrap();

        // Invalidate only the read-only snapshot; the written one is fine.
        read.install(Arc::new(11_u64));

        assert!(validate_written(1, &set, true).is_ok());
        assert_eq!(validate_all(1, &set), Err(Signal::ReadWriteConflict));
    }
}
