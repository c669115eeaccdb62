//! The engine-wide conflict counter behind cheap validation.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counts commits that invalidated somebody's tracked read.
///
/// A committing writer signals the counter once when any reference it is
/// about to overwrite carried surplus beyond the writer's own arrive, or was
/// read-biased. Because tracked readers arrive before loading the committed
/// pair, and arrivals fail on a write-locked word, every write that can
/// invalidate a tracked snapshot is guaranteed to move the counter.
///
/// That guarantee is what a transaction leans on when it skips the
/// per-reference validation scan: if the counter still holds the value
/// sampled when its snapshots were last known valid, none of them can have
/// been overwritten since.
///
/// Each engine owns one counter, so references must stay with the engine
/// that created them.
#[derive(Debug)]
pub(crate) struct GlobalConflictCounter {
    commits: AtomicU64,
}

impl GlobalConflictCounter {
    pub(crate) fn new() -> Self {
        Self {
            commits: AtomicU64::new(0),
        }
    }

    pub(crate) fn snapshot(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    pub(crate) fn signal_commit(&self) {
        self.commits.fetch_add(1, Ordering::SeqCst);
    }
}
