//! Blocking retry support: era-stamped latches and per-reference wait lists.
//!
//! A transaction that gives up on the current state of its read set parks on a
//! [`RetryLatch`] after hanging one [`Listener`] node on every reference it
//! read. The first committed write to any of those references detaches the
//! whole wait list and opens every latch on it, which wakes the parked
//! transaction for another attempt.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::pool::TxnPool;

/// A reusable latch a blocked transaction parks on until one of the
/// references it read is overwritten.
///
/// Each transaction owns exactly one latch and reuses it across blocking
/// rounds. Before a round registers any listeners the owner bumps the latch
/// era with [`RetryLatch::rearm`]; an open carrying the era of an earlier
/// round is ignored, so a writer that detaches a long-forgotten listener node
/// can never wake the wrong round.
pub(crate) struct RetryLatch {
    state: Mutex<LatchState>,
    cond: Condvar,
}

struct LatchState {
    /// Round stamp. Only the owning transaction bumps it.
    era: u64,
    /// Whether the current era has been opened.
    open: bool,
}

impl RetryLatch {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(LatchState { era: 0, open: false }),
            cond: Condvar::new(),
        }
    }

    /// Starts a new blocking round and returns its era.
    ///
    /// Must be called before any listener carrying the returned era is
    /// registered on a reference.
    pub(crate) fn rearm(&self) -> u64 {
        let mut state = self.state.lock();
        state.era += 1;
        state.open = false;
        state.era
    }

    /// Opens the latch if `era` is still the current round.
    ///
    /// Returns `true` only for the call that actually opened the latch, so
    /// an already-open latch or a stale era is a cheap no-op.
    pub(crate) fn open(&self, era: u64) -> bool {
        let mut state = self.state.lock();
        if state.era == era && !state.open {
            state.open = true;
            self.cond.notify_all();
            true
        } else {
            false
        }
    }

    /// Parks the calling thread until the latch opens for `era` or the
    /// timeout budget runs out.
    ///
    /// Returns `true` when the latch opened and `false` on timeout. Spurious
    /// wakeups re-check the open flag and go back to sleep.
    pub(crate) fn await_open(&self, era: u64, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|budget| Instant::now() + budget);
        let mut state = self.state.lock();
        loop {
            if state.open || state.era != era {
                return true;
            }
            match deadline {
                Some(at) => {
                    if self.cond.wait_until(&mut state, at).timed_out() {
                        return state.open || state.era != era;
                    }
                }
                None => self.cond.wait(&mut state),
            }
        }
    }
}

/// A node in a reference's wait list.
///
/// `latch` is `None` only while the node rests in a [`TxnPool`]; a registered
/// node always carries the latch of the transaction that hung it there,
/// together with the era of the round that registered it.
pub(crate) struct Listener {
    pub(crate) latch: Option<Arc<RetryLatch>>,
    pub(crate) era: u64,
    pub(crate) next: Option<Box<Listener>>,
}

/// Opens every latch on a detached wait list and recycles the nodes.
///
/// Ownership of the chain moves to the caller when the head is taken off the
/// reference, so each node is opened and pooled exactly once no matter how
/// many writers commit concurrently.
pub(crate) fn open_chain(head: Option<Box<Listener>>, pool: &mut TxnPool) {
    let mut cursor = head;
    while let Some(mut node) = cursor {
        cursor = node.next.take();
        if let Some(latch) = node.latch.take() {
            latch.open(node.era);
        }
        pool.recycle_listener(node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn open_wakes_a_parked_thread() {
        let latch = Arc::new(RetryLatch::new());
        let era = latch.rearm();

        let waiter = {
            let latch = Arc::clone(&latch);
            thread::spawn(move || latch.await_open(era, Some(Duration::from_secs(5))))
        };

        thread::sleep(Duration::from_millis(20));
        assert!(latch.open(era));
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn open_before_wait_returns_immediately() {
        let latch = RetryLatch::new();
        let era = latch.rearm();
        assert!(latch.open(era));
        assert!(latch.await_open(era, Some(Duration::ZERO)));
    }

    #[test]
    fn stale_era_cannot_open_the_current_round() {
        let latch = RetryLatch::new();
        let old = latch.rearm();
        let current = latch.rearm();
        assert!(!latch.open(old));
        assert!(!latch.await_open(current, Some(Duration::from_millis(10))));
    }

    #[test]
    fn rearm_closes_an_opened_latch() {
        let latch = RetryLatch::new();
        let era = latch.rearm();
        assert!(latch.open(era));
        let next = latch.rearm();
        assert!(!latch.await_open(next, Some(Duration::from_millis(10))));
    }

    #[test]
    fn await_times_out_without_an_open() {
        let latch = RetryLatch::new();
        let era = latch.rearm();
        let start = Instant::now();
        assert!(!latch.await_open(era, Some(Duration::from_millis(30))));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn chain_opens_every_node_exactly_once() {
        let mut pool = TxnPool::new(true);
        let latches: Vec<_> = (0..3).map(|_| Arc::new(RetryLatch::new())).collect();
        let eras: Vec<_> = latches.iter().map(|l| l.rearm()).collect();

        let mut head: Option<Box<Listener>> = None;
        for (latch, era) in latches.iter().zip(&eras) {
            head = Some(Box::new(Listener {
                latch: Some(Arc::clone(latch)),
                era: *era,
                next: head,
            }));
        }

        open_chain(head, &mut pool);

        for (latch, era) in latches.iter().zip(&eras) {
            // A second open of the same era reports the latch already open.
            assert!(!latch.open(*era));
            assert!(latch.await_open(*era, Some(Duration::ZERO)));
        }
    }
}
