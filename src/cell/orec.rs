//! The ownership record packed into a single atomic word.
//!
//! Every transactional reference carries one [`Orec`]: a 64-bit word holding
//! the write-lock bit, the pessimistic read-lock count, the read-biased flag,
//! the read-only commit streak, and the surplus (the number of tracked
//! readers that have arrived and not yet departed). Keeping all of it in one
//! word lets a committing writer sample the reader population in the same
//! compare-and-swap that takes the write lock, which is what makes the cheap
//! global-counter validation shortcut sound: the writer knows, atomically,
//! whether any tracked reader depends on the value it is about to replace.
//!
//! Word layout:
//!
//! ```text
//! bit 63          write lock
//! bit 62          read biased
//! bits 32..=47    read-only commit streak (saturating)
//! bits 16..=31    read-lock count
//! bits  0..=15    surplus (arrived tracked readers)
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

const WRITE_LOCK: u64 = 1 << 63;
const READ_BIASED: u64 = 1 << 62;
const STREAK_SHIFT: u32 = 32;
const RLOCK_SHIFT: u32 = 16;
const FIELD_MASK: u64 = 0xFFFF;

/// A decoded copy of the ownership word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct OrecView {
    pub(crate) write_locked: bool,
    pub(crate) read_biased: bool,
    pub(crate) streak: u16,
    pub(crate) read_locks: u16,
    pub(crate) surplus: u16,
}

fn decode(word: u64) -> OrecView {
    OrecView {
        write_locked: word & WRITE_LOCK != 0,
        read_biased: word & READ_BIASED != 0,
        streak: ((word >> STREAK_SHIFT) & FIELD_MASK) as u16,
        read_locks: ((word >> RLOCK_SHIFT) & FIELD_MASK) as u16,
        surplus: (word & FIELD_MASK) as u16,
    }
}

fn encode(view: OrecView) -> u64 {
    let mut word = 0;
    if view.write_locked {
        word |= WRITE_LOCK;
    }
    if view.read_biased {
        word |= READ_BIASED;
    }
    word |= u64::from(view.streak) << STREAK_SHIFT;
    word |= u64::from(view.read_locks) << RLOCK_SHIFT;
    word |= u64::from(view.surplus);
    word
}

/// Outcome of a tracked reader announcing itself on a reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Arrive {
    /// The surplus was incremented; the reader owes a matching depart.
    Tracked,
    /// The reference is read-biased; individual readers are not counted and
    /// the caller must fall back to full validation scans.
    Biased,
    /// The word is write-locked; a commit is in flight.
    Locked,
    /// The surplus field is saturated; treat the read like a biased one.
    Overflow,
}

/// The per-reference ownership record.
///
/// All transitions are SeqCst compare-and-swap loops over the packed word, so
/// every method is safe to call from any thread at any time.
pub(crate) struct Orec {
    word: AtomicU64,
}

impl Orec {
    pub(crate) fn new() -> Self {
        Self {
            word: AtomicU64::new(0),
        }
    }

    pub(crate) fn load(&self) -> OrecView {
        decode(self.word.load(Ordering::SeqCst))
    }

    /// Announces a tracked reader.
    ///
    /// Fails fast with [`Arrive::Locked`] instead of spinning; the caller
    /// decides how long a commit in flight is worth waiting for.
    pub(crate) fn arrive(&self) -> Arrive {
        let mut word = self.word.load(Ordering::SeqCst);
        loop {
            let view = decode(word);
            if view.write_locked {
                return Arrive::Locked;
            }
            if view.read_biased {
                return Arrive::Biased;
            }
            if view.surplus == u16::MAX {
                return Arrive::Overflow;
            }
            match self.word.compare_exchange(
                word,
                word + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Arrive::Tracked,
                Err(current) => word = current,
            }
        }
    }

    /// Retires one arrived reader.
    ///
    /// `streak_bump` is true only when a transaction that committed without
    /// writing this reference departs; those departs grow the read-only
    /// streak that drives promotion. When the last tracked reader departs an
    /// unlocked reference whose streak has reached `threshold`, the word
    /// flips to read-biased with the sticky surplus of one that keeps
    /// writers signalling the global conflict counter.
    ///
    /// Returns `true` when this depart performed the promotion.
    pub(crate) fn depart(&self, streak_bump: bool, threshold: u32) -> bool {
        let mut word = self.word.load(Ordering::SeqCst);
        loop {
            let view = decode(word);
            debug_assert!(view.surplus > 0, "depart without a matching arrive");
            debug_assert!(!view.read_biased, "tracked depart on a biased reference");
            let mut next = view;
            next.surplus = view.surplus.saturating_sub(1);
            if streak_bump {
                next.streak = view.streak.saturating_add(1);
            }
            let promote = !view.write_locked
                && next.surplus == 0
                && u32::from(next.streak) >= threshold;
            if promote {
                next.read_biased = true;
                next.surplus = 1;
            }
            match self.word.compare_exchange(
                word,
                encode(next),
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return promote,
                Err(current) => word = current,
            }
        }
    }

    /// Takes the write lock, failing fast when the word is already write- or
    /// read-locked.
    ///
    /// On success returns the view the lock was taken over. The surplus and
    /// bias flag in that view are exact for the whole time the lock is held,
    /// because arrivals fail on a write-locked word; committers use them to
    /// decide whether the global conflict counter must move.
    pub(crate) fn try_lock_write(&self) -> Option<OrecView> {
        let mut word = self.word.load(Ordering::SeqCst);
        loop {
            let view = decode(word);
            if view.write_locked || view.read_locks > 0 {
                return None;
            }
            match self.word.compare_exchange(
                word,
                word | WRITE_LOCK,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(prior) => return Some(decode(prior)),
                Err(current) => word = current,
            }
        }
    }

    /// Upgrades a read lock held by the caller to the write lock.
    ///
    /// Succeeds only while the caller is the sole read-locker; a second
    /// reader makes the upgrade a deadlock risk, so it fails instead.
    pub(crate) fn try_upgrade_to_write(&self) -> Option<OrecView> {
        let mut word = self.word.load(Ordering::SeqCst);
        loop {
            let view = decode(word);
            if view.write_locked || view.read_locks != 1 {
                return None;
            }
            let mut next = view;
            next.write_locked = true;
            next.read_locks = 0;
            match self.word.compare_exchange(
                word,
                encode(next),
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(prior) => return Some(decode(prior)),
                Err(current) => word = current,
            }
        }
    }

    /// Takes one pessimistic read lock. Fails while the word is write-locked.
    pub(crate) fn try_lock_read(&self) -> bool {
        let mut word = self.word.load(Ordering::SeqCst);
        loop {
            let view = decode(word);
            if view.write_locked || view.read_locks == u16::MAX {
                return false;
            }
            let mut next = view;
            next.read_locks = view.read_locks + 1;
            match self.word.compare_exchange(
                word,
                encode(next),
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(current) => word = current,
            }
        }
    }

    pub(crate) fn unlock_read(&self) {
        let mut word = self.word.load(Ordering::SeqCst);
        loop {
            let view = decode(word);
            debug_assert!(view.read_locks > 0, "read unlock without a read lock");
            let mut next = view;
            next.read_locks = view.read_locks.saturating_sub(1);
            match self.word.compare_exchange(
                word,
                encode(next),
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return,
                Err(current) => word = current,
            }
        }
    }

    /// Drops the write lock.
    ///
    /// `committed` is true when a new value was installed under the lock. A
    /// committed write breaks the read-only streak, and on a biased word it
    /// performs the demotion back to tracked mode: bias flag cleared, sticky
    /// surplus removed, streak restarted. Returns `true` when a demotion
    /// happened.
    pub(crate) fn unlock_write(&self, committed: bool) -> bool {
        let mut word = self.word.load(Ordering::SeqCst);
        loop {
            let view = decode(word);
            debug_assert!(view.write_locked, "write unlock without the write lock");
            let mut next = view;
            next.write_locked = false;
            let mut demoted = false;
            if committed {
                next.streak = 0;
                if view.read_biased {
                    next.read_biased = false;
                    next.surplus = 0;
                    demoted = true;
                }
            }
            match self.word.compare_exchange(
                word,
                encode(next),
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return demoted,
                Err(current) => word = current,
            }
        }
    }
}
