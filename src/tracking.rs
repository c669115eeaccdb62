//! Per-transaction tracking of read and written references.
//!
//! Every reference a transaction touches under a tracking isolation level is
//! recorded as one [`Snapshot`]. The snapshots live in a [`SnapshotSet`]
//! whose backing storage starts as small as the speculative sizing dares and
//! escalates in place when an attempt touches more references than the
//! current representation can hold.

use ahash::AHashMap as HashMap;
use std::fmt;
use std::sync::Arc;

use crate::LockMode;
use crate::cell::tref::{Payload, RefCore};
use crate::pool::TxnPool;

/// Slot count of the fixed-size representation.
pub(crate) const FIXED_CAPACITY: usize = 16;

/// What one transaction knows about one reference.
pub(crate) struct Snapshot {
    pub(crate) core: Arc<RefCore>,
    /// Version of the committed pair this transaction observed first.
    pub(crate) read_version: u64,
    /// Value of that committed pair; what tracked re-reads return.
    pub(crate) read_value: Payload,
    /// Value staged by a write, private until commit.
    pub(crate) staged: Option<Payload>,
    /// Lock currently held on the reference on behalf of this transaction.
    pub(crate) lock: LockMode,
    /// This snapshot incremented the reference's surplus and owes a depart.
    pub(crate) arrived: bool,
    /// Recorded by a tracked read: validated at commit and watched by retry.
    pub(crate) read_tracked: bool,
    /// The write-lock acquisition saw surplus beyond this transaction's own
    /// arrive, or a read-biased word. Committing such a snapshot must signal
    /// the global conflict counter.
    pub(crate) saw_readers: bool,
}

impl Snapshot {
    /// Whether commit must install a new value for this reference.
    ///
    /// With the dirty check enabled, staging back the very `Arc` that was
    /// read leaves the snapshot clean and the reference untouched. The
    /// comparison is on the data pointer alone: vtable pointers of equal
    /// trait objects are not guaranteed unique.
    pub(crate) fn is_dirty(&self, dirty_check: bool) -> bool {
        match &self.staged {
            None => false,
            Some(value) => {
                !dirty_check
                    || !std::ptr::addr_eq(Arc::as_ptr(value), Arc::as_ptr(&self.read_value))
            }
        }
    }

    /// The value a re-read inside the owning transaction observes.
    pub(crate) fn current_value(&self) -> Payload {
        match &self.staged {
            Some(value) => Arc::clone(value),
            None => Arc::clone(&self.read_value),
        }
    }
}

/// The representations a snapshot set can take, cheapest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Representation {
    /// A single inline slot for transactions touching one reference.
    Mono,
    /// A sorted fixed-capacity array of [`FIXED_CAPACITY`] slots.
    Fixed,
    /// Unbounded slots with a hash index from reference id to slot.
    Dynamic,
}

impl Representation {
    /// The smallest representation that can hold `required` snapshots.
    pub(crate) fn for_slots(required: usize) -> Self {
        if required <= 1 {
            Representation::Mono
        } else if required <= FIXED_CAPACITY {
            Representation::Fixed
        } else {
            Representation::Dynamic
        }
    }
}

/// A transaction's snapshot storage.
///
/// `Fixed` keeps its slots sorted by reference id so commit-order iteration
/// is free; `Dynamic` keeps insertion order and sorts ids on demand.
pub(crate) enum SnapshotSet {
    Mono(Option<Box<Snapshot>>),
    Fixed(Vec<Snapshot>),
    Dynamic {
        slots: Vec<Snapshot>,
        index: HashMap<u64, usize>,
    },
}

/// Raised by [`SnapshotSet::insert`] when the current representation has no
/// free slot. Carries the snapshot back so the caller can undo its arrive
/// before escalating.
pub(crate) struct SetOverflow {
    /// Slot count the failing attempt actually needs.
    pub(crate) required: usize,
    pub(crate) snapshot: Snapshot,
}

impl fmt::Debug for SetOverflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SetOverflow")
            .field("required", &self.required)
            .field("snapshot_id", &self.snapshot.core.id())
            .finish()
    }
}

impl SnapshotSet {
    pub(crate) fn with_representation(rep: Representation, pool: &mut TxnPool) -> Self {
        match rep {
            Representation::Mono => SnapshotSet::Mono(None),
            Representation::Fixed => SnapshotSet::Fixed(pool.take_slots(FIXED_CAPACITY)),
            Representation::Dynamic => SnapshotSet::Dynamic {
                slots: pool.take_slots(FIXED_CAPACITY * 2),
                index: pool.take_index(),
            },
        }
    }

    pub(crate) fn representation(&self) -> Representation {
        match self {
            SnapshotSet::Mono(_) => Representation::Mono,
            SnapshotSet::Fixed(_) => Representation::Fixed,
            SnapshotSet::Dynamic { .. } => Representation::Dynamic,
        }
    }

    pub(crate) fn len(&self) -> usize {
        match self {
            SnapshotSet::Mono(slot) => usize::from(slot.is_some()),
            SnapshotSet::Fixed(slots) => slots.len(),
            SnapshotSet::Dynamic { slots, .. } => slots.len(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn get(&self, id: u64) -> Option<&Snapshot> {
        match self {
            SnapshotSet::Mono(slot) => slot.as_deref().filter(|s| s.core.id() == id),
            SnapshotSet::Fixed(slots) => slots
                .binary_search_by_key(&id, |s| s.core.id())
                .ok()
                .map(|at| &slots[at]),
            SnapshotSet::Dynamic { slots, index } => index.get(&id).map(|at| &slots[*at]),
        }
    }

    pub(crate) fn get_mut(&mut self, id: u64) -> Option<&mut Snapshot> {
        match self {
            SnapshotSet::Mono(slot) => slot.as_deref_mut().filter(|s| s.core.id() == id),
            SnapshotSet::Fixed(slots) => slots
                .binary_search_by_key(&id, |s| s.core.id())
                .ok()
                .map(|at| &mut slots[at]),
            SnapshotSet::Dynamic { slots, index } => {
                index.get(&id).map(|at| &mut slots[*at])
            }
        }
    }

    /// Records a snapshot for a reference this set does not hold yet.
    pub(crate) fn insert(&mut self, snapshot: Snapshot) -> Result<(), SetOverflow> {
        debug_assert!(
            self.get(snapshot.core.id()).is_none(),
            "one snapshot per reference"
        );
        let required = self.len() + 1;
        let fits = match self {
            SnapshotSet::Mono(slot) => slot.is_none(),
            SnapshotSet::Fixed(_) => required <= FIXED_CAPACITY,
            SnapshotSet::Dynamic { .. } => true,
        };
        if !fits {
            return Err(SetOverflow { required, snapshot });
        }
        self.push_unchecked(snapshot);
        Ok(())
    }

    fn push_unchecked(&mut self, snapshot: Snapshot) {
        match self {
            SnapshotSet::Mono(slot) => *slot = Some(Box::new(snapshot)),
            SnapshotSet::Fixed(slots) => {
                let at = slots
                    .binary_search_by_key(&snapshot.core.id(), |s| s.core.id())
                    .unwrap_or_else(|at| at);
                slots.insert(at, snapshot);
            }
            SnapshotSet::Dynamic { slots, index } => {
                index.insert(snapshot.core.id(), slots.len());
                slots.push(snapshot);
            }
        }
    }

    /// Grows the set to `target` in place, keeping every recorded snapshot.
    pub(crate) fn escalate(&mut self, target: Representation, pool: &mut TxnPool) {
        debug_assert!(target > self.representation(), "escalation only grows");
        let old = std::mem::replace(self, SnapshotSet::with_representation(target, pool));
        match old {
            SnapshotSet::Mono(slot) => {
                if let Some(snapshot) = slot {
                    self.push_unchecked(*snapshot);
                }
            }
            SnapshotSet::Fixed(mut slots) => {
                for snapshot in slots.drain(..) {
                    self.push_unchecked(snapshot);
                }
                pool.recycle_slots(slots);
            }
            SnapshotSet::Dynamic { mut slots, index } => {
                for snapshot in slots.drain(..) {
                    self.push_unchecked(snapshot);
                }
                pool.recycle_slots(slots);
                pool.recycle_index(index);
            }
        }
    }

    /// Drops every snapshot but keeps the representation and its backing
    /// storage, so the next attempt starts at the size this one learned.
    pub(crate) fn clear(&mut self) {
        match self {
            SnapshotSet::Mono(slot) => *slot = None,
            SnapshotSet::Fixed(slots) => slots.clear(),
            SnapshotSet::Dynamic { slots, index } => {
                slots.clear();
                index.clear();
            }
        }
    }

    /// Reference ids in ascending order; the order every commit locks in.
    pub(crate) fn ordered_ids(&self) -> Vec<u64> {
        match self {
            SnapshotSet::Mono(slot) => slot.iter().map(|s| s.core.id()).collect(),
            SnapshotSet::Fixed(slots) => slots.iter().map(|s| s.core.id()).collect(),
            SnapshotSet::Dynamic { slots, .. } => {
                let mut ids: Vec<u64> = slots.iter().map(|s| s.core.id()).collect();
                ids.sort_unstable();
                ids
            }
        }
    }

    fn parts(&self) -> (Option<&Snapshot>, &[Snapshot]) {
        match self {
            SnapshotSet::Mono(slot) => (slot.as_deref(), <&[Snapshot]>::default()),
            SnapshotSet::Fixed(slots) => (None, slots),
            SnapshotSet::Dynamic { slots, .. } => (None, slots),
        }
    }

    fn parts_mut(&mut self) -> (Option<&mut Snapshot>, &mut [Snapshot]) {
        match self {
            SnapshotSet::Mono(slot) => (slot.as_deref_mut(), <&mut [Snapshot]>::default()),
            SnapshotSet::Fixed(slots) => (None, slots),
            SnapshotSet::Dynamic { slots, .. } => (None, slots),
        }
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Snapshot> {
        let (mono, rest) = self.parts();
        mono.into_iter().chain(rest.iter())
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Snapshot> {
        let (mono, rest) = self.parts_mut();
        mono.into_iter().chain(rest.iter_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(id: u64) -> Snapshot {
        Snapshot {
            core: Arc::new(RefCore::new(id, Arc::new(0_u64))),
            read_version: 1,
            read_value: Arc::new(0_u64),
            staged: None,
            lock: LockMode::None,
            arrived: false,
            read_tracked: true,
            saw_readers: false,
        }
    }

    #[test]
    fn mono_holds_exactly_one_snapshot() {
        let mut pool = TxnPool::new(true);
        let mut set = SnapshotSet::with_representation(Representation::Mono, &mut pool);
        assert!(set.insert(snapshot(1)).is_ok());
        assert!(set.get(1).is_some());

        let overflow = set.insert(snapshot(2)).unwrap_err();
        assert_eq!(overflow.required, 2);
        assert_eq!(overflow.snapshot.core.id(), 2);
    }

    #[test]
    fn fixed_keeps_ids_sorted() {
        let mut pool = TxnPool::new(true);
        let mut set = SnapshotSet::with_representation(Representation::Fixed, &mut pool);
        for id in [5, 3, 9, 1] {
            set.insert(snapshot(id)).unwrap();
        }
        assert_eq!(set.ordered_ids(), vec![1, 3, 5, 9]);
        assert!(set.get(3).is_some());
        assert!(set.get(4).is_none());
    }

    #[test]
    fn fixed_overflows_past_capacity() {
        let mut pool = TxnPool::new(true);
        let mut set = SnapshotSet::with_representation(Representation::Fixed, &mut pool);
        for id in 0..FIXED_CAPACITY as u64 {
            set.insert(snapshot(id)).unwrap();
        }
        let overflow = set.insert(snapshot(99)).unwrap_err();
        assert_eq!(overflow.required, FIXED_CAPACITY + 1);
    }

    #[test]
    fn dynamic_is_unbounded_and_sorts_on_demand() {
        let mut pool = TxnPool::new(true);
        let mut set = SnapshotSet::with_representation(Representation::Dynamic, &mut pool);
        for id in (0..100).rev() {
            set.insert(snapshot(id)).unwrap();
        }
        assert_eq!(set.len(), 100);
        let ids = set.ordered_ids();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn escalation_carries_snapshots_forward() {
        let mut pool = TxnPool::new(true);
        let mut set = SnapshotSet::with_representation(Representation::Mono, &mut pool);
        let mut recorded = snapshot(7);
        recorded.staged = Some(Arc::new(42_u64));
        recorded.arrived = true;
        set.insert(recorded).unwrap();

        set.escalate(Representation::Fixed, &mut pool);
        assert_eq!(set.representation(), Representation::Fixed);
        let carried = set.get(7).unwrap();
        assert!(carried.arrived);
        assert!(carried.staged.is_some());

        set.escalate(Representation::Dynamic, &mut pool);
        assert_eq!(set.representation(), Representation::Dynamic);
        assert!(set.get(7).unwrap().arrived);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn clear_keeps_the_learned_representation() {
        let mut pool = TxnPool::new(true);
        let mut set = SnapshotSet::with_representation(Representation::Fixed, &mut pool);
        set.insert(snapshot(1)).unwrap();
        set.clear();
        assert!(set.is_empty());
        assert_eq!(set.representation(), Representation::Fixed);
    }

    #[test]
    fn dirty_check_spares_identity_writes() {
        let value: Payload = Arc::new(5_u64);
        let mut snap = snapshot(1);
        snap.read_value = Arc::clone(&value);

        snap.staged = Some(Arc::clone(&value));
        assert!(!snap.is_dirty(true));
        assert!(snap.is_dirty(false), "disabled check treats every write as dirty");

        snap.staged = Some(Arc::new(5_u64));
        assert!(snap.is_dirty(true), "a fresh allocation is a real write");
    }
}
