//! Per-transaction recycling of commit-path allocations.
//!
//! Soft resets, blocking rounds, and speculative escalation all churn through
//! the same few object shapes: wait-list nodes, snapshot slot vectors, and the
//! index map behind the dynamic snapshot representation. Each transaction
//! carries a small private [`TxnPool`] so that a hot retry loop stops paying
//! the allocator after its first attempt. The pool is plain bookkeeping with
//! no locks; it is never shared between threads.

use ahash::AHashMap as HashMap;
use std::sync::Arc;

use crate::retry::{Listener, RetryLatch};
use crate::tracking::Snapshot;

/// Most wait-list nodes a pool will hold on to before dropping extras.
const LISTENER_CAP: usize = 64;
/// Most snapshot slot vectors a pool will hold on to.
const SLOT_VEC_CAP: usize = 8;
/// Most dynamic index maps a pool will hold on to.
const INDEX_CAP: usize = 4;

/// Transaction-local free lists for the allocation-heavy retry machinery.
///
/// Every `take_*` either reuses a recycled object or allocates a fresh one;
/// every `recycle_*` clears payload references before storing the object, and
/// simply drops it once the per-shape cap is reached. A disabled pool (see
/// `TxnConfig::pooling`) degrades to allocate-and-drop with no change in
/// behavior.
pub(crate) struct TxnPool {
    enabled: bool,
    listeners: Vec<Box<Listener>>,
    slot_vecs: Vec<Vec<Snapshot>>,
    index_maps: Vec<HashMap<u64, usize>>,
}

impl TxnPool {
    pub(crate) fn new(enabled: bool) -> Self {
        Self {
            enabled,
            listeners: Vec::new(),
            slot_vecs: Vec::new(),
            index_maps: Vec::new(),
        }
    }

    /// Hands out a wait-list node armed with `latch` and `era`.
    pub(crate) fn take_listener(&mut self, latch: Arc<RetryLatch>, era: u64) -> Box<Listener> {
        match self.listeners.pop() {
            Some(mut node) => {
                node.latch = Some(latch);
                node.era = era;
                node.next = None;
                node
            }
            None => Box::new(Listener {
                latch: Some(latch),
                era,
                next: None,
            }),
        }
    }

    /// Returns a wait-list node after its latch has been opened or discarded.
    pub(crate) fn recycle_listener(&mut self, mut node: Box<Listener>) {
        if !self.enabled || self.listeners.len() >= LISTENER_CAP {
            return;
        }
        node.latch = None;
        node.next = None;
        self.listeners.push(node);
    }

    /// Hands out a snapshot slot vector with room for at least `capacity`
    /// entries, preferring a recycled vector whose backing store is already
    /// large enough.
    pub(crate) fn take_slots(&mut self, capacity: usize) -> Vec<Snapshot> {
        if let Some(at) = self.slot_vecs.iter().position(|v| v.capacity() >= capacity) {
            return self.slot_vecs.swap_remove(at);
        }
        Vec::with_capacity(capacity)
    }

    /// Returns a slot vector, dropping every snapshot it still holds.
    pub(crate) fn recycle_slots(&mut self, mut slots: Vec<Snapshot>) {
        slots.clear();
        if self.enabled && self.slot_vecs.len() < SLOT_VEC_CAP {
            self.slot_vecs.push(slots);
        }
    }

    /// Hands out an empty id-to-slot index for the dynamic representation.
    pub(crate) fn take_index(&mut self) -> HashMap<u64, usize> {
        self.index_maps.pop().unwrap_or_default()
    }

    /// Returns an index map after clearing it.
    pub(crate) fn recycle_index(&mut self, mut index: HashMap<u64, usize>) {
        index.clear();
        if self.enabled && self.index_maps.len() < INDEX_CAP {
            self.index_maps.push(index);
        }
    }
}
