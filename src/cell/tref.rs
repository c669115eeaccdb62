//! The versioned transactional reference.

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::cell::orec::Orec;
use crate::errors::TxnResult;
use crate::retry::Listener;
use crate::transaction::Transaction;

/// Type-erased committed value. Every payload enters through a typed
/// [`TRef<T>`], so downcasting back to `T` at the API boundary cannot fail.
pub(crate) type Payload = Arc<dyn Any + Send + Sync>;

pub(crate) fn downcast_payload<T: Send + Sync + 'static>(payload: Payload) -> Arc<T> {
    payload
        .downcast::<T>()
        .expect("payload type is fixed by the typed reference that created it")
}

/// The committed state of a reference: the current value and the version
/// that stamped it. The pair only ever changes together, under the write
/// lock of the owning reference's ownership record.
struct CommittedCell {
    value: Payload,
    version: u64,
}

/// Shared, type-erased core of a transactional reference.
///
/// Holds the ownership record, the committed value/version pair, a lock-free
/// mirror of the version for cheap validation probes, and the wait list of
/// transactions blocked until this reference changes.
pub(crate) struct RefCore {
    id: u64,
    orec: Orec,
    /// Transaction id of the current write-lock holder, zero when free.
    /// Written right after the lock is won and cleared right before it is
    /// released, so a racing reader may see zero for a locked word; that
    /// reads as "locked by somebody else", which is the safe direction.
    owner: AtomicU64,
    committed: RwLock<CommittedCell>,
    /// Mirrors `committed.version` so validation can probe without taking
    /// the committed lock.
    version_mirror: AtomicU64,
    waiters: Mutex<Option<Box<Listener>>>,
}

impl RefCore {
    /// Versions start here; a `read_version` of zero can never validate.
    const INITIAL_VERSION: u64 = 1;

    pub(crate) fn new(id: u64, value: Payload) -> Self {
        Self {
            id,
            orec: Orec::new(),
            owner: AtomicU64::new(0),
            committed: RwLock::new(CommittedCell {
                value,
                version: Self::INITIAL_VERSION,
            }),
            version_mirror: AtomicU64::new(Self::INITIAL_VERSION),
            waiters: Mutex::new(None),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn orec(&self) -> &Orec {
        &self.orec
    }

    /// Cheap version probe used by validation scans.
    pub(crate) fn version(&self) -> u64 {
        self.version_mirror.load(Ordering::Acquire)
    }

    /// Loads the committed value/version pair as one consistent unit.
    pub(crate) fn committed_pair(&self) -> (Payload, u64) {
        let cell = self.committed.read();
        (Arc::clone(&cell.value), cell.version)
    }

    /// Installs a new committed value and returns the version that stamps it.
    ///
    /// The caller must hold this reference's write lock; nothing else
    /// enforces exclusivity here.
    pub(crate) fn install(&self, value: Payload) -> u64 {
        let mut cell = self.committed.write();
        cell.version += 1;
        cell.value = value;
        self.version_mirror.store(cell.version, Ordering::Release);
        cell.version
    }

    pub(crate) fn set_owner(&self, txn_id: u64) {
        self.owner.store(txn_id, Ordering::SeqCst);
    }

    pub(crate) fn clear_owner(&self) {
        self.owner.store(0, Ordering::SeqCst);
    }

    /// True when the word is write-locked and the holder is not `txn_id`.
    pub(crate) fn write_locked_by_other(&self, txn_id: u64) -> bool {
        self.orec.load().write_locked && self.owner.load(Ordering::SeqCst) != txn_id
    }

    /// Hangs a wait-list node on this reference.
    pub(crate) fn register_waiter(&self, mut node: Box<Listener>) {
        let mut head = self.waiters.lock();
        node.next = head.take();
        *head = Some(node);
    }

    /// Takes the whole wait list, transferring ownership to the caller.
    pub(crate) fn detach_waiters(&self) -> Option<Box<Listener>> {
        self.waiters.lock().take()
    }
}

/// A typed handle to transactionally shared state.
///
/// A `TRef<T>` owns nothing by itself: it is a cheaply clonable pointer to a
/// shared cell holding the committed value and the bookkeeping that lets many
/// transactions read and write it concurrently. All access inside a
/// transaction goes through [`read`](TRef::read), [`write`](TRef::write),
/// and friends; [`atomic_get`](TRef::atomic_get) peeks at the latest
/// committed value without a transaction.
///
/// Values live behind `Arc`, so reading never clones your data and writing
/// replaces the whole value. Clone the handle freely to share it across
/// threads.
///
/// # Examples
///
/// ```
/// use seshat::Seshat;
///
/// let stm = Seshat::default();
/// let balance = stm.new_ref(100_i64);
///
/// stm.execute(|tx| {
///     let current = *balance.read(tx)?;
///     balance.write(tx, current + 25)
/// })
/// .expect("transaction failed");
///
/// assert_eq!(*balance.atomic_get(), 125);
/// ```
pub struct TRef<T> {
    core: Arc<RefCore>,
    _marker: PhantomData<T>,
}

impl<T> Clone for TRef<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            _marker: PhantomData,
        }
    }
}

impl<T: Send + Sync + 'static> TRef<T> {
    pub(crate) fn new(id: u64, value: T) -> Self {
        Self {
            core: Arc::new(RefCore::new(id, Arc::new(value))),
            _marker: PhantomData,
        }
    }

    pub(crate) fn core(&self) -> &Arc<RefCore> {
        &self.core
    }

    /// Reads the reference inside a transaction.
    ///
    /// Returns the transaction's own staged write if there is one, the value
    /// recorded by an earlier read under a tracking isolation level, or the
    /// latest committed value otherwise.
    ///
    /// # Errors
    ///
    /// Returns a conflict signal when the reference is mid-commit in another
    /// transaction or when recording this read proves an earlier read stale;
    /// the execution loop treats those by restarting the transaction.
    ///
    /// # Examples
    ///
    /// ```
    /// use seshat::Seshat;
    ///
    /// let stm = Seshat::default();
    /// let counter = stm.new_ref(7_u32);
    ///
    /// let seen = stm.execute(|tx| Ok(*counter.read(tx)?)).unwrap();
    /// assert_eq!(seen, 7);
    /// ```
    pub fn read(&self, tx: &mut Transaction) -> TxnResult<Arc<T>> {
        tx.read(self)
    }

    /// Stages `value` to be committed by the transaction.
    ///
    /// The write stays private to the transaction until commit; other
    /// transactions keep seeing the previous committed value.
    ///
    /// # Errors
    ///
    /// Fails with a fatal error on a read-only transaction, and with a
    /// conflict signal under pessimistic write locking when another
    /// transaction holds the reference.
    pub fn write(&self, tx: &mut Transaction, value: T) -> TxnResult<()> {
        tx.write(self, value)
    }

    /// Stages an already-shared value.
    ///
    /// Writing back the exact `Arc` returned by [`read`](TRef::read) marks
    /// the reference clean: with the dirty check enabled the commit will not
    /// bump its version or conflict with concurrent readers.
    pub fn write_arc(&self, tx: &mut Transaction, value: Arc<T>) -> TxnResult<()> {
        tx.write_arc(self, value)
    }

    /// Reads the current value and stages the result of `f` over it.
    ///
    /// # Examples
    ///
    /// ```
    /// use seshat::Seshat;
    ///
    /// let stm = Seshat::default();
    /// let counter = stm.new_ref(0_i64);
    ///
    /// stm.execute(|tx| counter.modify(tx, |n| n + 1)).unwrap();
    /// assert_eq!(*counter.atomic_get(), 1);
    /// ```
    pub fn modify<F>(&self, tx: &mut Transaction, f: F) -> TxnResult<()>
    where
        F: FnOnce(&T) -> T,
    {
        let current = tx.read(self)?;
        tx.write(self, f(&current))
    }

    /// Returns the latest committed value without a transaction.
    ///
    /// This is a single consistent read of one reference. It takes part in
    /// no conflict detection; use a transaction when you need two reads to
    /// be mutually consistent.
    pub fn atomic_get(&self) -> Arc<T> {
        downcast_payload(self.core.committed_pair().0)
    }

    /// Returns the version stamped on the latest committed value.
    ///
    /// Versions start at one when the reference is created and grow by one
    /// with every committed write.
    pub fn committed_version(&self) -> u64 {
        self.core.version()
    }
}

impl<T> fmt::Debug for TRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TRef")
            .field("id", &self.core.id())
            .field("version", &self.core.version())
            .finish()
    }
}
