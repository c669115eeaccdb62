//! The transaction: tracked access to references and the five-phase commit.
//!
//! A transaction is a plain owned object. It records one snapshot per
//! reference it touches, keeps staged writes private until commit, and runs
//! the commit protocol itself: lock in ascending reference-id order,
//! validate, write back, unlock, depart. Restart decisions live in the
//! execution loop; this type only raises the signals the loop acts on.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::cell::orec::{Arrive, OrecView};
use crate::cell::tref::{Payload, RefCore, TRef, downcast_payload};
use crate::config::TxnConfig;
use crate::conflict::detection;
use crate::errors::{Result, SeshatError, Signal, TxnResult};
use crate::pool::TxnPool;
use crate::retry::{self, RetryLatch};
use crate::seshat::EngineShared;
use crate::tracking::{Representation, Snapshot, SnapshotSet};
use crate::{IsolationLevel, LockMode};

/// Spins granted to a lock holder before an access gives up and signals a
/// conflict. Commits hold locks for nanoseconds, so a short spin usually
/// rides them out.
const LOCK_SPIN: usize = 64;

/// The lifecycle states of a [`Transaction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnStatus {
    /// Accepting reads and writes. Fresh transactions start here and
    /// [`Transaction::soft_reset`] returns here.
    Active,
    /// [`Transaction::prepare`] succeeded: locks are held and validation
    /// passed. The only ways out are [`Transaction::commit`] and
    /// [`Transaction::abort`].
    Prepared,
    /// Terminal. Every staged write is visible to other transactions.
    Committed,
    /// Every staged write is discarded and the footprint released. A soft
    /// reset can revive the transaction for another attempt.
    Aborted,
}

fn spin_lock_write(core: &RefCore) -> Option<OrecView> {
    let mut spins = 0;
    loop {
        if let Some(prior) = core.orec().try_lock_write() {
            return Some(prior);
        }
        if spins == LOCK_SPIN {
            return None;
        }
        spins += 1;
        std::hint::spin_loop();
    }
}

fn spin_upgrade_to_write(core: &RefCore) -> Option<OrecView> {
    let mut spins = 0;
    loop {
        if let Some(prior) = core.orec().try_upgrade_to_write() {
            return Some(prior);
        }
        if spins == LOCK_SPIN {
            return None;
        }
        spins += 1;
        std::hint::spin_loop();
    }
}

fn spin_lock_read(core: &RefCore) -> bool {
    let mut spins = 0;
    loop {
        if core.orec().try_lock_read() {
            return true;
        }
        if spins == LOCK_SPIN {
            return false;
        }
        spins += 1;
        std::hint::spin_loop();
    }
}

/// A single transaction over the references of one engine.
///
/// Transactions come from [`Seshat::begin_transaction`] or a
/// [`TxnFactory`](crate::seshat::TxnFactory); most callers never drive one
/// directly and go through [`Seshat::execute`] instead, which owns the
/// retry/backoff loop. The lower-level surface here is for callers that
/// need explicit control: two-phase commit via [`prepare`](Self::prepare),
/// manual restarts via [`soft_reset`](Self::soft_reset), or blocking on a
/// read set via [`retry`](Self::retry).
///
/// [`Seshat::begin_transaction`]: crate::seshat::Seshat::begin_transaction
/// [`Seshat::execute`]: crate::seshat::Seshat::execute
///
/// # Examples
///
/// ```
/// use seshat::Seshat;
///
/// let stm = Seshat::default();
/// let cell = stm.new_ref(1_i64);
///
/// let mut tx = stm.begin_transaction();
/// let current = *cell.read(&mut tx).unwrap();
/// cell.write(&mut tx, current + 1).unwrap();
/// tx.commit().unwrap();
///
/// assert_eq!(*cell.atomic_get(), 2);
/// ```
pub struct Transaction {
    /// Engine-unique id, used for lock ownership and logging.
    id: u64,
    /// Attempt number, starting at 1 and bumped by each soft reset.
    attempt: u32,
    status: TxnStatus,
    config: TxnConfig,
    shared: Arc<EngineShared>,
    /// One snapshot per touched reference.
    set: SnapshotSet,
    /// Conflict counter value as of the last moment every snapshot in
    /// `set` was known valid.
    counter_snapshot: u64,
    /// Set once the transaction reads a biased or saturated reference;
    /// from then on the cheap counter comparison proves nothing and every
    /// validation must scan.
    full_scan_required: bool,
    /// Blocking budget left across all retry rounds of this transaction.
    timeout_remaining: Option<Duration>,
    pool: TxnPool,
    latch: Arc<RetryLatch>,
}

impl Transaction {
    pub(crate) fn new(
        shared: Arc<EngineShared>,
        config: TxnConfig,
        initial: Representation,
    ) -> Self {
        let id = shared.next_txn_id();
        let counter_snapshot = shared.conflict_counter.snapshot();
        let timeout_remaining = config.timeout;
        let mut pool = TxnPool::new(config.pooling);
        let set = SnapshotSet::with_representation(initial, &mut pool);
        debug!("transaction {id} begins with {initial:?} snapshot storage");
        Self {
            id,
            attempt: 1,
            status: TxnStatus::Active,
            config,
            shared,
            set,
            counter_snapshot,
            full_scan_required: false,
            timeout_remaining,
            pool,
            latch: Arc::new(RetryLatch::new()),
        }
    }

    /// Returns the engine-unique id of this transaction.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the current attempt number, starting at 1.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Returns the lifecycle state of this transaction.
    pub fn status(&self) -> TxnStatus {
        self.status
    }

    /// Returns the configuration this transaction runs under.
    pub fn config(&self) -> &TxnConfig {
        &self.config
    }

    fn ensure_active(&self, op: &'static str) -> Result<()> {
        if self.status == TxnStatus::Active {
            Ok(())
        } else {
            Err(SeshatError::IllegalState {
                op,
                status: self.status,
            })
        }
    }

    /// Reads a reference inside this transaction.
    ///
    /// Returns, in order of preference: the value this transaction staged
    /// for the reference, the value recorded by an earlier tracked read, or
    /// the latest committed value. Under a tracking isolation level the
    /// first read of a reference records a snapshot, announces the
    /// transaction on the reference's ownership record, and revalidates the
    /// snapshots recorded so far whenever the global conflict counter shows
    /// movement.
    ///
    /// # Errors
    ///
    /// * [`Signal::ReadWriteConflict`] when the reference stays write-locked
    ///   by another transaction past a short spin, or when recording this
    ///   read proves an earlier snapshot stale.
    /// * [`Signal::WriteConflict`] under pessimistic lock modes when the
    ///   access-time lock cannot be acquired.
    /// * [`Signal::SpeculativeOverflow`] when the snapshot storage is full;
    ///   the execution loop escalates and re-runs.
    /// * [`SeshatError::IllegalState`] when the transaction is no longer
    ///   active.
    pub fn read<T: Send + Sync + 'static>(&mut self, tref: &TRef<T>) -> TxnResult<Arc<T>> {
        Ok(downcast_payload(self.read_core(tref.core())?))
    }

    /// Stages `value` for `tref`; the write stays private until commit.
    ///
    /// # Errors
    ///
    /// * [`SeshatError::ReadonlyWrite`] on a read-only transaction.
    /// * [`Signal::WriteConflict`] under pessimistic write locking when the
    ///   reference cannot be locked.
    /// * [`Signal::SpeculativeOverflow`] when the snapshot storage is full.
    /// * [`SeshatError::IllegalState`] when the transaction is no longer
    ///   active.
    pub fn write<T: Send + Sync + 'static>(&mut self, tref: &TRef<T>, value: T) -> TxnResult<()> {
        self.write_core(tref.core(), Arc::new(value))
    }

    /// Stages an already-shared value for `tref`.
    ///
    /// Staging back the exact `Arc` returned by [`read`](Self::read) leaves
    /// the snapshot clean under the dirty check, so commit treats the
    /// reference as merely read.
    pub fn write_arc<T: Send + Sync + 'static>(
        &mut self,
        tref: &TRef<T>,
        value: Arc<T>,
    ) -> TxnResult<()> {
        let payload: Payload = value;
        self.write_core(tref.core(), payload)
    }

    pub(crate) fn read_core(&mut self, core: &Arc<RefCore>) -> TxnResult<Payload> {
        self.ensure_active("read in")?;
        if let Some(snapshot) = self.set.get(core.id()) {
            return Ok(snapshot.current_value());
        }
        if !self.config.tracks_reads() {
            // Read-committed: always the latest committed value, nothing
            // recorded.
            return Ok(core.committed_pair().0);
        }

        self.revalidate_for_new_read()?;

        // Announce before loading, so every later overwrite of this
        // reference is forced to signal the conflict counter.
        let mut lock = LockMode::None;
        let mut arrived = false;
        let mut saw_readers = false;
        match self.config.read_lock_mode {
            LockMode::None => {
                let mut spins = 0;
                loop {
                    match core.orec().arrive() {
                        Arrive::Tracked => {
                            arrived = true;
                            break;
                        }
                        Arrive::Biased | Arrive::Overflow => {
                            self.full_scan_required = true;
                            break;
                        }
                        Arrive::Locked => {
                            if spins == LOCK_SPIN {
                                debug!(
                                    "transaction {} found reference {} locked while reading",
                                    self.id,
                                    core.id()
                                );
                                return Err(Signal::ReadWriteConflict.into());
                            }
                            spins += 1;
                            std::hint::spin_loop();
                        }
                    }
                }
            }
            LockMode::Read => {
                if !spin_lock_read(core) {
                    debug!(
                        "transaction {} failed to read-lock reference {}",
                        self.id,
                        core.id()
                    );
                    return Err(Signal::WriteConflict.into());
                }
                lock = LockMode::Read;
            }
            LockMode::Write => {
                let Some(prior) = spin_lock_write(core) else {
                    debug!(
                        "transaction {} failed to write-lock reference {} for reading",
                        self.id,
                        core.id()
                    );
                    return Err(Signal::WriteConflict.into());
                };
                core.set_owner(self.id);
                lock = LockMode::Write;
                saw_readers = prior.read_biased || prior.surplus > 0;
            }
        }

        let (read_value, read_version) = core.committed_pair();
        let snapshot = Snapshot {
            core: Arc::clone(core),
            read_version,
            read_value: Arc::clone(&read_value),
            staged: None,
            lock,
            arrived,
            read_tracked: true,
            saw_readers,
        };
        match self.set.insert(snapshot) {
            Ok(()) => {
                trace!(
                    "transaction {} read reference {} at version {}",
                    self.id,
                    core.id(),
                    read_version
                );
                Ok(read_value)
            }
            Err(overflow) => {
                self.release_unrecorded(overflow.snapshot);
                Err(Signal::SpeculativeOverflow {
                    required: overflow.required,
                }
                .into())
            }
        }
    }

    pub(crate) fn write_core(&mut self, core: &Arc<RefCore>, value: Payload) -> TxnResult<()> {
        self.ensure_active("write in")?;
        if self.config.readonly {
            return Err(SeshatError::ReadonlyWrite.into());
        }
        let id = core.id();

        if let Some(snapshot) = self.set.get(id) {
            let held = snapshot.lock;
            let arrived = snapshot.arrived;
            if self.config.write_lock_mode == LockMode::Write && held < LockMode::Write {
                let locked = if held == LockMode::Read {
                    spin_upgrade_to_write(core)
                } else {
                    spin_lock_write(core)
                };
                let Some(prior) = locked else {
                    debug!(
                        "transaction {} failed to write-lock reference {id}",
                        self.id
                    );
                    return Err(Signal::WriteConflict.into());
                };
                core.set_owner(self.id);
                let saw = prior.read_biased || prior.surplus > u16::from(arrived);
                if let Some(snapshot) = self.set.get_mut(id) {
                    snapshot.lock = LockMode::Write;
                    snapshot.saw_readers = snapshot.saw_readers || saw;
                }
            }
            if let Some(snapshot) = self.set.get_mut(id) {
                snapshot.staged = Some(value);
            }
            return Ok(());
        }

        // First touch of the reference is a write: no arrive, no tracking.
        let mut lock = LockMode::None;
        let mut saw_readers = false;
        match self.config.write_lock_mode {
            LockMode::Write => {
                let Some(prior) = spin_lock_write(core) else {
                    debug!(
                        "transaction {} failed to write-lock reference {id}",
                        self.id
                    );
                    return Err(Signal::WriteConflict.into());
                };
                core.set_owner(self.id);
                lock = LockMode::Write;
                saw_readers = prior.read_biased || prior.surplus > 0;
            }
            LockMode::Read => {
                if !spin_lock_read(core) {
                    debug!(
                        "transaction {} failed to read-lock reference {id} for writing",
                        self.id
                    );
                    return Err(Signal::WriteConflict.into());
                }
                lock = LockMode::Read;
            }
            LockMode::None => {
                let mut spins = 0;
                while core.write_locked_by_other(self.id) {
                    if spins == LOCK_SPIN {
                        debug!(
                            "transaction {} found reference {id} locked while staging a write",
                            self.id
                        );
                        return Err(Signal::WriteConflict.into());
                    }
                    spins += 1;
                    std::hint::spin_loop();
                }
            }
        }

        let (read_value, read_version) = core.committed_pair();
        let snapshot = Snapshot {
            core: Arc::clone(core),
            read_version,
            read_value,
            staged: Some(value),
            lock,
            arrived: false,
            read_tracked: false,
            saw_readers,
        };
        match self.set.insert(snapshot) {
            Ok(()) => {
                trace!(
                    "transaction {} staged a write to reference {id} over version {read_version}",
                    self.id
                );
                Ok(())
            }
            Err(overflow) => {
                self.release_unrecorded(overflow.snapshot);
                Err(Signal::SpeculativeOverflow {
                    required: overflow.required,
                }
                .into())
            }
        }
    }

    /// Undoes the side effects of a snapshot that never made it into the
    /// set because the storage was full.
    fn release_unrecorded(&mut self, snapshot: Snapshot) {
        match snapshot.lock {
            LockMode::Write => {
                snapshot.core.clear_owner();
                snapshot.core.orec().unlock_write(false);
            }
            LockMode::Read => snapshot.core.orec().unlock_read(),
            LockMode::None => {}
        }
        if snapshot.arrived {
            snapshot
                .core
                .orec()
                .depart(false, self.config.read_biased_threshold);
        }
    }

    /// Re-proves every recorded snapshot before a new one joins the set.
    ///
    /// Cheap path: if no biased reference poisoned the counter shortcut and
    /// the conflict counter has not moved since the snapshots were last
    /// known valid, nothing they depend on can have been overwritten. The
    /// counter is sampled before the scan, so a commit racing with the scan
    /// is caught by the next comparison.
    fn revalidate_for_new_read(&mut self) -> TxnResult<()> {
        if self.set.is_empty() {
            self.counter_snapshot = self.shared.conflict_counter.snapshot();
            return Ok(());
        }
        let current = self.shared.conflict_counter.snapshot();
        if !self.full_scan_required && current == self.counter_snapshot {
            return Ok(());
        }
        detection::validate_all(self.id, &self.set)?;
        if !self.full_scan_required {
            self.counter_snapshot = current;
        }
        Ok(())
    }

    /// Acquires commit locks and validates, leaving the transaction in
    /// [`TxnStatus::Prepared`] with its write locks held.
    ///
    /// Between a successful prepare and the following [`commit`](Self::commit)
    /// no other transaction can commit a write to any reference this one
    /// will install, which makes the pair usable as the voting half of a
    /// two-phase commit. A prepared transaction accepts no further reads or
    /// writes; it can only commit or abort.
    ///
    /// # Errors
    ///
    /// Conflict signals exactly as [`commit`](Self::commit); the footprint
    /// is released before the error returns.
    ///
    /// # Examples
    ///
    /// ```
    /// use seshat::Seshat;
    ///
    /// let stm = Seshat::default();
    /// let cell = stm.new_ref(0_i64);
    ///
    /// let mut tx = stm.begin_transaction();
    /// cell.write(&mut tx, 7).unwrap();
    /// tx.prepare().unwrap();
    /// tx.commit().unwrap();
    /// assert_eq!(*cell.atomic_get(), 7);
    /// ```
    pub fn prepare(&mut self) -> TxnResult<()> {
        self.ensure_active("prepare")?;
        self.prepare_phases()?;
        self.status = TxnStatus::Prepared;
        debug!(
            "transaction {} prepared with {} snapshots",
            self.id,
            self.set.len()
        );
        Ok(())
    }

    /// Commits the transaction, making every staged write visible at once.
    ///
    /// The commit runs in five phases. Write locks are taken on dirty
    /// references in ascending reference-id order, which rules out
    /// deadlock between committers. Validation then re-proves the read
    /// set, cheaply when the conflict counter allows it. The surviving
    /// writes are installed with a version bump each, wait lists detach
    /// with the installs, locks drop, parked waiters wake, and finally
    /// every arrived snapshot departs its reference.
    ///
    /// A transaction that staged nothing, or whose writes were all clean
    /// under the dirty check, commits without taking a single lock.
    ///
    /// # Errors
    ///
    /// * [`Signal::WriteConflict`] when a dirty reference cannot be locked.
    /// * [`Signal::ReadWriteConflict`] when validation finds a stale
    ///   snapshot.
    /// * [`SeshatError::IllegalState`] when called on a committed or
    ///   aborted transaction.
    ///
    /// On a conflict signal the footprint is fully released and the
    /// transaction stays in its current state; [`soft_reset`](Self::soft_reset)
    /// turns it into a fresh attempt.
    pub fn commit(&mut self) -> TxnResult<()> {
        match self.status {
            TxnStatus::Active => {
                self.prepare_phases()?;
                self.finish_commit();
                Ok(())
            }
            TxnStatus::Prepared => {
                self.finish_commit();
                Ok(())
            }
            status => Err(SeshatError::IllegalState {
                op: "commit",
                status,
            }
            .into()),
        }
    }

    fn prepare_phases(&mut self) -> TxnResult<()> {
        if let Err(signal) = self.lock_phase().and_then(|()| self.validate_phase()) {
            self.rollback_footprint();
            return Err(signal.into());
        }
        Ok(())
    }

    /// Phase 1: write locks on dirty references, in ascending id order.
    /// Under serializable isolation, read locks on everything else.
    fn lock_phase(&mut self) -> std::result::Result<(), Signal> {
        let dirty_check = self.config.dirty_check;
        let serializable = self.config.isolation == IsolationLevel::Serializable;
        for id in self.set.ordered_ids() {
            let Some(snapshot) = self.set.get(id) else {
                continue;
            };
            let core = Arc::clone(&snapshot.core);
            let held = snapshot.lock;
            let arrived = snapshot.arrived;
            let dirty = snapshot.is_dirty(dirty_check);

            if dirty && held < LockMode::Write {
                let locked = if held == LockMode::Read {
                    spin_upgrade_to_write(&core)
                } else {
                    spin_lock_write(&core)
                };
                let Some(prior) = locked else {
                    debug!(
                        "transaction {} failed to lock reference {id} for commit",
                        self.id
                    );
                    return Err(Signal::WriteConflict);
                };
                core.set_owner(self.id);
                let saw = prior.read_biased || prior.surplus > u16::from(arrived);
                if let Some(snapshot) = self.set.get_mut(id) {
                    snapshot.lock = LockMode::Write;
                    snapshot.saw_readers = snapshot.saw_readers || saw;
                }
            } else if serializable && !dirty && held == LockMode::None {
                if !spin_lock_read(&core) {
                    debug!(
                        "transaction {} failed to read-lock reference {id} for commit",
                        self.id
                    );
                    return Err(Signal::WriteConflict);
                }
                if let Some(snapshot) = self.set.get_mut(id) {
                    snapshot.lock = LockMode::Read;
                }
            }
        }
        Ok(())
    }

    /// Phase 2: re-prove the snapshots. Written references are always
    /// probed; read-only ones only when the counter comparison cannot rule
    /// out a conflict.
    fn validate_phase(&mut self) -> std::result::Result<(), Signal> {
        let current = self.shared.conflict_counter.snapshot();
        if self.full_scan_required || current != self.counter_snapshot {
            detection::validate_all(self.id, &self.set)
        } else {
            detection::validate_written(self.id, &self.set, self.config.dirty_check)
        }
    }

    /// Phases 3 to 5: write back, unlock and wake, depart. Infallible.
    fn finish_commit(&mut self) {
        let dirty_check = self.config.dirty_check;
        let threshold = self.config.read_biased_threshold;

        // Counter movement first, so a validation racing with these
        // installs errs toward the full scan.
        if self
            .set
            .iter()
            .any(|s| s.is_dirty(dirty_check) && s.saw_readers)
        {
            self.shared.conflict_counter.signal_commit();
        }

        // Phase 3: install new values in id order and detach wait lists.
        let mut writes = 0_u32;
        let mut chains = Vec::new();
        for id in self.set.ordered_ids() {
            let Some(snapshot) = self.set.get_mut(id) else {
                continue;
            };
            if !snapshot.is_dirty(dirty_check) {
                continue;
            }
            let Some(staged) = &snapshot.staged else {
                continue;
            };
            debug_assert_eq!(snapshot.lock, LockMode::Write);
            let version = snapshot.core.install(Arc::clone(staged));
            writes += 1;
            trace!(
                "transaction {} installed reference {id} at version {version}",
                self.id
            );
            if let Some(head) = snapshot.core.detach_waiters() {
                chains.push(head);
            }
        }

        // Phase 4 and 5: drop locks, then retire the arrives.
        for snapshot in self.set.iter_mut() {
            let installed = snapshot.is_dirty(dirty_check);
            match snapshot.lock {
                LockMode::Write => {
                    snapshot.core.clear_owner();
                    if snapshot.core.orec().unlock_write(installed) {
                        debug!(
                            "transaction {} demoted reference {} from read-biased",
                            self.id,
                            snapshot.core.id()
                        );
                    }
                }
                LockMode::Read => snapshot.core.orec().unlock_read(),
                LockMode::None => {}
            }
            snapshot.lock = LockMode::None;
            if snapshot.arrived {
                if snapshot.core.orec().depart(!installed, threshold) {
                    debug!(
                        "transaction {} promoted reference {} to read-biased",
                        self.id,
                        snapshot.core.id()
                    );
                }
                snapshot.arrived = false;
            }
        }

        // Wake everyone parked on the overwritten references.
        let chain_count = chains.len();
        for head in chains {
            retry::open_chain(Some(head), &mut self.pool);
        }

        self.status = TxnStatus::Committed;
        self.set.clear();
        debug!(
            "transaction {} committed {writes} writes at attempt {} ({chain_count} wait lists woken)",
            self.id, self.attempt
        );
    }

    /// Aborts the transaction, discarding staged writes and releasing the
    /// whole footprint.
    ///
    /// Aborting an already aborted transaction is a no-op.
    ///
    /// # Errors
    ///
    /// [`SeshatError::IllegalState`] when the transaction has committed.
    pub fn abort(&mut self) -> Result<()> {
        match self.status {
            TxnStatus::Active | TxnStatus::Prepared => {
                self.rollback_footprint();
                self.set.clear();
                self.status = TxnStatus::Aborted;
                debug!("transaction {} aborted at attempt {}", self.id, self.attempt);
                Ok(())
            }
            TxnStatus::Aborted => Ok(()),
            TxnStatus::Committed => Err(SeshatError::IllegalState {
                op: "abort",
                status: TxnStatus::Committed,
            }),
        }
    }

    /// Releases every lock and arrive this transaction holds. Idempotent:
    /// each release clears the flag that caused it.
    fn rollback_footprint(&mut self) {
        let threshold = self.config.read_biased_threshold;
        for snapshot in self.set.iter_mut() {
            match snapshot.lock {
                LockMode::Write => {
                    snapshot.core.clear_owner();
                    snapshot.core.orec().unlock_write(false);
                }
                LockMode::Read => snapshot.core.orec().unlock_read(),
                LockMode::None => {}
            }
            snapshot.lock = LockMode::None;
            if snapshot.arrived {
                snapshot.core.orec().depart(false, threshold);
                snapshot.arrived = false;
            }
        }
    }

    /// Turns a conflicted or aborted transaction into a fresh attempt,
    /// keeping its identity, its escalated snapshot storage, and what
    /// remains of its blocking budget.
    ///
    /// Returns `false` without changing anything when the attempt budget is
    /// exhausted; the execution loop maps that to
    /// [`SeshatError::AttemptsExhausted`].
    pub fn soft_reset(&mut self) -> bool {
        debug_assert_ne!(self.status, TxnStatus::Committed, "reset of a committed transaction");
        if self.status == TxnStatus::Committed || self.attempt >= self.config.max_retries {
            return false;
        }
        self.rollback_footprint();
        self.set.clear();
        self.attempt += 1;
        self.status = TxnStatus::Active;
        self.counter_snapshot = self.shared.conflict_counter.snapshot();
        self.full_scan_required = false;
        trace!("transaction {} starts attempt {}", self.id, self.attempt);
        true
    }

    /// Parks the transaction until another transaction commits a write to
    /// any reference in its read set, then leaves it aborted and ready for
    /// a [`soft_reset`](Self::soft_reset).
    ///
    /// One wait-list node per tracked read is registered before the
    /// footprint is released; each reference is then re-probed so a write
    /// that committed during registration opens the latch instead of being
    /// missed. A woken transaction is guaranteed to observe the write that
    /// woke it on its next attempt.
    ///
    /// # Errors
    ///
    /// * [`SeshatError::RetryNotPossible`] when blocking is disabled or
    ///   the transaction has no tracked reads to wait on.
    /// * [`SeshatError::RetryTimeout`] when the configured blocking budget
    ///   runs out; the budget spans all blocking rounds of the transaction.
    /// * [`SeshatError::IllegalState`] when the transaction is not active.
    ///
    /// # Examples
    ///
    /// ```
    /// use seshat::{Seshat, SeshatError, TxnConfig};
    /// use std::time::Duration;
    ///
    /// let stm = Seshat::default();
    /// let factory = stm
    ///     .factory(TxnConfig::default().with_timeout(Duration::from_millis(10)))
    ///     .unwrap();
    /// let flag = stm.new_ref(false);
    ///
    /// let mut tx = factory.begin();
    /// let _ = flag.read(&mut tx).unwrap();
    /// // Nobody writes `flag`, so the blocking budget runs out.
    /// let err = tx.retry().unwrap_err();
    /// assert!(matches!(err, SeshatError::RetryTimeout { .. }));
    /// ```
    pub fn retry(&mut self) -> Result<()> {
        self.ensure_active("retry")?;
        let tracked = self.set.iter().filter(|s| s.read_tracked).count();
        if !self.config.blocking || tracked == 0 {
            return Err(SeshatError::RetryNotPossible);
        }

        let era = self.latch.rearm();
        let mut already_changed = false;
        for snapshot in self.set.iter() {
            if !snapshot.read_tracked {
                continue;
            }
            let node = self.pool.take_listener(Arc::clone(&self.latch), era);
            snapshot.core.register_waiter(node);
            if !detection::snapshot_valid(snapshot) {
                // The write we would wait for already happened.
                already_changed = true;
                break;
            }
        }

        self.rollback_footprint();
        self.set.clear();
        self.status = TxnStatus::Aborted;

        if already_changed {
            self.latch.open(era);
        }

        debug!(
            "transaction {} parked on {tracked} references (attempt {})",
            self.id, self.attempt
        );
        let started = Instant::now();
        let opened = self.latch.await_open(era, self.timeout_remaining);
        let waited = started.elapsed();
        if let Some(remaining) = self.timeout_remaining {
            self.timeout_remaining = Some(remaining.saturating_sub(waited));
        }
        if !opened {
            debug!("transaction {} timed out after {waited:?} parked", self.id);
            return Err(SeshatError::RetryTimeout {
                waited: self.config.timeout.unwrap_or(waited),
            });
        }
        debug!("transaction {} woke after {waited:?}", self.id);
        Ok(())
    }

    /// Grows the snapshot storage to fit at least `required` slots, keeping
    /// every snapshot already recorded. The attempt does not restart:
    /// recorded reads, arrives, and held locks carry over, so the re-run
    /// serves them from the set instead of repeating the protocol.
    pub(crate) fn grow_set(&mut self, required: usize) {
        // The whole closure re-runs, so staged values must be recomputed by
        // it; a retained one would feed a read-modify-write its own output.
        for snapshot in self.set.iter_mut() {
            snapshot.staged = None;
        }
        let current = self.set.representation();
        if current == Representation::Dynamic {
            return;
        }
        let mut target = Representation::for_slots(required);
        if target <= current {
            target = match current {
                Representation::Mono => Representation::Fixed,
                Representation::Fixed | Representation::Dynamic => Representation::Dynamic,
            };
        }
        debug!(
            "transaction {} escalates snapshot storage {current:?} -> {target:?}",
            self.id
        );
        self.set.escalate(target, &mut self.pool);
    }
}

impl Drop for Transaction {
    /// A transaction dropped mid-flight must not keep references locked or
    /// counted; release everything it still holds.
    fn drop(&mut self) {
        if matches!(self.status, TxnStatus::Active | TxnStatus::Prepared) {
            self.rollback_footprint();
        }
    }
}
