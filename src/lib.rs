//! Seshat is an in-process software transactional memory engine: shared
//! state lives in versioned transactional references ([`TRef`]) owned by an
//! engine ([`Seshat`]), and closures run against them atomically through
//! optimistic transactions.
//!
//! Reads record snapshots that are revalidated as the footprint grows and
//! again at commit; writes stay private to the transaction until commit
//! installs them all at once. Conflicts restart the closure with backoff,
//! and [`retry`] parks a transaction until another one commits to its read
//! set. Isolation, locking, blocking, and restart policy are per-engine or
//! per-factory configuration ([`TxnConfig`]).
//!
//! ```
//! use seshat::Seshat;
//!
//! let stm = Seshat::default();
//! let checking = stm.new_ref(90_i64);
//! let savings = stm.new_ref(10_i64);
//!
//! stm.execute(|tx| {
//!     let amount = 25;
//!     let from = *checking.read(tx)?;
//!     let to = *savings.read(tx)?;
//!     checking.write(tx, from - amount)?;
//!     savings.write(tx, to + amount)?;
//!     Ok(())
//! })
//! .unwrap();
//!
//! assert_eq!(*checking.atomic_get(), 65);
//! assert_eq!(*savings.atomic_get(), 35);
//! ```

pub mod errors;
pub mod cell;
mod tracking;
mod conflict;
pub mod transaction;
pub mod seshat;
pub mod config;
pub mod backoff;
mod retry;
mod pool;
mod executor;

// Re-export key types and structs for easier access
pub use backoff::{BackoffPolicy, ExponentialBackoff, NoBackoff};
pub use cell::tref::TRef;
pub use config::TxnConfig;
pub use errors::{Result, SeshatError, Signal, TxnError, TxnResult};
pub use seshat::{Seshat, TxnFactory};
pub use transaction::{Transaction, TxnStatus};

/// Isolation levels for transactions, set through
/// [`TxnConfig::with_isolation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    /// [`IsolationLevel::ReadCommitted`] means every read loads the latest
    /// committed value at the moment of the read and records nothing. If
    /// the same reference is read more than once within the same
    /// transaction it may have a different value every time, since other
    /// transactions commit concurrently. Writes are still checked for
    /// conflicts at commit. Blocking [`retry`] is unavailable at this
    /// level because there is no recorded read set to wait on.
    ReadCommitted,
    /// [`IsolationLevel::RepeatableRead`] means that once a reference was
    /// read within a transaction, all consecutive reads return the same
    /// in-transaction value: the first read records a snapshot and later
    /// accesses are served from it. Commit validates that no recorded
    /// snapshot went stale, so a committed transaction saw a consistent
    /// picture of everything it read and wrote.
    RepeatableRead,
    /// [`IsolationLevel::Serializable`] means committed transactions are
    /// equivalent to some serial order. Reads behave the same way as with
    /// [`IsolationLevel::RepeatableRead`]; in addition, commit holds read
    /// locks on the references the transaction only read while it
    /// validates and installs, so no concurrent writer can slip between
    /// its validation and its writes.
    Serializable,
}

/// How eagerly a transaction locks the references it touches, set through
/// [`TxnConfig::with_read_lock_mode`] and [`TxnConfig::with_write_lock_mode`].
///
/// The ordering is by strength: [`LockMode::None`] < [`LockMode::Read`] <
/// [`LockMode::Write`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockMode {
    /// No lock at access time. Reads announce themselves on the
    /// reference's ownership record and rely on validation; writes stay
    /// private until the commit takes its locks.
    None,
    /// A shared lock taken at access time and held to the end of the
    /// transaction. Other transactions can still read the reference but
    /// none can commit a write to it.
    Read,
    /// An exclusive lock taken at access time and held to the end of the
    /// transaction. Turns the access pessimistic: concurrent accesses to
    /// the reference fail fast instead of failing validation later.
    Write,
}

/// Requests a blocking retry from inside a transactional closure.
///
/// Returned through the closure, this makes the execution loop park the
/// transaction until another transaction commits a write to a reference
/// the closure has read, then run the closure again on a fresh attempt.
///
/// # Examples
///
/// ```
/// use seshat::{guard, Seshat};
/// use std::sync::Arc;
/// use std::thread;
/// use std::time::Duration;
///
/// let stm = Arc::new(Seshat::default());
/// let ready = stm.new_ref(false);
///
/// let signaller = {
///     let stm = Arc::clone(&stm);
///     let ready = ready.clone();
///     thread::spawn(move || {
///         thread::sleep(Duration::from_millis(20));
///         stm.execute(|tx| ready.write(tx, true)).unwrap();
///     })
/// };
///
/// stm.execute(|tx| {
///     let is_ready = *ready.read(tx)?;
///     guard(is_ready)
/// })
/// .unwrap();
/// signaller.join().unwrap();
/// ```
pub fn retry<T>() -> TxnResult<T> {
    Err(Signal::Retry.into())
}

/// Retries the transaction unless `cond` holds.
///
/// # Examples
///
/// ```
/// assert!(seshat::guard(true).is_ok());
/// assert!(seshat::guard(false).is_err());
/// ```
pub fn guard(cond: bool) -> TxnResult<()> {
    if cond { Ok(()) } else { retry() }
}
