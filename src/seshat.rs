//! The engine: reference creation, transaction factories, and execution.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::cell::tref::TRef;
use crate::config::{SpeculativeSizing, TxnConfig};
use crate::conflict::counter::GlobalConflictCounter;
use crate::errors::{Result, TxnResult};
use crate::executor;
use crate::transaction::Transaction;

/// Seshat prelude.
pub mod prelude {
    pub use crate::backoff::*;
    pub use crate::cell::tref::*;
    pub use crate::config::*;
    pub use crate::errors::*;
    pub use crate::transaction::*;
    pub use crate::*;
}

/// State shared by every transaction and reference of one engine.
#[derive(Debug)]
pub(crate) struct EngineShared {
    /// Advances on commits that may have invalidated concurrent readers.
    pub(crate) conflict_counter: GlobalConflictCounter,
    /// Globally increasing counter for generating unique reference ids.
    ref_counter: AtomicU64,
    /// Globally increasing counter for generating unique transaction ids.
    txn_counter: AtomicU64,
}

impl EngineShared {
    fn new() -> Self {
        Self {
            conflict_counter: GlobalConflictCounter::new(),
            // Id 0 is reserved to mean "no owner" on lock ownership words.
            ref_counter: AtomicU64::new(1),
            txn_counter: AtomicU64::new(1),
        }
    }

    pub(crate) fn next_txn_id(&self) -> u64 {
        self.txn_counter.fetch_add(1, Ordering::SeqCst)
    }

    fn next_ref_id(&self) -> u64 {
        self.ref_counter.fetch_add(1, Ordering::SeqCst)
    }
}

/// The main entry point for the Seshat software transactional memory engine.
///
/// An engine owns a set of transactional references created through
/// [`new_ref`](Self::new_ref) and hands out transactions over them, either
/// under the engine-wide default configuration or through per-workload
/// [factories](Self::factory). All conflict detection state is engine-wide:
/// a reference must only ever be touched by transactions of the engine that
/// created it.
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
///     balance.write(tx, current - 30)?;
///     Ok(())
/// })
/// .unwrap();
///
/// assert_eq!(*balance.atomic_get(), 70);
/// ```
#[derive(Debug)]
pub struct Seshat {
    /// Conflict counter and id allocators shared with every transaction.
    shared: Arc<EngineShared>,
    /// Factory applying the engine-wide default configuration.
    default_factory: Arc<TxnFactory>,
}

impl Seshat {
    /// Creates an engine whose default transactions run under `config`.
    ///
    /// # Errors
    ///
    /// [`SeshatError::Configuration`](crate::errors::SeshatError::Configuration)
    /// when the configuration is contradictory; see [`TxnConfig::validate`].
    pub fn new(config: TxnConfig) -> Result<Self> {
        config.validate()?;
        let shared = Arc::new(EngineShared::new());
        let default_factory = Arc::new(TxnFactory::with_shared(Arc::clone(&shared), config));
        Ok(Self {
            shared,
            default_factory,
        })
    }

    /// Creates a transactional reference holding `value`.
    ///
    /// The reference belongs to this engine. Values are handed out as
    /// [`Arc`]s, so `T` only needs [`Clone`] when callers clone it
    /// themselves.
    pub fn new_ref<T: Send + Sync + 'static>(&self, value: T) -> TRef<T> {
        TRef::new(self.shared.next_ref_id(), value)
    }

    /// Creates a factory whose transactions run under `config` while
    /// sharing this engine's references and conflict state.
    ///
    /// # Errors
    ///
    /// [`SeshatError::Configuration`](crate::errors::SeshatError::Configuration)
    /// when the configuration is contradictory.
    pub fn factory(&self, config: TxnConfig) -> Result<Arc<TxnFactory>> {
        config.validate()?;
        Ok(Arc::new(TxnFactory::with_shared(
            Arc::clone(&self.shared),
            config,
        )))
    }

    /// Starts a transaction under the engine-wide default configuration.
    pub fn begin_transaction(&self) -> Transaction {
        self.default_factory.begin()
    }

    /// Runs `body` in a transaction under the default configuration,
    /// committing when it returns `Ok`. See [`TxnFactory::execute`].
    ///
    /// # Errors
    ///
    /// As [`TxnFactory::execute`].
    pub fn execute<R, F>(&self, body: F) -> Result<R>
    where
        F: FnMut(&mut Transaction) -> TxnResult<R>,
    {
        self.default_factory.execute(body)
    }

    /// Returns the engine-wide default configuration.
    pub fn config(&self) -> &TxnConfig {
        &self.default_factory.config
    }
}

impl Default for Seshat {
    /// An engine under [`TxnConfig::default`], which always validates.
    fn default() -> Self {
        let shared = Arc::new(EngineShared::new());
        let default_factory = Arc::new(TxnFactory::with_shared(
            Arc::clone(&shared),
            TxnConfig::default(),
        ));
        Self {
            shared,
            default_factory,
        }
    }
}

/// Hands out transactions that share one configuration and one learned
/// speculative snapshot-storage size.
///
/// Factories are cheap to clone behind the [`Arc`] returned by
/// [`Seshat::factory`] and are the unit of speculation: once one
/// transaction of a factory outgrows its snapshot storage, every later
/// transaction of that factory starts at the larger size.
#[derive(Debug)]
pub struct TxnFactory {
    pub(crate) shared: Arc<EngineShared>,
    pub(crate) config: TxnConfig,
    /// Largest snapshot-storage size any transaction of this factory
    /// needed so far.
    pub(crate) sizing: SpeculativeSizing,
}

impl TxnFactory {
    fn with_shared(shared: Arc<EngineShared>, config: TxnConfig) -> Self {
        Self {
            shared,
            config,
            sizing: SpeculativeSizing::new(),
        }
    }

    /// Starts a transaction under this factory's configuration.
    pub fn begin(&self) -> Transaction {
        let initial = self.sizing.initial_representation(self.config.speculative);
        Transaction::new(Arc::clone(&self.shared), self.config.clone(), initial)
    }

    /// Runs `body` in a transaction, committing when it returns `Ok`.
    ///
    /// The closure may run several times: conflicts restart it on a fresh
    /// attempt after the configured backoff, [`retry`](crate::retry) parks
    /// it until a read reference changes, and a snapshot-storage overflow
    /// re-runs it within the same attempt after growing the storage. It
    /// must not call [`Transaction::commit`] or [`Transaction::abort`]
    /// itself, and side effects outside the transaction should be
    /// idempotent across runs.
    ///
    /// # Errors
    ///
    /// * [`SeshatError::AttemptsExhausted`] when `max_retries` attempts
    ///   all failed.
    /// * [`SeshatError::RetryNotPossible`] and
    ///   [`SeshatError::RetryTimeout`] from [`retry`](crate::retry), per
    ///   [`Transaction::retry`].
    /// * Any [`SeshatError`] the closure itself returns, unchanged.
    ///
    /// [`SeshatError`]: crate::errors::SeshatError
    /// [`SeshatError::AttemptsExhausted`]: crate::errors::SeshatError::AttemptsExhausted
    /// [`SeshatError::RetryNotPossible`]: crate::errors::SeshatError::RetryNotPossible
    /// [`SeshatError::RetryTimeout`]: crate::errors::SeshatError::RetryTimeout
    pub fn execute<R, F>(&self, body: F) -> Result<R>
    where
        F: FnMut(&mut Transaction) -> TxnResult<R>,
    {
        executor::run_loop(self, body)
    }

    /// Returns the configuration this factory applies.
    pub fn config(&self) -> &TxnConfig {
        &self.config
    }
}
