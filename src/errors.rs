use std::time::Duration;

use thiserror::Error;

use crate::transaction::TxnStatus;

/// Control-flow signals raised by transactional operations.
///
/// Signals are not failures of the engine: they tell the execution loop that
/// the current attempt cannot proceed and how to react (back off and rerun,
/// grow the snapshot set, or block on the read set). They are plain `Copy`
/// values so raising one allocates nothing, and they are kept as a separate
/// type so generic error handling cannot swallow them by accident. A signal
/// that escapes [`execute`](crate::seshat::Seshat::execute) is a bug in the
/// surrounding loop, not in user code.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// A lock could not be acquired: at access time under a pessimistic
    /// lock mode, or on a dirty reference during the commit lock phase.
    #[error("write conflict: reference locked by another transaction")]
    WriteConflict,

    /// A tracked read no longer matches the committed version, or a read
    /// ran into a reference write-locked by another transaction.
    #[error("read-write conflict: snapshot failed validation")]
    ReadWriteConflict,

    /// The transaction asked to block until one of its reads changes.
    #[error("retry requested: transaction is waiting on its read set")]
    Retry,

    /// The speculative snapshot-set representation ran out of slots.
    #[error("speculative capacity exceeded: needs at least {required} slots")]
    SpeculativeOverflow { required: usize },
}

impl Signal {
    /// True for the two conflict variants that warrant backoff before the
    /// next attempt.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Signal::WriteConflict | Signal::ReadWriteConflict)
    }
}

/// Errors that propagate out of the engine.
///
/// These are the non-signal categories: misuse of a finished transaction,
/// exhausted retry budgets, and invalid configuration. None of them are
/// retried by the execution loop.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SeshatError {
    /// An operation was invoked on a transaction whose state forbids it,
    /// e.g. reading from a committed transaction.
    #[error("cannot {op} a {status:?} transaction")]
    IllegalState { op: &'static str, status: TxnStatus },

    /// A write was attempted through a read-only transaction.
    #[error("write attempted on a read-only transaction")]
    ReadonlyWrite,

    /// `retry` was called with nothing to wait on: blocking is disabled for
    /// this transaction or its tracked read set is empty.
    #[error("retry is not possible: no tracked reads to wait on")]
    RetryNotPossible,

    /// The attempt budget ran out. Carries the signal that failed the final
    /// attempt.
    #[error("transaction exhausted {attempts} attempts")]
    AttemptsExhausted {
        attempts: u32,
        #[source]
        last: Signal,
    },

    /// A blocking retry did not observe a change within the configured
    /// timeout budget.
    #[error("blocking retry timed out after {waited:?}")]
    RetryTimeout { waited: Duration },

    /// The transaction configuration is inconsistent. Raised when the
    /// factory is built, never at run time.
    #[error("invalid transaction configuration: {0}")]
    Configuration(String),
}

/// Result alias for fallible engine operations.
pub type Result<T> = std::result::Result<T, SeshatError>;

/// What a transactional operation can come back with: either a control-flow
/// [`Signal`] for the execution loop or a propagating [`SeshatError`].
///
/// Both arms are transparent, so `?` inside a transaction closure forwards
/// whichever occurred without wrapping noise.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TxnError {
    #[error(transparent)]
    Signal(#[from] Signal),

    #[error(transparent)]
    Fatal(#[from] SeshatError),
}

impl TxnError {
    /// The signal carried by this error, if it is one.
    pub fn signal(&self) -> Option<Signal> {
        match self {
            TxnError::Signal(s) => Some(*s),
            TxnError::Fatal(_) => None,
        }
    }
}

/// Result alias for operations running inside a transaction.
pub type TxnResult<T> = std::result::Result<T, TxnError>;
