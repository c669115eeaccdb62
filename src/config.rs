//! Transaction configuration and the speculative sizing it feeds.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::backoff::{BackoffPolicy, ExponentialBackoff};
use crate::errors::{Result, SeshatError};
use crate::tracking::Representation;
use crate::{IsolationLevel, LockMode};

/// Everything a transaction factory needs to know about the transactions it
/// will hand out.
///
/// A configuration is validated once, when the factory is built; begin is
/// then free of checks. All fields are public and every field also has a
/// `with_*` builder, so both styles work:
///
/// ```
/// use seshat::{IsolationLevel, Seshat, TxnConfig};
///
/// let stm = Seshat::default();
/// let factory = stm
///     .factory(
///         TxnConfig::default()
///             .with_isolation(IsolationLevel::Serializable)
///             .with_max_retries(64),
///     )
///     .expect("valid configuration");
/// # let _ = factory;
/// ```
#[derive(Debug, Clone)]
pub struct TxnConfig {
    /// Rejects every write with a fatal error. Read-only transactions skip
    /// the whole write half of the commit protocol.
    pub readonly: bool,
    /// How reads relate to concurrent commits. See [`IsolationLevel`].
    pub isolation: IsolationLevel,
    /// Lock taken on every reference at read time. [`LockMode::None`] reads
    /// optimistically; stronger modes pay contention up front to avoid
    /// conflicts at commit.
    pub read_lock_mode: LockMode,
    /// Lock taken on every reference at write time, before commit. Must be
    /// at least as strong as `read_lock_mode`.
    pub write_lock_mode: LockMode,
    /// Records a snapshot per read so the transaction can validate, block,
    /// and re-read its own footprint. Required by every isolation level
    /// above [`IsolationLevel::ReadCommitted`] and by blocking retry.
    pub read_tracking: bool,
    /// Allows a transaction to park on its read set instead of spinning
    /// when it decides the current state is not worth committing against.
    pub blocking: bool,
    /// Attempts before the execution loop gives up with an exhaustion
    /// error. Counts the first attempt, so it must be at least one.
    pub max_retries: u32,
    /// Total budget a transaction may spend parked across all of its
    /// blocking rounds. `None` waits forever.
    pub timeout: Option<Duration>,
    /// Pause applied between a conflicted attempt and the next one.
    pub backoff: Arc<dyn BackoffPolicy>,
    /// Starts snapshot storage at the smallest representation the factory
    /// has seen work, escalating on overflow. Disabled, every transaction
    /// starts with unbounded storage.
    pub speculative: bool,
    /// Read-only commits a reference must see in a row before it turns
    /// read-biased. Values above `u16::MAX` never promote, which disables
    /// read biasing altogether.
    pub read_biased_threshold: u32,
    /// Compares staged values against what was read, by `Arc` identity, so
    /// writing back the value you read does not count as a write.
    pub dirty_check: bool,
    /// Recycles wait-list nodes and snapshot storage across attempts.
    pub pooling: bool,
}

impl Default for TxnConfig {
    fn default() -> Self {
        Self {
            readonly: false,
            isolation: IsolationLevel::RepeatableRead,
            read_lock_mode: LockMode::None,
            write_lock_mode: LockMode::None,
            read_tracking: true,
            blocking: true,
            max_retries: 1000,
            timeout: None,
            backoff: Arc::new(ExponentialBackoff::default()),
            speculative: true,
            read_biased_threshold: 16,
            dirty_check: true,
            pooling: true,
        }
    }
}

impl TxnConfig {
    pub fn with_readonly(mut self, readonly: bool) -> Self {
        self.readonly = readonly;
        self
    }

    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn with_read_lock_mode(mut self, mode: LockMode) -> Self {
        self.read_lock_mode = mode;
        self
    }

    pub fn with_write_lock_mode(mut self, mode: LockMode) -> Self {
        self.write_lock_mode = mode;
        self
    }

    pub fn with_read_tracking(mut self, tracking: bool) -> Self {
        self.read_tracking = tracking;
        self
    }

    pub fn with_blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_backoff(mut self, backoff: Arc<dyn BackoffPolicy>) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_speculative(mut self, speculative: bool) -> Self {
        self.speculative = speculative;
        self
    }

    pub fn with_read_biased_threshold(mut self, threshold: u32) -> Self {
        self.read_biased_threshold = threshold;
        self
    }

    pub fn with_dirty_check(mut self, dirty_check: bool) -> Self {
        self.dirty_check = dirty_check;
        self
    }

    pub fn with_pooling(mut self, pooling: bool) -> Self {
        self.pooling = pooling;
        self
    }

    /// Rejects combinations that cannot work before any transaction runs.
    ///
    /// # Errors
    ///
    /// Returns [`SeshatError::Configuration`] naming the first broken rule:
    /// a write lock mode weaker than the read lock mode, blocking or an
    /// isolation level above read-committed without read tracking, a zero
    /// attempt budget, or a zero timeout.
    pub fn validate(&self) -> Result<()> {
        if self.write_lock_mode < self.read_lock_mode {
            return Err(SeshatError::Configuration(format!(
                "write lock mode {:?} is weaker than read lock mode {:?}",
                self.write_lock_mode, self.read_lock_mode
            )));
        }
        if self.blocking && !self.read_tracking {
            return Err(SeshatError::Configuration(
                "blocking retry requires read tracking".to_string(),
            ));
        }
        if self.isolation != IsolationLevel::ReadCommitted && !self.read_tracking {
            return Err(SeshatError::Configuration(format!(
                "{:?} isolation requires read tracking",
                self.isolation
            )));
        }
        if self.max_retries == 0 {
            return Err(SeshatError::Configuration(
                "max_retries must be at least 1".to_string(),
            ));
        }
        if self.timeout == Some(Duration::ZERO) {
            return Err(SeshatError::Configuration(
                "timeout must be non-zero; omit it to wait forever".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether reads record snapshots under this configuration.
    pub(crate) fn tracks_reads(&self) -> bool {
        self.read_tracking && self.isolation != IsolationLevel::ReadCommitted
    }
}

/// The slot count a factory has learned its transactions need.
///
/// Starts at one slot and only ever grows: every speculative overflow
/// reports the size that would have sufficed, and later transactions begin
/// at the representation that covers the high-water mark instead of
/// rediscovering it.
#[derive(Debug)]
pub(crate) struct SpeculativeSizing {
    required: AtomicUsize,
}

impl SpeculativeSizing {
    pub(crate) fn new() -> Self {
        Self {
            required: AtomicUsize::new(1),
        }
    }

    pub(crate) fn observed(&self) -> usize {
        self.required.load(Ordering::SeqCst)
    }

    pub(crate) fn report_required(&self, slots: usize) {
        self.required.fetch_max(slots, Ordering::SeqCst);
    }

    /// Representation a fresh transaction should start with.
    pub(crate) fn initial_representation(&self, speculative: bool) -> Representation {
        if speculative {
            Representation::for_slots(self.observed())
        } else {
            Representation::Dynamic
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(TxnConfig::default().validate().is_ok());
    }

    #[test]
    fn weak_write_lock_is_rejected() {
        let config = TxnConfig::default()
            .with_read_lock_mode(LockMode::Write)
            .with_write_lock_mode(LockMode::Read);
        assert!(matches!(
            config.validate(),
            Err(SeshatError::Configuration(_))
        ));
    }

    #[test]
    fn blocking_without_tracking_is_rejected() {
        let config = TxnConfig::default()
            .with_isolation(IsolationLevel::ReadCommitted)
            .with_read_tracking(false)
            .with_blocking(true);
        assert!(matches!(
            config.validate(),
            Err(SeshatError::Configuration(_))
        ));
    }

    #[test]
    fn tracking_isolation_without_tracking_is_rejected() {
        let config = TxnConfig::default()
            .with_read_tracking(false)
            .with_blocking(false);
        assert!(matches!(
            config.validate(),
            Err(SeshatError::Configuration(_))
        ));
    }

    #[test]
    fn zero_attempts_are_rejected() {
        let config = TxnConfig::default().with_max_retries(0);
        assert!(matches!(
            config.validate(),
            Err(SeshatError::Configuration(_))
        ));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let config = TxnConfig::default().with_timeout(Duration::ZERO);
        assert!(matches!(
            config.validate(),
            Err(SeshatError::Configuration(_))
        ));
    }

    #[test]
    fn sizing_only_grows() {
        let sizing = SpeculativeSizing::new();
        assert_eq!(sizing.observed(), 1);
        sizing.report_required(9);
        sizing.report_required(4);
        assert_eq!(sizing.observed(), 9);
    }

    #[test]
    fn sizing_picks_the_representation_ladder() {
        let sizing = SpeculativeSizing::new();
        assert_eq!(
            sizing.initial_representation(true),
            Representation::Mono
        );
        sizing.report_required(2);
        assert_eq!(
            sizing.initial_representation(true),
            Representation::Fixed
        );
        sizing.report_required(crate::tracking::FIXED_CAPACITY + 1);
        assert_eq!(
            sizing.initial_representation(true),
            Representation::Dynamic
        );
        assert_eq!(
            sizing.initial_representation(false),
            Representation::Dynamic
        );
    }
}
