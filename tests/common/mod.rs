//! Common utilities for Seshat integration tests.

use std::sync::Arc;

use seshat::{IsolationLevel, NoBackoff, Seshat, TxnConfig, TxnFactory};

// --- Helper Functions ---

/// Helper function to create an engine whose default transactions run at
/// the given isolation level.
pub fn setup_engine(isolation: IsolationLevel) -> Arc<Seshat> {
    Arc::new(Seshat::new(TxnConfig::default().with_isolation(isolation)).expect("valid config"))
}

/// Helper function to create a factory that fails fast: no backoff between
/// attempts and a small attempt budget.
pub fn fail_fast_factory(stm: &Seshat, max_retries: u32) -> Arc<TxnFactory> {
    stm.factory(
        TxnConfig::default()
            .with_backoff(Arc::new(NoBackoff))
            .with_max_retries(max_retries),
    )
    .expect("valid config")
}
