//! The execution loop behind [`Seshat::execute`](crate::seshat::Seshat::execute).
//!
//! Runs a closure against a transaction and reacts to the signals it
//! raises: conflicts become soft resets with backoff, a retry request
//! parks the transaction on its read set, and a snapshot-storage overflow
//! grows the storage and re-runs the closure within the same attempt.

use std::thread;

use log::{debug, trace};

use crate::backoff::BackoffPolicy;
use crate::errors::{Result, SeshatError, Signal, TxnError, TxnResult};
use crate::seshat::TxnFactory;
use crate::transaction::Transaction;

pub(crate) fn run_loop<R, F>(factory: &TxnFactory, mut body: F) -> Result<R>
where
    F: FnMut(&mut Transaction) -> TxnResult<R>,
{
    let mut tx = factory.begin();
    loop {
        let outcome = body(&mut tx).and_then(|value| tx.commit().map(|()| value));
        match outcome {
            Ok(value) => return Ok(value),
            Err(TxnError::Signal(Signal::SpeculativeOverflow { required })) => {
                // Not a conflict: grow the storage and re-run the closure
                // within the same attempt. The recorded snapshots survive,
                // so the re-run replays its reads from them.
                factory.sizing.report_required(required);
                tx.grow_set(required);
                trace!(
                    "transaction {} re-runs after growing snapshot storage to {required} slots",
                    tx.id()
                );
            }
            Err(TxnError::Signal(Signal::Retry)) => {
                tx.retry()?;
                // Woken by a commit to the read set; no backoff on top of
                // the wait itself.
                next_attempt(&mut tx, Signal::Retry)?;
            }
            Err(TxnError::Signal(signal)) => {
                let failed = tx.attempt();
                next_attempt(&mut tx, signal)?;
                pause(factory.config.backoff.as_ref(), failed);
            }
            Err(TxnError::Fatal(error)) => {
                let _ = tx.abort();
                return Err(error);
            }
        }
    }
}

/// Resets the transaction for another attempt, or surfaces the exhaustion
/// with the signal that ended the final attempt.
fn next_attempt(tx: &mut Transaction, last: Signal) -> Result<()> {
    if tx.soft_reset() {
        return Ok(());
    }
    let attempts = tx.attempt();
    let _ = tx.abort();
    debug!("transaction {} gave up after {attempts} attempts: {last}", tx.id());
    Err(SeshatError::AttemptsExhausted { attempts, last })
}

fn pause(policy: &dyn BackoffPolicy, failed_attempt: u32) {
    let delay = policy.delay(failed_attempt);
    if delay.is_zero() {
        thread::yield_now();
    } else {
        thread::sleep(delay);
    }
}
