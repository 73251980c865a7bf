//! Fixed-interval convergence polling.
//!
//! Long-running remote operations (log collection, compaction) only expose
//! their progress through status queries. [`poll`] re-runs a predicate at a
//! fixed cadence until it reports convergence, the deadline passes, or the
//! predicate itself fails.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use tokio::time::{interval_at, Instant};

use crate::config::POLL_INTERVAL;

/// How a [`poll`] ended, when the predicate itself didn't fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The predicate reported convergence within the deadline.
    Converged,
    /// The deadline passed without convergence. Not an error: callers decide
    /// whether an unconverged operation should fail the run.
    TimedOut,
}

/// Repeatedly evaluate `predicate` every [`POLL_INTERVAL`] until it returns
/// `true`, `timeout` elapses, or it returns an error.
///
/// The first check happens one interval in, not immediately; remote
/// operations are asynchronous and their status entries may not exist yet at
/// trigger time.
pub async fn poll<P, F>(mut predicate: P, timeout: Duration) -> Result<PollOutcome>
where
    P: FnMut() -> F,
    F: Future<Output = Result<bool>>,
{
    let start = Instant::now();
    let mut ticker = interval_at(start + POLL_INTERVAL, POLL_INTERVAL);

    let wait = async {
        loop {
            ticker.tick().await;

            if predicate().await? {
                return Ok(PollOutcome::Converged);
            }
        }
    };

    match tokio::time::timeout_at(start + timeout, wait).await {
        Ok(result) => result,
        Err(_) => Ok(PollOutcome::TimedOut),
    }
}
