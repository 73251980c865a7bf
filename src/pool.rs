//! Bounded worker pool with fail-fast semantics.
//!
//! Fan-out across remote machines goes through a [`WorkerPool`]: at most
//! `max_parallel` units of work run at once, the first failure is latched,
//! and later submissions are rejected so a run stops dispatching new remote
//! work as soon as something has gone wrong. Work already in flight is left
//! to finish; remote commands are not forcibly torn down halfway through.

use std::future::Future;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;

/// A pool executing up to a fixed number of fallible futures concurrently.
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    handles: Vec<JoinHandle<()>>,
    fault: Arc<Mutex<Option<anyhow::Error>>>,
}

impl WorkerPool {
    /// Create a pool which runs at most `max_parallel` units of work
    /// concurrently.
    pub fn new(max_parallel: usize) -> Self {
        WorkerPool {
            permits: Arc::new(Semaphore::new(max_parallel.max(1))),
            handles: Vec::new(),
            fault: Arc::new(Mutex::new(None)),
        }
    }

    /// Create a pool sized for `units` independent units of work: one worker
    /// per unit, capped at the number of logical CPUs.
    pub fn bounded(units: usize) -> Self {
        let cpus = std::thread::available_parallelism().map_or(1, |n| n.get());

        WorkerPool::new(units.min(cpus))
    }

    /// Submit a unit of work to the pool, blocking until a worker is free to
    /// pick it up.
    ///
    /// Returns an error without running the work if a previously submitted
    /// unit has already failed.
    pub async fn queue<F>(&mut self, work: F) -> Result<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        if self.fault.lock().await.is_some() {
            return Err(anyhow!("pool has already observed a failure"));
        }

        // Acquire before spawning so submission itself provides backpressure.
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| anyhow!("pool semaphore closed"))?;

        // A fault may have been latched while this submission was blocked on
        // the permit; a saturated pool must still stop dispatching.
        if self.fault.lock().await.is_some() {
            return Err(anyhow!("pool has already observed a failure"));
        }

        let fault = Arc::clone(&self.fault);

        self.handles.push(tokio::spawn(async move {
            if let Err(err) = work.await {
                let mut fault = fault.lock().await;
                // Only the first failure is reported.
                if fault.is_none() {
                    *fault = Some(err);
                }
            }

            // Released after the fault is latched, so a submission which
            // acquires this permit will observe the failure.
            drop(permit);
        }));

        Ok(())
    }

    /// Wait for all submitted work to finish, returning the first failure
    /// observed by the pool (if any).
    pub async fn stop(self) -> Result<()> {
        for joined in futures::future::join_all(self.handles).await {
            // Workers never panic in normal operation; surface it if one does.
            joined.map_err(|err| anyhow!("worker task failed: {err}"))?;
        }

        match self.fault.lock().await.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
