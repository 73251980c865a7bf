//! Cooperative shutdown.
//!
//! Benchmarks run for hours; an interrupted run should still report the
//! iterations it completed. The first Ctrl-C latches a flag which the
//! iteration loops check between iterations; a second Ctrl-C aborts the
//! process the usual way because the listener is no longer installed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;

/// A latch set once the user has requested shutdown.
#[derive(Clone, Default)]
pub struct ShutdownSignal(Arc<AtomicBool>);

impl ShutdownSignal {
    /// Create a signal and install a Ctrl-C listener which sets it.
    pub fn listening() -> Self {
        let signal = ShutdownSignal::default();

        let flag = Arc::clone(&signal.0);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown requested, finishing the current iteration");
                flag.store(true, Ordering::SeqCst);
            }
        });

        signal
    }

    /// Mark the signal as set without a Ctrl-C.
    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
