//! Process-wide signals shared by every loop.
//!
//! Each loop gets a clone of [`Events`] at construction time. All waits are
//! bounded: a loop asks "wait up to `T` or until raised" and always gets
//! control back, so a shutdown is observed within one wait interval.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// A clonable level-triggered flag with async waiters.
#[derive(Debug, Clone)]
pub struct Signal {
    tx: Arc<watch::Sender<bool>>,
}

impl Signal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn raise(&self) {
        self.tx.send_if_modified(|raised| {
            if *raised {
                false
            } else {
                *raised = true;
                true
            }
        });
    }

    pub fn clear(&self) {
        self.tx.send_if_modified(|raised| std::mem::replace(raised, false));
    }

    /// Clear the flag and report whether it was set.
    pub fn take(&self) -> bool {
        let mut was_raised = false;
        self.tx.send_if_modified(|raised| {
            was_raised = std::mem::replace(raised, false);
            false
        });
        was_raised
    }

    pub fn is_raised(&self) -> bool {
        *self.tx.borrow()
    }

    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so this cannot observe a closed channel.
        let _ = rx.wait_for(|raised| *raised).await;
    }

    /// Returns `true` if the signal was raised within `timeout`.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait()).await.is_ok()
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

/// Broadcast, idempotent and irreversible stop request.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    signal: Signal,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.signal.raise();
    }

    pub fn is_triggered(&self) -> bool {
        self.signal.is_raised()
    }

    pub async fn wait(&self) {
        self.signal.wait().await;
    }

    /// Interruptible sleep. Returns `true` if shutdown was requested
    /// before `timeout` elapsed.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        self.signal.wait_timeout(timeout).await
    }
}

/// The signals every task observes.
#[derive(Debug, Clone, Default)]
pub struct Events {
    pub shutdown: Shutdown,
    /// Raised by the simulation after each published step.
    pub state_updated: Signal,
    /// Raised when the simulated power runs away and the reactor is reset.
    pub explosion: Signal,
}

impl Events {
    pub fn new() -> Self {
        Self::default()
    }
}
