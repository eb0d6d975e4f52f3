//! Run-wide cooperative cancellation.
//!
//! One token is created per experiment run and cloned into every task at
//! launch. Cancellation is level-triggered: the flag is set at most once and
//! is never reset, so a task that observes it late still sees it.

use std::sync::Arc;

use tokio::sync::watch;

/// Set-once cancellation flag with an awaitable edge.
///
/// Clones share the same underlying flag. Waits built on this wake promptly
/// when [`CancelToken::cancel`] is called, regardless of how much schedule
/// remains.
#[derive(Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Request cancellation. Idempotent; later calls are no-ops.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation has been requested.
    ///
    /// Resolves immediately if the token is already cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // Every clone holds the sender, so the channel cannot close while
        // a waiter exists; treat a closed channel as "never cancelled".
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
