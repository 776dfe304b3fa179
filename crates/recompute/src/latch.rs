//! Release-once completion signaling.

use std::sync::Arc;

use tokio::sync::watch;

/// One-shot broadcast latch shared by every caller coalesced into a single
/// pending update.
///
/// Cloning shares the underlying signal. `release` is idempotent; waiters
/// that sample the latch after release return immediately instead of
/// blocking on a missed wake-up.
#[derive(Debug, Clone)]
pub struct CompletionLatch {
    released: Arc<watch::Sender<bool>>,
}

impl CompletionLatch {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            released: Arc::new(tx),
        }
    }

    /// Wake all current and future waiters. Releasing twice is a no-op.
    pub fn release(&self) {
        self.released.send_replace(true);
    }

    pub fn is_released(&self) -> bool {
        *self.released.subscribe().borrow()
    }

    /// Wait until the latch is released.
    pub async fn wait(&self) {
        let mut rx = self.released.subscribe();
        while !*rx.borrow_and_update() {
            // The sender can't drop while we hold it through the Arc, but
            // treat a closed channel as released rather than spinning.
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
}

impl Default for CompletionLatch {
    fn default() -> Self {
        Self::new()
    }
}
