//! Cooperative shutdown for background tasks
//!
//! Every background loop (mem refresher, evictor, refresher, TinyLFU batcher,
//! rate-limiter refill) holds a clone of [`Shutdown`] and selects on
//! [`Shutdown::cancelled`] next to its ticker, so a single `trigger` stops
//! the whole engine, including tasks blocked on channels or token waits.

use std::sync::Arc;

use tokio::sync::watch;

/// Cloneable cancellation handle
#[derive(Clone, Debug)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    /// Signal all observers. Idempotent.
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    /// Non-blocking check, for loops that only test between batches.
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the shutdown has been triggered.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        // A closed channel means the engine is being torn down; treat it the
        // same as an explicit trigger.
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
