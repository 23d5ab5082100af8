//! Cancellation signals for queued work and background tasks.
//!
//! A dropped future already releases everything it holds, but a dropped request cannot be
//! answered. [`CancelSignal`] lets a caller say "I gave up" while the request is still
//! answerable, so the throttle can reply with a distinct cancellation error. The same signal
//! stops the local backend's sweeper.
//!
//! To cancel an HTTP request, insert the signal into the request extensions before it reaches
//! [`ThrottleLayer`](crate::throttle::ThrottleLayer).

use std::sync::Arc;
use tokio::sync::watch;

/// Fires a [`CancelSignal`]. Clones fire the same signal.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    /// Cancel every signal created from this handle's pair.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Whether [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Observes a [`CancelHandle`]. Cheap to clone.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

/// Create a connected handle/signal pair.
pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx: Arc::new(tx) }, CancelSignal { rx })
}

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_, signal) = cancel_pair();
        signal
    }

    /// Whether the signal has fired.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancelled. If every handle is dropped without cancelling, never resolves.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
