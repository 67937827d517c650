//! Shutdown signaling
//!
//! A single [`Shutdown`] is created by the pipeline and cloned into every
//! background task. `signal` is sticky: receivers that subscribe or poll
//! after the fact still observe shutdown, so no task can sleep through the
//! notification.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

/// Shutdown notification, cloneable across tasks.
#[derive(Debug)]
pub struct Shutdown {
    sender: Arc<broadcast::Sender<()>>,
    receiver: broadcast::Receiver<()>,
    signaled: Arc<AtomicBool>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    /// Create a new `Shutdown` in the not-signaled state.
    #[must_use]
    pub fn new() -> Self {
        let (sender, receiver) = broadcast::channel(1);
        Self {
            sender: Arc::new(sender),
            receiver,
            signaled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Notify every receiver, current and future. Idempotent.
    pub fn signal(&self) {
        self.signaled.store(true, Ordering::SeqCst);
        // Send fails only when no receiver exists, which is fine: the
        // sticky flag covers late subscribers.
        drop(self.sender.send(()));
    }

    /// True once [`Shutdown::signal`] has been called.
    #[must_use]
    pub fn is_signaled(&self) -> bool {
        self.signaled.load(Ordering::SeqCst)
    }

    /// Wait for the shutdown notification. Returns immediately if it has
    /// already fired. Cancel-safe, suitable for `tokio::select!`.
    pub async fn recv(&mut self) {
        if self.signaled.load(Ordering::SeqCst) {
            return;
        }
        // A lagged or closed channel still means the signal fired.
        drop(self.receiver.recv().await);
    }
}

impl Clone for Shutdown {
    fn clone(&self) -> Self {
        Self {
            sender: Arc::clone(&self.sender),
            receiver: self.sender.subscribe(),
            signaled: Arc::clone(&self.signaled),
        }
    }
}
