//! Query-scoped cancellation.
//!
//! A [`CancellationFlag`] is created per query and cloned into every
//! in-flight invocation and cache subscription spawned on the query's
//! behalf. Dropping result streams also cancels their producers, but
//! the flag lets a caller abort explicitly.

use tokio::sync::watch;

/// A cloneable cancellation signal.
#[derive(Debug, Clone)]
pub struct CancellationFlag {
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
}

impl CancellationFlag {
    /// Creates an unsignalled flag.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx, rx }
    }

    /// Signals cancellation to every clone of this flag.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    /// Returns true once cancellation has been signalled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when cancellation is signalled.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for CancellationFlag {
    fn default() -> Self {
        Self::new()
    }
}
