//! Cooperative cancellation for long-running build stages.

use tokio::sync::watch;

/// Cloneable handle that flips once from "running" to "cancelled".
///
/// Every clone observes the same state. Cancelling is idempotent.
#[derive(Debug, Clone)]
pub struct CancelToken {
  tx: std::sync::Arc<watch::Sender<bool>>,
  rx: watch::Receiver<bool>,
}

impl Default for CancelToken {
  fn default() -> Self {
    Self::new()
  }
}

impl CancelToken {
  pub fn new() -> Self {
    let (tx, rx) = watch::channel(false);
    Self {
      tx: std::sync::Arc::new(tx),
      rx,
    }
  }

  pub fn cancel(&self) {
    self.tx.send_replace(true);
  }

  pub fn is_cancelled(&self) -> bool {
    *self.rx.borrow()
  }

  /// Resolve once [`cancel`](Self::cancel) has been called on any clone.
  pub async fn cancelled(&self) {
    let mut rx = self.rx.clone();
    // The sender lives as long as any token, so this only errors if every
    // token is gone, in which case nobody can cancel anymore.
    if rx.wait_for(|cancelled| *cancelled).await.is_err() {
      std::future::pending::<()>().await;
    }
  }
}
