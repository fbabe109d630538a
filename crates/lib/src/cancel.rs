//! Cancellation signal passed into every blocking backend operation.
//!
//! Cancelling stops waiting on the in-flight call. Cleanup (session destroy,
//! snapshot delete, lease release) is not routed through this signal and
//! always runs. Calls that acquire one of those resources are not raced
//! either: their callers check [`Cancellation::is_cancelled`] around them.

use std::future::Future;

use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Receiving side, cloned into each operation.
#[derive(Debug, Clone)]
pub struct Cancellation {
  rx: watch::Receiver<bool>,
}

/// Sending side, held by whoever decides to cancel (e.g. a Ctrl-C handler).
#[derive(Debug)]
pub struct CancelHandle {
  tx: watch::Sender<bool>,
}

/// Create a connected handle/signal pair.
pub fn channel() -> (CancelHandle, Cancellation) {
  let (tx, rx) = watch::channel(false);
  (CancelHandle { tx }, Cancellation { rx })
}

impl CancelHandle {
  pub fn cancel(&self) {
    self.tx.send_replace(true);
  }
}

impl Cancellation {
  /// A signal that never fires.
  pub fn never() -> Self {
    channel().1
  }

  pub fn is_cancelled(&self) -> bool {
    *self.rx.borrow()
  }

  /// Resolves once cancellation is requested.
  pub async fn cancelled(&self) {
    let mut rx = self.rx.clone();
    loop {
      if *rx.borrow_and_update() {
        return;
      }
      if rx.changed().await.is_err() {
        // Sender gone without cancelling: never fires.
        std::future::pending::<()>().await;
      }
    }
  }

  /// Drive `fut` to completion unless cancellation wins first.
  ///
  /// On cancellation `fut` is dropped.
  pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, Cancelled> {
    if self.is_cancelled() {
      return Err(Cancelled);
    }
    tokio::select! {
      output = fut => Ok(output),
      _ = self.cancelled() => Err(Cancelled),
    }
  }
}
