//! Scoped leases and snapshots.
//!
//! Each helper acquires its resource, hands it to a body, and releases it on
//! every path out of the body. Releases are best-effort: a failure is logged
//! and never changes the body's outcome.
//!
//! Acquisition itself is never interrupted by the cancellation signal: a
//! backend call dropped halfway can leave a resource nobody knows to release.
//! The signal is checked before acquiring and again once the resource is
//! held, in which case it is released straight away.

use std::future::Future;

use thiserror::Error;
use tracing::{debug, warn};

use crate::backend::{BackendError, Lease, SnapshotBackend, SnapshotKey};
use crate::cancel::Cancellation;
use crate::image::ImageRef;

#[derive(Debug, Error)]
pub enum ScopeError<E> {
  /// The resource could not be acquired; the body never ran.
  #[error(transparent)]
  Acquire(BackendError),

  /// Cancelled before or while acquiring; anything acquired was released again.
  #[error("cancelled while acquiring the resource")]
  Cancelled,

  /// The body failed; the resource was still released.
  #[error(transparent)]
  Body(E),
}

/// Hold a lease for the duration of `body`.
pub async fn with_lease<B, F, Fut, T, E>(backend: &B, cancel: &Cancellation, body: F) -> Result<T, ScopeError<E>>
where
  B: SnapshotBackend + ?Sized,
  F: FnOnce(Lease) -> Fut,
  Fut: Future<Output = Result<T, E>>,
{
  if cancel.is_cancelled() {
    return Err(ScopeError::Cancelled);
  }
  let lease = backend.acquire_lease().await.map_err(ScopeError::Acquire)?;
  debug!(lease = %lease.id, "lease held");

  if cancel.is_cancelled() {
    release_lease(backend, &lease).await;
    return Err(ScopeError::Cancelled);
  }

  let outcome = body(lease.clone()).await;
  release_lease(backend, &lease).await;
  outcome.map_err(ScopeError::Body)
}

async fn release_lease<B: SnapshotBackend + ?Sized>(backend: &B, lease: &Lease) {
  if let Err(e) = backend.release_lease(lease).await {
    warn!(lease = %lease.id, error = %e, "failed to release lease");
  }
}

/// Create a snapshot of `image` under a fresh key for the duration of `body`.
pub async fn with_snapshot<B, F, Fut, T, E>(
  backend: &B,
  lease: &Lease,
  image: &ImageRef,
  cancel: &Cancellation,
  body: F,
) -> Result<T, ScopeError<E>>
where
  B: SnapshotBackend + ?Sized,
  F: FnOnce(SnapshotKey) -> Fut,
  Fut: Future<Output = Result<T, E>>,
{
  if cancel.is_cancelled() {
    return Err(ScopeError::Cancelled);
  }
  let key = SnapshotKey::generate();
  backend
    .create_snapshot(lease, &key, image)
    .await
    .map_err(ScopeError::Acquire)?;
  debug!(key = %key, image = %image, "snapshot held");

  if cancel.is_cancelled() {
    delete_snapshot(backend, &key).await;
    return Err(ScopeError::Cancelled);
  }

  let outcome = body(key.clone()).await;
  delete_snapshot(backend, &key).await;
  outcome.map_err(ScopeError::Body)
}

async fn delete_snapshot<B: SnapshotBackend + ?Sized>(backend: &B, key: &SnapshotKey) {
  if let Err(e) = backend.delete_snapshot(key).await {
    warn!(key = %key, error = %e, "failed to delete snapshot");
  }
}
