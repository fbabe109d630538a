//! The privileged execution backend contract and its two realizations.
//!
//! Build orchestration and extraction are written against [`ExecutionBackend`]
//! and [`SnapshotBackend`] only. [`connect`] picks the concrete backend from
//! [`Config`] and hands it back as an explicitly owned value; there is no
//! process-wide client.

pub mod docker;
pub mod native;
pub mod process;
pub mod types;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::config::{BackendKind, Config};
use crate::image::ImageRef;
use crate::mount::Mount;

pub use docker::DockerBackend;
pub use native::NativeBackend;
pub use types::{BackendError, BindMount, Lease, SessionConfig, SessionHandle, SnapshotKey};

/// Create, drive, commit and tear down privileged execution environments.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
  /// Short name used in logs and errors.
  fn name(&self) -> &'static str;

  /// Whether `image` is present in the backing store.
  async fn image_exists(&self, image: &ImageRef) -> Result<bool, BackendError>;

  /// Seed the backing store with a root filesystem tarball.
  async fn import_image(&self, image: &ImageRef, tarball: &Path) -> Result<(), BackendError>;

  /// Provision an environment seeded from `config.image`, with its mounts and env fixed.
  async fn start(&self, config: &SessionConfig) -> Result<SessionHandle, BackendError>;

  /// Run one command to completion with stdio passed through; returns the exit code.
  async fn exec(&self, handle: &SessionHandle, command: &[String]) -> Result<i32, BackendError>;

  /// Freeze the environment's filesystem as `image`.
  async fn commit(&self, handle: &SessionHandle, image: &ImageRef) -> Result<(), BackendError>;

  /// Point `target` at the artifact `source` names.
  async fn tag(&self, source: &ImageRef, target: &ImageRef) -> Result<(), BackendError>;

  /// Stop and remove the environment.
  async fn destroy(&self, handle: &SessionHandle) -> Result<(), BackendError>;
}

/// Keyed, lease-protected working copies whose upper layer can be inspected.
#[async_trait]
pub trait SnapshotBackend: Send + Sync {
  async fn acquire_lease(&self) -> Result<Lease, BackendError>;

  async fn release_lease(&self, lease: &Lease) -> Result<(), BackendError>;

  /// Create a writable snapshot of `image` under `key`, protected by `lease`.
  async fn create_snapshot(&self, lease: &Lease, key: &SnapshotKey, image: &ImageRef) -> Result<(), BackendError>;

  /// Run one command with the snapshot as its root filesystem; returns the exit code.
  async fn run_in_snapshot(&self, key: &SnapshotKey, command: &[String]) -> Result<i32, BackendError>;

  /// Mount descriptors exposing only the snapshot's upper layer.
  async fn mounts(&self, key: &SnapshotKey) -> Result<Vec<Mount>, BackendError>;

  async fn delete_snapshot(&self, key: &SnapshotKey) -> Result<(), BackendError>;
}

/// Both halves of the contract, as one object.
pub trait Backend: ExecutionBackend + SnapshotBackend {}

impl<T: ExecutionBackend + SnapshotBackend> Backend for T {}

/// Construct the backend `config` selects.
///
/// # Errors
///
/// [`BackendError::Unavailable`] if the daemon does not answer or the store cannot be locked.
pub async fn connect(config: &Config, command: &str) -> Result<Arc<dyn Backend>, BackendError> {
  let backend: Arc<dyn Backend> = match config.backend {
    BackendKind::Docker => Arc::new(DockerBackend::connect(&config.docker).await?),
    BackendKind::Native => Arc::new(NativeBackend::open(&config.store, command)?),
  };
  info!(backend = backend.name(), "backend connected");
  Ok(backend)
}
