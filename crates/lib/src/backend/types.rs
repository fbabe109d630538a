//! Types shared by every execution backend.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::image::ImageRef;
use crate::mount::MountError;

/// A host directory exposed inside an execution environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindMount {
  /// Host path.
  pub source: PathBuf,
  /// Absolute path inside the environment.
  pub target: PathBuf,
  pub read_only: bool,
}

impl BindMount {
  pub fn new(source: impl Into<PathBuf>, target: impl Into<PathBuf>, read_only: bool) -> Self {
    Self {
      source: source.into(),
      target: target.into(),
      read_only,
    }
  }
}

/// Everything fixed at the moment an execution environment is created.
///
/// Mounts and environment variables are not changeable per command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
  /// Image the environment's root filesystem is seeded from.
  pub image: ImageRef,
  pub mounts: Vec<BindMount>,
  pub env: BTreeMap<String, String>,
  /// Short human-readable label used in backend-side names (e.g. the image being built).
  pub label: String,
}

impl SessionConfig {
  pub fn new(image: ImageRef, label: impl Into<String>) -> Self {
    Self {
      image,
      mounts: Vec::new(),
      env: BTreeMap::new(),
      label: label.into(),
    }
  }
}

/// Backend-issued identifier for a running execution environment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionHandle {
  pub id: String,
  pub image: ImageRef,
}

/// Key of a working snapshot. Freshly generated per operation so concurrent
/// operations on the same image never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SnapshotKey(String);

impl SnapshotKey {
  pub fn generate() -> Self {
    Self(uuid::Uuid::new_v4().simple().to_string())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl From<&str> for SnapshotKey {
  fn from(s: &str) -> Self {
    Self(s.to_string())
  }
}

impl fmt::Display for SnapshotKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Token that keeps content reachable from its snapshots out of garbage collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Lease {
  pub id: String,
}

impl Lease {
  pub fn generate() -> Self {
    Self {
      id: uuid::Uuid::new_v4().simple().to_string(),
    }
  }
}

/// Errors surfaced by backend implementations.
#[derive(Debug, Error)]
pub enum BackendError {
  /// The daemon, CLI, or store cannot be reached or locked.
  #[error("{backend} backend unavailable: {message}")]
  Unavailable { backend: &'static str, message: String },

  #[error("failed to spawn {program}: {source}")]
  Spawn {
    program: String,
    #[source]
    source: io::Error,
  },

  #[error("`{command}` exited with code {code}{}", format_stderr(stderr))]
  CommandFailed { command: String, code: i32, stderr: String },

  #[error("image not found: {0}")]
  ImageNotFound(ImageRef),

  #[error("session not found: {0}")]
  SessionNotFound(String),

  #[error("snapshot not found: {0}")]
  SnapshotNotFound(SnapshotKey),

  #[error("lease not found: {0}")]
  LeaseNotFound(String),

  #[error("unexpected backend response: {0}")]
  InvalidResponse(String),

  #[error(transparent)]
  Mount(#[from] MountError),

  #[error("io error: {0}")]
  Io(#[from] io::Error),
}

fn format_stderr(stderr: &str) -> String {
  let trimmed = stderr.trim();
  if trimmed.is_empty() {
    String::new()
  } else {
    format!(": {}", trimmed)
  }
}
