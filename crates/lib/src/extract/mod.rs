//! Extraction pipeline.
//!
//! Pulls a finished image's exportable content out of the backing store into
//! a plain directory. The image stages that content itself: its export hook
//! runs in a fresh snapshot and writes into `extract/` at the root of the
//! snapshot, then the snapshot's upper layer is mounted and every regular
//! file under `extract/` is copied into the destination.
//!
//! The source image is never modified. The snapshot and the lease that
//! protects it are dropped on every path out; failing to drop them is logged
//! and does not change the result.
//!
//! A failed extraction leaves the destination in an indeterminate state.
//! Retrying starts by clearing it, so a retry always starts clean.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::backend::{BackendError, SnapshotBackend, SnapshotKey};
use crate::cancel::Cancellation;
use crate::consts::{EXPORT_HOOK, INITRAMFS_IMAGE, KERNEL_IMAGE, ROOTFS_IMAGE, STAGING_DIR};
use crate::image::ImageRef;
use crate::mount::{MountError, with_temp_mount};
use crate::snapshot::{ScopeError, with_lease, with_snapshot};
use crate::util::fs::{clean_directory, copy_file, file_exists};

/// Files a bootable image's export hook is expected to stage.
pub const BOOT_ARTIFACTS: [&str; 3] = [ROOTFS_IMAGE, KERNEL_IMAGE, INITRAMFS_IMAGE];

/// The stage of an extraction an error came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractPhase {
  Prepare,
  Lease,
  Snapshot,
  Export,
  Mount,
  Copy { path: Option<PathBuf> },
}

impl fmt::Display for ExtractPhase {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ExtractPhase::Prepare => write!(f, "prepare"),
      ExtractPhase::Lease => write!(f, "lease"),
      ExtractPhase::Snapshot => write!(f, "snapshot"),
      ExtractPhase::Export => write!(f, "export"),
      ExtractPhase::Mount => write!(f, "mount"),
      ExtractPhase::Copy { path: Some(path) } => write!(f, "copy of {}", path.display()),
      ExtractPhase::Copy { path: None } => write!(f, "copy"),
    }
  }
}

#[derive(Debug, Error)]
pub enum ExtractError {
  #[error("failed to prepare destination {}: {source}", path.display())]
  Prepare {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("destination {} exists and is not a directory", path.display())]
  NotADirectory { path: PathBuf },

  #[error("failed to acquire lease: {0}")]
  Lease(#[source] BackendError),

  #[error("failed to create snapshot of {image}: {source}")]
  Snapshot {
    image: ImageRef,
    #[source]
    source: BackendError,
  },

  /// The image's export hook ran and exited non-zero.
  #[error("export hook exited with code {code}")]
  ExportFailed { code: i32 },

  #[error("failed to run export hook: {0}")]
  Export(#[source] BackendError),

  /// The export hook succeeded but left no staging directory.
  #[error("image staged nothing to extract (no extract/ directory)")]
  NothingStaged,

  #[error("failed to resolve snapshot mounts: {0}")]
  Mounts(#[source] BackendError),

  #[error(transparent)]
  Mount(#[from] MountError),

  #[error("failed to walk staged content: {0}")]
  Walk(#[from] walkdir::Error),

  #[error("failed to copy {}: {source}", path.display())]
  Copy {
    /// Path relative to the staging directory.
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("extraction cancelled during {phase}")]
  Cancelled { phase: ExtractPhase },

  #[error("copy task failed: {0}")]
  Task(#[from] tokio::task::JoinError),
}

impl ExtractError {
  pub fn phase(&self) -> ExtractPhase {
    match self {
      ExtractError::Prepare { .. } | ExtractError::NotADirectory { .. } => ExtractPhase::Prepare,
      ExtractError::Lease(_) => ExtractPhase::Lease,
      ExtractError::Snapshot { .. } => ExtractPhase::Snapshot,
      ExtractError::ExportFailed { .. } | ExtractError::Export(_) | ExtractError::NothingStaged => {
        ExtractPhase::Export
      }
      ExtractError::Mounts(_) | ExtractError::Mount(_) => ExtractPhase::Mount,
      ExtractError::Walk(e) => ExtractPhase::Copy {
        path: e.path().map(Path::to_path_buf),
      },
      ExtractError::Copy { path, .. } => ExtractPhase::Copy {
        path: Some(path.clone()),
      },
      ExtractError::Task(_) => ExtractPhase::Copy { path: None },
      ExtractError::Cancelled { phase } => phase.clone(),
    }
  }
}

/// What an extraction copied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExtractReport {
  pub files: usize,
  pub bytes: u64,
}

/// The command that runs an image's export hook.
pub fn export_command() -> Vec<String> {
  vec![
    "/usr/bin/env".to_string(),
    "bash".to_string(),
    "-c".to_string(),
    EXPORT_HOOK.to_string(),
  ]
}

/// Create `destination` if needed and empty it.
///
/// A symlink to a directory is followed and the link itself kept, so a
/// `current -> boot-a` style destination works.
fn prepare_destination(destination: &Path) -> Result<(), ExtractError> {
  let prepare = |source| ExtractError::Prepare {
    path: destination.to_path_buf(),
    source,
  };

  match fs::metadata(destination) {
    Ok(meta) if meta.is_dir() => clean_directory(destination).map_err(prepare),
    Ok(_) => Err(ExtractError::NotADirectory {
      path: destination.to_path_buf(),
    }),
    Err(e) if e.kind() == io::ErrorKind::NotFound => fs::create_dir_all(destination).map_err(prepare),
    Err(e) => Err(prepare(e)),
  }
}

/// Copy every regular file under `staging` into `destination`, keeping relative paths.
///
/// Directories are traversed, not copied. Symlinks and special files
/// (including overlay whiteouts) are skipped, and a symlinked staging
/// directory counts as nothing staged.
fn copy_staged(staging: &Path, destination: &Path, cancel: &Cancellation) -> Result<ExtractReport, ExtractError> {
  match fs::symlink_metadata(staging) {
    Ok(meta) if meta.is_dir() => {}
    _ => return Err(ExtractError::NothingStaged),
  }

  let mut report = ExtractReport::default();

  for entry in WalkDir::new(staging).follow_links(false) {
    let entry = entry?;
    if !entry.file_type().is_file() {
      continue;
    }

    let Ok(relative) = entry.path().strip_prefix(staging) else {
      continue;
    };

    if cancel.is_cancelled() {
      return Err(ExtractError::Cancelled {
        phase: ExtractPhase::Copy {
          path: Some(relative.to_path_buf()),
        },
      });
    }

    let bytes = copy_file(entry.path(), &destination.join(relative)).map_err(|source| ExtractError::Copy {
      path: relative.to_path_buf(),
      source,
    })?;
    debug!(path = %relative.display(), bytes, "copied");

    report.files += 1;
    report.bytes += bytes;
  }

  Ok(report)
}

/// Run the export hook in snapshot `key` and copy what it staged.
async fn export_and_copy<B>(
  backend: &B,
  key: &SnapshotKey,
  destination: &Path,
  cancel: &Cancellation,
) -> Result<ExtractReport, ExtractError>
where
  B: SnapshotBackend + ?Sized,
{
  let code = cancel
    .run(backend.run_in_snapshot(key, &export_command()))
    .await
    .map_err(|_| ExtractError::Cancelled {
      phase: ExtractPhase::Export,
    })?
    .map_err(ExtractError::Export)?;
  if code != 0 {
    return Err(ExtractError::ExportFailed { code });
  }

  let mounts = cancel
    .run(backend.mounts(key))
    .await
    .map_err(|_| ExtractError::Cancelled {
      phase: ExtractPhase::Mount,
    })?
    .map_err(ExtractError::Mounts)?;

  let destination = destination.to_path_buf();
  let cancel = cancel.clone();
  tokio::task::spawn_blocking(move || {
    with_temp_mount(&mounts, |root| {
      copy_staged(&root.join(STAGING_DIR), &destination, &cancel)
    })
  })
  .await?
}

/// Extract `image`'s staged content into `destination`.
///
/// `destination` is created if missing and emptied if not, so repeated
/// extractions of an unchanged image leave identical contents.
pub async fn extract_image<B>(
  backend: &B,
  image: &ImageRef,
  destination: &Path,
  cancel: &Cancellation,
) -> Result<ExtractReport, ExtractError>
where
  B: SnapshotBackend + ?Sized,
{
  prepare_destination(destination)?;
  info!(image = %image, destination = %destination.display(), "extracting image");

  let outcome = with_lease(backend, cancel, |lease| async move {
    with_snapshot(backend, &lease, image, cancel, |key| async move {
      export_and_copy(backend, &key, destination, cancel).await
    })
    .await
    .map_err(|e| match e {
      ScopeError::Acquire(source) => ExtractError::Snapshot {
        image: image.clone(),
        source,
      },
      ScopeError::Cancelled => ExtractError::Cancelled {
        phase: ExtractPhase::Snapshot,
      },
      ScopeError::Body(e) => e,
    })
  })
  .await;

  let report = outcome.map_err(|e| match e {
    ScopeError::Acquire(source) => ExtractError::Lease(source),
    ScopeError::Cancelled => ExtractError::Cancelled {
      phase: ExtractPhase::Lease,
    },
    ScopeError::Body(e) => e,
  })?;

  info!(image = %image, files = report.files, bytes = report.bytes, "extraction complete");
  Ok(report)
}

/// Boot artifacts missing from `destination`.
pub fn missing_boot_artifacts(destination: &Path) -> Vec<&'static str> {
  BOOT_ARTIFACTS
    .into_iter()
    .filter(|name| !file_exists(&destination.join(name)))
    .collect()
}
