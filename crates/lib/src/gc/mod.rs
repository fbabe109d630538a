//! Garbage collection of the native store.
//!
//! Runs under an exclusive store lock, so no build, extraction or import is
//! using the store at the same time. Anything a live process would hold is
//! therefore either protected by a lease younger than the expiry or left over
//! from a process that died.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::backend::SnapshotKey;
use crate::backend::native::store::{NativeStore, now_unix};
use crate::mount::is_mount_point;
use crate::store_lock::{LockMode, StoreLock, StoreLockError};
use crate::util::fs::dir_size;

#[derive(Debug, Error)]
pub enum GcError {
  #[error(transparent)]
  Lock(#[from] StoreLockError),

  /// Some image's layer list is unknown, so no layer can safely be called unreferenced.
  #[error("refusing to collect garbage, unreadable image record: {0}")]
  UnreadableImage(#[source] io::Error),

  #[error("failed to read store directory: {0}")]
  ReadStore(#[from] io::Error),
}

#[derive(Debug, Default, Serialize)]
pub struct GcStats {
  pub leases_scanned: usize,
  pub leases_deleted: usize,
  pub snapshots_scanned: usize,
  pub snapshots_deleted: usize,
  /// Unprotected snapshots left alone because they are still mounted.
  pub snapshots_mounted: usize,
  pub snapshots_bytes_freed: u64,
  pub layers_scanned: usize,
  pub layers_deleted: usize,
  pub layers_bytes_freed: u64,
}

impl GcStats {
  pub fn total_deleted(&self) -> usize {
    self.leases_deleted + self.snapshots_deleted + self.layers_deleted
  }

  pub fn total_bytes_freed(&self) -> u64 {
    self.snapshots_bytes_freed + self.layers_bytes_freed
  }
}

#[derive(Debug, Serialize)]
pub struct GcResult {
  pub stats: GcStats,
  pub deleted_paths: Vec<PathBuf>,
}

/// Remove expired leases, unprotected snapshots, and unreferenced layers under `store_root`.
///
/// A lease expires once it is at least `lease_expiry` old. With `dry_run`
/// nothing is deleted, but the result reports what would have been. Every
/// image record is read before anything is touched; one that cannot be read
/// aborts the run.
pub fn collect_garbage(store_root: &Path, lease_expiry: Duration, dry_run: bool) -> Result<GcResult, GcError> {
  let _lock = StoreLock::acquire(store_root, LockMode::Exclusive, "gc")?;
  let store = NativeStore::new(store_root);
  store.ensure_layout()?;

  let images = store.list_images().map_err(GcError::UnreadableImage)?;

  let mut stats = GcStats::default();
  let mut deleted_paths = Vec::new();

  let live_leases = sweep_leases(&store, lease_expiry, dry_run, &mut stats)?;
  let mut referenced = sweep_snapshots(&store, &live_leases, dry_run, &mut stats, &mut deleted_paths)?;
  for image in images {
    referenced.extend(image.layers);
  }
  debug!(count = referenced.len(), "collected referenced layers");

  sweep_layers(&store, &referenced, dry_run, &mut stats, &mut deleted_paths)?;

  info!(
    leases_deleted = stats.leases_deleted,
    snapshots_deleted = stats.snapshots_deleted,
    layers_deleted = stats.layers_deleted,
    bytes_freed = stats.total_bytes_freed(),
    dry_run,
    "garbage collection complete"
  );

  Ok(GcResult { stats, deleted_paths })
}

/// Drop expired leases; returns the ids still live.
fn sweep_leases(
  store: &NativeStore,
  lease_expiry: Duration,
  dry_run: bool,
  stats: &mut GcStats,
) -> Result<HashSet<String>, GcError> {
  let now = now_unix();
  let mut live = HashSet::new();

  for lease in store.list_leases()? {
    stats.leases_scanned += 1;

    if now.saturating_sub(lease.created_at) < lease_expiry.as_secs() {
      live.insert(lease.id);
      continue;
    }

    debug!(lease = %lease.id, "removing expired lease");
    if dry_run {
      stats.leases_deleted += 1;
      continue;
    }
    match store.remove_lease(&lease.id) {
      Ok(_) => stats.leases_deleted += 1,
      Err(e) => {
        warn!(lease = %lease.id, error = %e, "failed to delete lease");
        live.insert(lease.id);
      }
    }
  }

  Ok(live)
}

/// Drop snapshots not covered by a live lease; returns the layers kept snapshots still use.
fn sweep_snapshots(
  store: &NativeStore,
  live_leases: &HashSet<String>,
  dry_run: bool,
  stats: &mut GcStats,
  deleted_paths: &mut Vec<PathBuf>,
) -> Result<HashSet<String>, GcError> {
  let mut protected_layers = HashSet::new();

  for key in store.list_snapshot_keys()? {
    stats.snapshots_scanned += 1;

    let record = match store.read_snapshot(&key) {
      Ok(record) => record,
      Err(e) => {
        warn!(key = %key, error = %e, "unreadable snapshot record");
        None
      }
    };

    if let Some(record) = &record
      && live_leases.contains(&record.lease)
    {
      protected_layers.extend(record.layers.iter().cloned());
      continue;
    }

    if still_mounted(store, &key) {
      warn!(key = %key, "snapshot is still mounted, leaving it in place");
      stats.snapshots_mounted += 1;
      if let Some(record) = record {
        protected_layers.extend(record.layers);
      }
      continue;
    }

    let path = store.snapshot_dir(&key);
    let size = dir_size(&path);
    debug!(key = %key, "removing unprotected snapshot");

    if dry_run {
      stats.snapshots_deleted += 1;
      stats.snapshots_bytes_freed += size;
      deleted_paths.push(path);
      continue;
    }
    match store.remove_snapshot(&key) {
      Ok(()) => {
        stats.snapshots_deleted += 1;
        stats.snapshots_bytes_freed += size;
        deleted_paths.push(path);
      }
      Err(e) => {
        warn!(key = %key, error = %e, "failed to delete snapshot");
      }
    }
  }

  Ok(protected_layers)
}

/// An unknown mount state counts as mounted.
fn still_mounted(store: &NativeStore, key: &SnapshotKey) -> bool {
  let rootfs = store.rootfs_dir(key);
  if !rootfs.exists() {
    return false;
  }
  is_mount_point(&rootfs).unwrap_or(true)
}

fn sweep_layers(
  store: &NativeStore,
  referenced: &HashSet<String>,
  dry_run: bool,
  stats: &mut GcStats,
  deleted_paths: &mut Vec<PathBuf>,
) -> Result<(), GcError> {
  for entry in fs::read_dir(store.layers_dir())?.flatten() {
    let path = entry.path();
    if !path.is_dir() {
      continue;
    }

    stats.layers_scanned += 1;

    let Some(id) = path.file_name().and_then(|n| n.to_str()) else {
      continue;
    };
    if referenced.contains(id) {
      continue;
    }

    let size = dir_size(&path);
    debug!(layer = %id, "removing unreferenced layer");

    if dry_run {
      stats.layers_deleted += 1;
      stats.layers_bytes_freed += size;
      deleted_paths.push(path);
      continue;
    }
    match fs::remove_dir_all(&path) {
      Ok(()) => {
        stats.layers_deleted += 1;
        stats.layers_bytes_freed += size;
        deleted_paths.push(path);
      }
      Err(e) => {
        warn!(path = %path.display(), error = %e, "failed to delete layer");
      }
    }
  }

  Ok(())
}
