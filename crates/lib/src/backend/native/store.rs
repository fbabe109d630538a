//! On-disk layout of the native store.
//!
//! ```text
//! <root>/
//! ├── .lock
//! ├── layers/<id>/              immutable filesystem trees
//! ├── images/<ref>.json         reference → layer chain (bottom first)
//! ├── snapshots/<key>/
//! │   ├── snapshot.json
//! │   ├── upper/  work/  rootfs/
//! └── leases/<id>.json
//! ```
//!
//! Records are written to a temp file and renamed into place.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::backend::types::{Lease, SnapshotKey};
use crate::image::ImageRef;

const LAYERS_DIR: &str = "layers";
const IMAGES_DIR: &str = "images";
const SNAPSHOTS_DIR: &str = "snapshots";
const LEASES_DIR: &str = "leases";
const SNAPSHOT_RECORD: &str = "snapshot.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
  pub reference: ImageRef,
  /// Layer ids, bottom first.
  pub layers: Vec<String>,
  pub created_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
  pub key: SnapshotKey,
  pub image: ImageRef,
  /// Layer ids of `image` at creation time, bottom first.
  pub layers: Vec<String>,
  pub lease: String,
  pub created_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
  pub id: String,
  pub created_at: u64,
}

pub fn now_unix() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or_default()
    .as_secs()
}

/// File-name-safe form of a reference: `%`, `/` and `:` are percent-escaped.
pub fn encode_reference(image: &ImageRef) -> String {
  let mut out = String::new();
  for c in image.full_name().chars() {
    match c {
      '%' => out.push_str("%25"),
      '/' => out.push_str("%2F"),
      ':' => out.push_str("%3A"),
      c => out.push(c),
    }
  }
  out
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
  let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
  let mut temp = path.as_os_str().to_owned();
  temp.push(".tmp");
  let temp = PathBuf::from(temp);
  fs::write(&temp, json)?;
  fs::rename(&temp, path)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
  match fs::read_to_string(path) {
    Ok(content) => serde_json::from_str(&content)
      .map(Some)
      .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
    Err(e) => Err(e),
  }
}

/// Every `*.json` record in `dir`.
///
/// When `strict`, an unreadable record is an error naming its path;
/// otherwise it is logged and skipped.
fn read_records<T: DeserializeOwned>(dir: &Path, strict: bool) -> io::Result<Vec<T>> {
  let entries = match fs::read_dir(dir) {
    Ok(entries) => entries,
    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
    Err(e) => return Err(e),
  };

  let mut records = Vec::new();
  for entry in entries {
    let path = entry?.path();
    if path.extension().is_none_or(|ext| ext != "json") {
      continue;
    }
    match read_json(&path) {
      Ok(Some(record)) => records.push(record),
      Ok(None) => {}
      Err(e) if strict => return Err(io::Error::new(e.kind(), format!("{}: {}", path.display(), e))),
      Err(e) => warn!(path = ?path, error = %e, "skipping unreadable record"),
    }
  }
  Ok(records)
}

#[derive(Debug, Clone)]
pub struct NativeStore {
  root: PathBuf,
}

impl NativeStore {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  pub fn ensure_layout(&self) -> io::Result<()> {
    for dir in [LAYERS_DIR, IMAGES_DIR, SNAPSHOTS_DIR, LEASES_DIR] {
      fs::create_dir_all(self.root.join(dir))?;
    }
    Ok(())
  }

  pub fn layers_dir(&self) -> PathBuf {
    self.root.join(LAYERS_DIR)
  }

  pub fn snapshots_dir(&self) -> PathBuf {
    self.root.join(SNAPSHOTS_DIR)
  }

  pub fn layer_path(&self, id: &str) -> PathBuf {
    self.layers_dir().join(id)
  }

  /// Allocate an empty layer directory.
  pub fn create_layer(&self) -> io::Result<(String, PathBuf)> {
    let id = uuid::Uuid::new_v4().simple().to_string();
    let path = self.layer_path(&id);
    fs::create_dir_all(&path)?;
    Ok((id, path))
  }

  /// Layer directories, topmost first, as overlay `lowerdir` wants them.
  pub fn lower_dirs(&self, layers: &[String]) -> Vec<PathBuf> {
    layers.iter().rev().map(|id| self.layer_path(id)).collect()
  }

  fn image_path(&self, image: &ImageRef) -> PathBuf {
    self.root.join(IMAGES_DIR).join(format!("{}.json", encode_reference(image)))
  }

  pub fn read_image(&self, image: &ImageRef) -> io::Result<Option<ImageRecord>> {
    read_json(&self.image_path(image))
  }

  pub fn write_image(&self, record: &ImageRecord) -> io::Result<()> {
    write_json_atomic(&self.image_path(&record.reference), record)
  }

  /// Every image record; a single unreadable one fails the listing.
  pub fn list_images(&self) -> io::Result<Vec<ImageRecord>> {
    read_records(&self.root.join(IMAGES_DIR), true)
  }

  pub fn snapshot_dir(&self, key: &SnapshotKey) -> PathBuf {
    self.snapshots_dir().join(key.as_str())
  }

  pub fn upper_dir(&self, key: &SnapshotKey) -> PathBuf {
    self.snapshot_dir(key).join("upper")
  }

  pub fn work_dir(&self, key: &SnapshotKey) -> PathBuf {
    self.snapshot_dir(key).join("work")
  }

  pub fn rootfs_dir(&self, key: &SnapshotKey) -> PathBuf {
    self.snapshot_dir(key).join("rootfs")
  }

  /// Create the snapshot's directories and record.
  pub fn create_snapshot(&self, record: &SnapshotRecord) -> io::Result<()> {
    for dir in [
      self.upper_dir(&record.key),
      self.work_dir(&record.key),
      self.rootfs_dir(&record.key),
    ] {
      fs::create_dir_all(dir)?;
    }
    write_json_atomic(&self.snapshot_dir(&record.key).join(SNAPSHOT_RECORD), record)
  }

  pub fn read_snapshot(&self, key: &SnapshotKey) -> io::Result<Option<SnapshotRecord>> {
    read_json(&self.snapshot_dir(key).join(SNAPSHOT_RECORD))
  }

  /// Names of every snapshot directory, with or without a readable record.
  pub fn list_snapshot_keys(&self) -> io::Result<Vec<SnapshotKey>> {
    let entries = match fs::read_dir(self.snapshots_dir()) {
      Ok(entries) => entries,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
      Err(e) => return Err(e),
    };

    let mut keys = Vec::new();
    for entry in entries {
      let entry = entry?;
      if entry.file_type()?.is_dir()
        && let Some(name) = entry.file_name().to_str()
      {
        keys.push(SnapshotKey::from(name));
      }
    }
    keys.sort();
    Ok(keys)
  }

  pub fn remove_snapshot(&self, key: &SnapshotKey) -> io::Result<()> {
    fs::remove_dir_all(self.snapshot_dir(key))
  }

  fn lease_path(&self, id: &str) -> PathBuf {
    self.root.join(LEASES_DIR).join(format!("{}.json", id))
  }

  pub fn write_lease(&self, lease: &Lease) -> io::Result<LeaseRecord> {
    let record = LeaseRecord {
      id: lease.id.clone(),
      created_at: now_unix(),
    };
    write_json_atomic(&self.lease_path(&lease.id), &record)?;
    Ok(record)
  }

  pub fn lease_exists(&self, id: &str) -> bool {
    self.lease_path(id).is_file()
  }

  pub fn list_leases(&self) -> io::Result<Vec<LeaseRecord>> {
    read_records(&self.root.join(LEASES_DIR), false)
  }

  /// Returns `false` if no such lease existed.
  pub fn remove_lease(&self, id: &str) -> io::Result<bool> {
    match fs::remove_file(self.lease_path(id)) {
      Ok(()) => Ok(true),
      Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
      Err(e) => Err(e),
    }
  }
}
