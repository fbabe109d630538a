//! Mount descriptors and scoped temporary mounts.
//!
//! Backends describe a snapshot's filesystem as a list of [`Mount`]s; callers
//! materialize them with [`with_temp_mount`], which guarantees the unmount.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use nix::mount::{MntFlags, MsFlags};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum MountError {
  #[error("no mounts to apply")]
  Empty,

  #[error("failed to create mount point {}: {source}", path.display())]
  MountPoint {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to mount {fs_type} {} on {}: {source}", source_path.display(), target.display())]
  Mount {
    fs_type: String,
    source_path: PathBuf,
    target: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to unmount {}: {source}", target.display())]
  Unmount {
    target: PathBuf,
    #[source]
    source: io::Error,
  },
}

/// One filesystem mount, in the shape `mount(8)` takes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
  /// `bind`, `overlay`, ...
  pub fs_type: String,
  pub source: PathBuf,
  pub options: Vec<String>,
}

impl Mount {
  /// A recursive bind mount of `source`.
  pub fn bind(source: impl Into<PathBuf>, read_only: bool) -> Self {
    let mut options = vec!["rbind".to_string()];
    options.push(if read_only { "ro" } else { "rw" }.to_string());
    Self {
      fs_type: "bind".to_string(),
      source: source.into(),
      options,
    }
  }

  /// An overlay of `lower` (topmost first) with an optional writable `(upper, work)` pair.
  ///
  /// Without an upper directory the overlay is read-only.
  pub fn overlay(lower: &[PathBuf], upper: Option<(&Path, &Path)>) -> Self {
    let lowerdir = lower
      .iter()
      .map(|p| p.to_string_lossy().into_owned())
      .collect::<Vec<_>>()
      .join(":");

    let mut options = vec![format!("lowerdir={}", lowerdir)];
    match upper {
      Some((upper, work)) => {
        options.push(format!("upperdir={}", upper.display()));
        options.push(format!("workdir={}", work.display()));
      }
      None => options.push("ro".to_string()),
    }

    Self {
      fs_type: "overlay".to_string(),
      source: PathBuf::from("overlay"),
      options,
    }
  }

  pub fn is_bind(&self) -> bool {
    self.fs_type == "bind" || self.options.iter().any(|o| o == "bind" || o == "rbind")
  }

  pub fn is_read_only(&self) -> bool {
    self.options.iter().any(|o| o == "ro")
  }

  /// Mount onto `target`, which must already exist.
  pub fn mount_at(&self, target: &Path) -> Result<(), MountError> {
    let err = |source: nix::Error| MountError::Mount {
      fs_type: self.fs_type.clone(),
      source_path: self.source.clone(),
      target: target.to_path_buf(),
      source: io::Error::from(source),
    };

    debug!(fs_type = %self.fs_type, source = ?self.source, target = ?target, "mounting");

    if self.is_bind() {
      let mut flags = MsFlags::MS_BIND;
      if self.options.iter().any(|o| o == "rbind") {
        flags |= MsFlags::MS_REC;
      }
      nix::mount::mount(Some(self.source.as_path()), target, None::<&str>, flags, None::<&str>).map_err(err)?;

      if self.is_read_only() {
        let remount = MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY;
        if let Err(e) = nix::mount::mount(None::<&str>, target, None::<&str>, remount, None::<&str>) {
          let _ = nix::mount::umount2(target, MntFlags::MNT_DETACH);
          return Err(err(e));
        }
      }
      return Ok(());
    }

    let mut flags = MsFlags::empty();
    if self.is_read_only() {
      flags |= MsFlags::MS_RDONLY;
    }
    let data = self
      .options
      .iter()
      .filter(|o| o.as_str() != "ro" && o.as_str() != "rw")
      .cloned()
      .collect::<Vec<_>>()
      .join(",");

    nix::mount::mount(
      Some(self.source.as_path()),
      target,
      Some(self.fs_type.as_str()),
      flags,
      Some(data.as_str()),
    )
    .map_err(err)
  }
}

/// Unmount whatever is mounted at `target`.
pub fn unmount(target: &Path) -> Result<(), MountError> {
  debug!(target = ?target, "unmounting");
  nix::mount::umount2(target, MntFlags::empty()).map_err(|e| MountError::Unmount {
    target: target.to_path_buf(),
    source: io::Error::from(e),
  })
}

/// Lazily detach `target` along with everything mounted beneath it.
pub fn detach(target: &Path) -> Result<(), MountError> {
  debug!(target = ?target, "detaching");
  nix::mount::umount2(target, MntFlags::MNT_DETACH).map_err(|e| MountError::Unmount {
    target: target.to_path_buf(),
    source: io::Error::from(e),
  })
}

/// Whether something is mounted at `path` (its device differs from its parent's).
pub fn is_mount_point(path: &Path) -> io::Result<bool> {
  use std::os::unix::fs::MetadataExt;

  let Some(parent) = path.parent() else {
    return Ok(true);
  };
  Ok(fs::metadata(path)?.dev() != fs::metadata(parent)?.dev())
}

/// Mount `mounts` on a fresh temporary directory, run `f` on it, then unmount.
///
/// The unmount happens on every path out of `f`. If `f` fails and the
/// unmount fails too, `f`'s error is returned and the unmount failure is
/// logged. A lone read-only bind mount is handed to `f` in place, since
/// mounting it again would expose the same tree.
pub fn with_temp_mount<T, E, F>(mounts: &[Mount], f: F) -> Result<T, E>
where
  F: FnOnce(&Path) -> Result<T, E>,
  E: From<MountError>,
{
  if let [only] = mounts
    && only.is_bind()
    && only.is_read_only()
  {
    return f(&only.source);
  }
  if mounts.is_empty() {
    return Err(MountError::Empty.into());
  }

  // Kept on disk: removal is left to `unmount_n`, which must not recurse into a live mount.
  let root = tempfile::Builder::new()
    .prefix("stratum-mount-")
    .tempdir()
    .map_err(|source| MountError::MountPoint {
      path: std::env::temp_dir(),
      source,
    })?
    .keep();

  let mut mounted = 0;
  for mount in mounts {
    if let Err(e) = mount.mount_at(&root) {
      if let Err(cleanup) = unmount_n(&root, mounted) {
        warn!(error = %cleanup, "failed to roll back partial mount");
      }
      return Err(e.into());
    }
    mounted += 1;
  }

  let result = f(&root);

  match (result, unmount_n(&root, mounted)) {
    (Ok(value), Ok(())) => Ok(value),
    (Ok(_), Err(e)) => Err(e.into()),
    (Err(e), Ok(())) => Err(e),
    (Err(e), Err(cleanup)) => {
      warn!(error = %cleanup, "failed to unmount after error");
      Err(e)
    }
  }
}

/// Pop `count` stacked mounts off `root` and remove the (now empty) mount point.
fn unmount_n(root: &Path, count: usize) -> Result<(), MountError> {
  for _ in 0..count {
    unmount(root)?;
  }
  // Non-recursive: a mount that somehow survived keeps its contents.
  if let Err(e) = fs::remove_dir(root) {
    warn!(path = ?root, error = %e, "failed to remove temporary mount point");
  }
  Ok(())
}
