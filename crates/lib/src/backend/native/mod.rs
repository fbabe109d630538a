//! Snapshot/lease runtime over a local layer store.
//!
//! Images are chains of immutable layer directories. A snapshot adds a
//! writable upper directory and is mounted as an overlay; commands run in it
//! through `unshare` + `chroot` in fresh mount, pid, uts and ipc namespaces.
//! Committing copies the upper directory into a new layer.
//!
//! The backend holds a shared store lock for its whole lifetime so garbage
//! collection cannot run underneath it.

pub mod store;

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::process;
use super::types::{BackendError, BindMount, Lease, SessionConfig, SessionHandle, SnapshotKey};
use super::{ExecutionBackend, SnapshotBackend};
use crate::image::ImageRef;
use crate::mount::{self, Mount};
use crate::platform::is_elevated;
use crate::store_lock::{LockMode, StoreLock};

pub use store::{ImageRecord, LeaseRecord, NativeStore, SnapshotRecord};

const NAME: &str = "native";

const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Host trees every environment sees: `(source, target, read_only)`.
const SYSTEM_BINDS: [(&str, &str, bool); 2] = [("/dev", "/dev", false), ("/sys", "/sys", true)];

/// Mounts stacked on one snapshot's rootfs, torn down in reverse.
#[derive(Debug)]
struct RootfsMounts {
  rootfs: PathBuf,
  mounted: Vec<PathBuf>,
  /// Directories created inside the rootfs to serve as mount points, relative, in creation order.
  created: Vec<PathBuf>,
}

impl RootfsMounts {
  fn mount(overlay: &Mount, rootfs: &Path, binds: &[BindMount]) -> Result<Self, BackendError> {
    overlay.mount_at(rootfs)?;

    let mut mounts = Self {
      rootfs: rootfs.to_path_buf(),
      mounted: vec![rootfs.to_path_buf()],
      created: Vec::new(),
    };

    let setup = mounts
      .ensure_dir(Path::new("proc"))
      .and_then(|_| binds.iter().try_for_each(|bind| mounts.bind(bind)));
    if let Err(e) = setup {
      if let Err(cleanup) = mounts.unmount_all() {
        warn!(rootfs = ?rootfs, error = %cleanup, "failed to roll back rootfs mounts");
      }
      return Err(e);
    }

    Ok(mounts)
  }

  /// Create `relative` inside the rootfs component by component, remembering what was new.
  fn ensure_dir(&mut self, relative: &Path) -> Result<PathBuf, BackendError> {
    let mut target = self.rootfs.clone();
    for component in relative.components() {
      target.push(component);
      if !target.exists() {
        fs::create_dir(&target)?;
        if let Ok(rel) = target.strip_prefix(&self.rootfs) {
          self.created.push(rel.to_path_buf());
        }
      }
    }
    Ok(target)
  }

  fn bind(&mut self, bind: &BindMount) -> Result<(), BackendError> {
    let relative = bind.target.strip_prefix("/").unwrap_or(&bind.target);
    let target = self.ensure_dir(relative)?;
    Mount::bind(&bind.source, bind.read_only).mount_at(&target)?;
    self.mounted.push(target);
    Ok(())
  }

  /// Detach everything, attempting each mount even after a failure.
  fn unmount_all(&mut self) -> Result<(), BackendError> {
    let mut first = None;
    while let Some(target) = self.mounted.pop() {
      if let Err(e) = mount::detach(&target) {
        warn!(target = ?target, error = %e, "failed to detach");
        first.get_or_insert(e);
      }
    }
    first.map_or(Ok(()), |e| Err(e.into()))
  }
}

/// A run dropped mid-flight (e.g. on cancellation) never reaches its explicit
/// unmount; detach here so the snapshot can still be deleted.
impl Drop for RootfsMounts {
  fn drop(&mut self) {
    if !self.mounted.is_empty()
      && let Err(e) = self.unmount_all()
    {
      warn!(rootfs = ?self.rootfs, error = %e, "failed to detach dropped rootfs mounts");
    }
  }
}

#[derive(Debug)]
struct NativeSession {
  key: SnapshotKey,
  lease: Lease,
  env: BTreeMap<String, String>,
  mounts: RootfsMounts,
}

pub struct NativeBackend {
  store: NativeStore,
  sessions: Mutex<HashMap<String, NativeSession>>,
  _lock: StoreLock,
}

impl NativeBackend {
  /// Open the store at `root`, taking a shared lock on it for `command`.
  pub fn open(root: &Path, command: &str) -> Result<Self, BackendError> {
    let lock = StoreLock::acquire(root, LockMode::Shared, command).map_err(|e| BackendError::Unavailable {
      backend: NAME,
      message: e.to_string(),
    })?;

    let store = NativeStore::new(root);
    store.ensure_layout()?;
    debug!(store = ?root, "native store opened");

    Ok(Self {
      store,
      sessions: Mutex::new(HashMap::new()),
      _lock: lock,
    })
  }

  pub fn store(&self) -> &NativeStore {
    &self.store
  }

  fn sessions(&self) -> std::sync::MutexGuard<'_, HashMap<String, NativeSession>> {
    self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  fn require_root(&self) -> Result<(), BackendError> {
    if is_elevated() {
      Ok(())
    } else {
      Err(BackendError::Unavailable {
        backend: NAME,
        message: "mounting snapshots requires root".to_string(),
      })
    }
  }

  fn snapshot_record(&self, key: &SnapshotKey) -> Result<SnapshotRecord, BackendError> {
    self
      .store
      .read_snapshot(key)?
      .ok_or_else(|| BackendError::SnapshotNotFound(key.clone()))
  }

  fn mount_snapshot(&self, record: &SnapshotRecord, binds: &[BindMount]) -> Result<RootfsMounts, BackendError> {
    let upper = self.store.upper_dir(&record.key);
    let work = self.store.work_dir(&record.key);
    let overlay = Mount::overlay(&self.store.lower_dirs(&record.layers), Some((&upper, &work)));

    let mut all = system_binds();
    all.extend(binds.iter().cloned());
    RootfsMounts::mount(&overlay, &self.store.rootfs_dir(&record.key), &all)
  }
}

fn system_binds() -> Vec<BindMount> {
  SYSTEM_BINDS
    .into_iter()
    .filter(|(source, _, _)| Path::new(source).is_dir())
    .map(|(source, target, read_only)| BindMount::new(source, target, read_only))
    .collect()
}

/// `unshare ... chroot <rootfs> <command>` with a clean environment plus `env`.
fn isolated_command(rootfs: &Path, env: &BTreeMap<String, String>, command: &[String]) -> Command {
  let mut proc_mount = std::ffi::OsString::from("--mount-proc=");
  proc_mount.push(rootfs.join("proc"));

  let mut cmd = Command::new("unshare");
  cmd
    .args(["--mount", "--uts", "--ipc", "--pid", "--fork", "--kill-child"])
    .arg(proc_mount)
    .arg("chroot")
    .arg(rootfs)
    .args(command)
    .env_clear()
    .env("PATH", DEFAULT_PATH)
    .env("HOME", "/root")
    .env("TERM", std::env::var("TERM").unwrap_or_else(|_| "xterm".to_string()));

  for (key, value) in env {
    cmd.env(key, value);
  }
  cmd
}

/// Unpack a plain or gzip-compressed tarball into `dest`.
fn unpack_tarball(tarball: &Path, dest: &Path) -> io::Result<()> {
  let mut reader = BufReader::new(File::open(tarball)?);
  let gzipped = reader.fill_buf()?.starts_with(&[0x1f, 0x8b]);

  let source: Box<dyn io::Read> = if gzipped {
    Box::new(GzDecoder::new(reader))
  } else {
    Box::new(reader)
  };

  let mut archive = tar::Archive::new(source);
  archive.set_preserve_permissions(true);
  archive.set_preserve_ownerships(is_elevated());
  archive.set_unpack_xattrs(true);
  archive.set_overwrite(true);
  archive.unpack(dest)
}

#[async_trait]
impl ExecutionBackend for NativeBackend {
  fn name(&self) -> &'static str {
    NAME
  }

  async fn image_exists(&self, image: &ImageRef) -> Result<bool, BackendError> {
    Ok(self.store.read_image(image)?.is_some())
  }

  async fn import_image(&self, image: &ImageRef, tarball: &Path) -> Result<(), BackendError> {
    info!(image = %image, tarball = ?tarball, "importing image");
    let (layer, path) = self.store.create_layer()?;

    let source = tarball.to_path_buf();
    let dest = path.clone();
    let unpacked = tokio::task::spawn_blocking(move || unpack_tarball(&source, &dest))
      .await
      .map_err(io::Error::other)
      .and_then(|r| r);

    if let Err(e) = unpacked {
      if let Err(cleanup) = fs::remove_dir_all(&path) {
        warn!(layer = %layer, error = %cleanup, "failed to remove partial layer");
      }
      return Err(e.into());
    }

    self.store.write_image(&ImageRecord {
      reference: image.clone(),
      layers: vec![layer],
      created_at: store::now_unix(),
    })?;
    Ok(())
  }

  async fn start(&self, config: &SessionConfig) -> Result<SessionHandle, BackendError> {
    self.require_root()?;

    let lease = self.acquire_lease().await?;
    let key = SnapshotKey::generate();

    let mounted = match self.create_snapshot(&lease, &key, &config.image).await {
      Ok(()) => self.snapshot_record(&key).and_then(|record| self.mount_snapshot(&record, &config.mounts)),
      Err(e) => Err(e),
    };

    let mounts = match mounted {
      Ok(mounts) => mounts,
      Err(e) => {
        if self.store.snapshot_dir(&key).exists()
          && let Err(cleanup) = self.delete_snapshot(&key).await
        {
          warn!(key = %key, error = %cleanup, "failed to remove snapshot after failed start");
        }
        if let Err(cleanup) = self.release_lease(&lease).await {
          warn!(lease = %lease.id, error = %cleanup, "failed to release lease after failed start");
        }
        return Err(e);
      }
    };

    let id = key.to_string();
    info!(session = %id, image = %config.image, "session started");
    self.sessions().insert(
      id.clone(),
      NativeSession {
        key,
        lease,
        env: config.env.clone(),
        mounts,
      },
    );

    Ok(SessionHandle {
      id,
      image: config.image.clone(),
    })
  }

  async fn exec(&self, handle: &SessionHandle, command: &[String]) -> Result<i32, BackendError> {
    let cmd = {
      let sessions = self.sessions();
      let session = sessions
        .get(&handle.id)
        .ok_or_else(|| BackendError::SessionNotFound(handle.id.clone()))?;
      isolated_command(&session.mounts.rootfs, &session.env, command)
    };
    process::passthrough(cmd).await
  }

  async fn commit(&self, handle: &SessionHandle, image: &ImageRef) -> Result<(), BackendError> {
    let (key, created) = {
      let sessions = self.sessions();
      let session = sessions
        .get(&handle.id)
        .ok_or_else(|| BackendError::SessionNotFound(handle.id.clone()))?;
      (session.key.clone(), session.mounts.created.clone())
    };
    let record = self.snapshot_record(&key)?;

    let (layer, path) = self.store.create_layer()?;
    let mut copy = Command::new("cp");
    copy.arg("-a").arg(self.store.upper_dir(&key).join(".")).arg(&path);
    if let Err(e) = process::capture(copy).await {
      if let Err(cleanup) = fs::remove_dir_all(&path) {
        warn!(layer = %layer, error = %cleanup, "failed to remove partial layer");
      }
      return Err(e);
    }

    // Mount points this backend created are not part of the image; non-empty ones stay.
    for dir in created.iter().rev() {
      let _ = fs::remove_dir(path.join(dir));
    }

    let mut layers = record.layers;
    layers.push(layer);
    self.store.write_image(&ImageRecord {
      reference: image.clone(),
      layers,
      created_at: store::now_unix(),
    })?;

    info!(session = %handle.id, image = %image, "committed");
    Ok(())
  }

  async fn tag(&self, source: &ImageRef, target: &ImageRef) -> Result<(), BackendError> {
    let record = self
      .store
      .read_image(source)?
      .ok_or_else(|| BackendError::ImageNotFound(source.clone()))?;

    self.store.write_image(&ImageRecord {
      reference: target.clone(),
      layers: record.layers,
      created_at: store::now_unix(),
    })?;
    debug!(source = %source, target = %target, "tagged");
    Ok(())
  }

  async fn destroy(&self, handle: &SessionHandle) -> Result<(), BackendError> {
    let mut session = self
      .sessions()
      .remove(&handle.id)
      .ok_or_else(|| BackendError::SessionNotFound(handle.id.clone()))?;

    let unmounted = session.mounts.unmount_all();
    let deleted = match &unmounted {
      Ok(()) => self.delete_snapshot(&session.key).await,
      // Never delete through a tree that may still be mounted.
      Err(_) => Ok(()),
    };
    let released = self.release_lease(&session.lease).await;

    debug!(session = %handle.id, "session destroyed");
    unmounted.and(deleted).and(released)
  }
}

#[async_trait]
impl SnapshotBackend for NativeBackend {
  async fn acquire_lease(&self) -> Result<Lease, BackendError> {
    let lease = Lease::generate();
    self.store.write_lease(&lease)?;
    debug!(lease = %lease.id, "lease acquired");
    Ok(lease)
  }

  async fn release_lease(&self, lease: &Lease) -> Result<(), BackendError> {
    if !self.store.remove_lease(&lease.id)? {
      return Err(BackendError::LeaseNotFound(lease.id.clone()));
    }
    debug!(lease = %lease.id, "lease released");
    Ok(())
  }

  async fn create_snapshot(&self, lease: &Lease, key: &SnapshotKey, image: &ImageRef) -> Result<(), BackendError> {
    if !self.store.lease_exists(&lease.id) {
      return Err(BackendError::LeaseNotFound(lease.id.clone()));
    }
    let record = self
      .store
      .read_image(image)?
      .ok_or_else(|| BackendError::ImageNotFound(image.clone()))?;

    self.store.create_snapshot(&SnapshotRecord {
      key: key.clone(),
      image: image.clone(),
      layers: record.layers,
      lease: lease.id.clone(),
      created_at: store::now_unix(),
    })?;
    debug!(key = %key, image = %image, lease = %lease.id, "snapshot created");
    Ok(())
  }

  async fn run_in_snapshot(&self, key: &SnapshotKey, command: &[String]) -> Result<i32, BackendError> {
    self.require_root()?;
    let record = self.snapshot_record(key)?;
    let mut mounts = self.mount_snapshot(&record, &[])?;

    let outcome = process::passthrough(isolated_command(&mounts.rootfs, &BTreeMap::new(), command)).await;

    match (outcome, mounts.unmount_all()) {
      (Ok(code), Ok(())) => Ok(code),
      (Ok(_), Err(e)) => Err(e),
      (Err(e), Ok(())) => Err(e),
      (Err(e), Err(cleanup)) => {
        warn!(key = %key, error = %cleanup, "failed to unmount snapshot after error");
        Err(e)
      }
    }
  }

  async fn mounts(&self, key: &SnapshotKey) -> Result<Vec<Mount>, BackendError> {
    self.snapshot_record(key)?;
    Ok(vec![Mount::bind(self.store.upper_dir(key), true)])
  }

  async fn delete_snapshot(&self, key: &SnapshotKey) -> Result<(), BackendError> {
    let dir = self.store.snapshot_dir(key);
    if !dir.is_dir() {
      return Err(BackendError::SnapshotNotFound(key.clone()));
    }

    let rootfs = self.store.rootfs_dir(key);
    if rootfs.exists() && mount::is_mount_point(&rootfs)? {
      return Err(BackendError::Io(io::Error::other(format!(
        "snapshot {} is still mounted at {}",
        key,
        rootfs.display()
      ))));
    }

    self.store.remove_snapshot(key)?;
    debug!(key = %key, "snapshot deleted");
    Ok(())
  }
}
