//! Test utilities for stratum-lib.
//!
//! [`FakeBackend`] implements both backend traits in memory, records every
//! call in order, fails on demand, and can be slowed down per operation. Snapshot upper layers are real
//! directories under a temp dir so extraction can walk them.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use crate::backend::{
  BackendError, ExecutionBackend, Lease, SessionConfig, SessionHandle, SnapshotBackend, SnapshotKey,
};
use crate::image::ImageRef;
use crate::mount::Mount;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
  ImageExists,
  Import,
  Start,
  Exec,
  Commit,
  Tag,
  Destroy,
  AcquireLease,
  ReleaseLease,
  CreateSnapshot,
  RunInSnapshot,
  Mounts,
  DeleteSnapshot,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
  ImageExists(ImageRef),
  Import(ImageRef),
  Start { session: String, image: ImageRef },
  Exec { session: String, command: Vec<String> },
  Commit { session: String, image: ImageRef },
  Tag { source: ImageRef, target: ImageRef },
  Destroy { session: String },
  AcquireLease(String),
  ReleaseLease(String),
  CreateSnapshot { key: SnapshotKey, image: ImageRef },
  RunInSnapshot { key: SnapshotKey, command: Vec<String> },
  Mounts(SnapshotKey),
  DeleteSnapshot(SnapshotKey),
}

impl Call {
  pub fn op(&self) -> Op {
    match self {
      Call::ImageExists(_) => Op::ImageExists,
      Call::Import(_) => Op::Import,
      Call::Start { .. } => Op::Start,
      Call::Exec { .. } => Op::Exec,
      Call::Commit { .. } => Op::Commit,
      Call::Tag { .. } => Op::Tag,
      Call::Destroy { .. } => Op::Destroy,
      Call::AcquireLease(_) => Op::AcquireLease,
      Call::ReleaseLease(_) => Op::ReleaseLease,
      Call::CreateSnapshot { .. } => Op::CreateSnapshot,
      Call::RunInSnapshot { .. } => Op::RunInSnapshot,
      Call::Mounts(_) => Op::Mounts,
      Call::DeleteSnapshot(_) => Op::DeleteSnapshot,
    }
  }
}

/// Content the export hook "writes" into a snapshot's upper layer.
#[derive(Debug, Clone)]
pub enum Staged {
  File(Vec<u8>),
  Symlink(PathBuf),
  Dir,
}

#[derive(Default)]
struct State {
  calls: Vec<Call>,
  images: BTreeSet<ImageRef>,
  failures: HashSet<Op>,
  delays: HashMap<Op, Duration>,
  exit_codes: Vec<(String, i32)>,
  staged: Vec<(PathBuf, Staged)>,
  configs: Vec<SessionConfig>,
  sessions: HashMap<String, ImageRef>,
  snapshots: HashMap<SnapshotKey, PathBuf>,
  leases: HashSet<String>,
  next_id: u64,
}

pub struct FakeBackend {
  state: Mutex<State>,
  root: TempDir,
}

impl Default for FakeBackend {
  fn default() -> Self {
    Self::new()
  }
}

impl FakeBackend {
  pub fn new() -> Self {
    Self {
      state: Mutex::new(State::default()),
      root: TempDir::new().unwrap(),
    }
  }

  /// A backend whose store already holds `images`.
  pub fn with_images(images: &[&str]) -> Self {
    let backend = Self::new();
    for image in images {
      backend.add_image(image);
    }
    backend
  }

  pub fn add_image(&self, image: &str) {
    self.state().images.insert(ImageRef::parse(image).unwrap());
  }

  /// Make every call to `op` fail.
  pub fn fail(&self, op: Op) {
    self.state().failures.insert(op);
  }

  /// Make every call to `op` take `delay` after its effect has landed.
  pub fn delay(&self, op: Op, delay: Duration) {
    self.state().delays.insert(op, delay);
  }

  /// Commands whose joined form contains `needle` exit with `code`.
  pub fn exit_with(&self, needle: &str, code: i32) {
    self.state().exit_codes.push((needle.to_string(), code));
  }

  /// Have `run_in_snapshot` create `path` (relative to the upper layer).
  pub fn stage(&self, path: &str, entry: Staged) {
    self.state().staged.push((PathBuf::from(path), entry));
  }

  pub fn calls(&self) -> Vec<Call> {
    self.state().calls.clone()
  }

  pub fn count(&self, op: Op) -> usize {
    self.state().calls.iter().filter(|c| c.op() == op).count()
  }

  pub fn has_image(&self, image: &ImageRef) -> bool {
    self.state().images.contains(image)
  }

  pub fn started_configs(&self) -> Vec<SessionConfig> {
    self.state().configs.clone()
  }

  pub fn live_sessions(&self) -> usize {
    self.state().sessions.len()
  }

  pub fn live_snapshots(&self) -> usize {
    self.state().snapshots.len()
  }

  pub fn held_leases(&self) -> usize {
    self.state().leases.len()
  }

  fn state(&self) -> std::sync::MutexGuard<'_, State> {
    self.state.lock().unwrap()
  }

  /// Record `call` and fail it if `op` was marked failing.
  fn record(&self, call: Call) -> Result<(), BackendError> {
    let mut state = self.state();
    let op = call.op();
    state.calls.push(call);
    if state.failures.contains(&op) {
      return Err(BackendError::InvalidResponse(format!("injected {:?} failure", op)));
    }
    Ok(())
  }

  async fn pause(&self, op: Op) {
    let delay = self.state().delays.get(&op).copied();
    if let Some(delay) = delay {
      tokio::time::sleep(delay).await;
    }
  }

  fn next_id(&self, prefix: &str) -> String {
    let mut state = self.state();
    state.next_id += 1;
    format!("{}-{}", prefix, state.next_id)
  }

  fn exit_code(&self, command: &[String]) -> i32 {
    let line = command.join(" ");
    self
      .state()
      .exit_codes
      .iter()
      .find(|(needle, _)| line.contains(needle.as_str()))
      .map(|(_, code)| *code)
      .unwrap_or(0)
  }

  fn require_image(&self, image: &ImageRef) -> Result<(), BackendError> {
    if self.state().images.contains(image) {
      Ok(())
    } else {
      Err(BackendError::ImageNotFound(image.clone()))
    }
  }
}

fn write_staged(upper: &Path, staged: &[(PathBuf, Staged)]) {
  for (path, entry) in staged {
    let target = upper.join(path);
    if let Some(parent) = target.parent() {
      fs::create_dir_all(parent).unwrap();
    }
    match entry {
      Staged::File(content) => fs::write(&target, content).unwrap(),
      Staged::Symlink(dest) => {
        let _ = fs::remove_file(&target);
        std::os::unix::fs::symlink(dest, &target).unwrap();
      }
      Staged::Dir => fs::create_dir_all(&target).unwrap(),
    }
  }
}

#[async_trait]
impl ExecutionBackend for FakeBackend {
  fn name(&self) -> &'static str {
    "fake"
  }

  async fn image_exists(&self, image: &ImageRef) -> Result<bool, BackendError> {
    self.record(Call::ImageExists(image.clone()))?;
    Ok(self.has_image(image))
  }

  async fn import_image(&self, image: &ImageRef, _tarball: &Path) -> Result<(), BackendError> {
    self.record(Call::Import(image.clone()))?;
    self.state().images.insert(image.clone());
    Ok(())
  }

  async fn start(&self, config: &SessionConfig) -> Result<SessionHandle, BackendError> {
    let session = self.next_id("session");
    self.record(Call::Start {
      session: session.clone(),
      image: config.image.clone(),
    })?;
    self.require_image(&config.image)?;

    {
      let mut state = self.state();
      state.configs.push(config.clone());
      state.sessions.insert(session.clone(), config.image.clone());
    }
    self.pause(Op::Start).await;
    Ok(SessionHandle {
      id: session,
      image: config.image.clone(),
    })
  }

  async fn exec(&self, handle: &SessionHandle, command: &[String]) -> Result<i32, BackendError> {
    self.record(Call::Exec {
      session: handle.id.clone(),
      command: command.to_vec(),
    })?;
    Ok(self.exit_code(command))
  }

  async fn commit(&self, handle: &SessionHandle, image: &ImageRef) -> Result<(), BackendError> {
    self.record(Call::Commit {
      session: handle.id.clone(),
      image: image.clone(),
    })?;
    self.state().images.insert(image.clone());
    Ok(())
  }

  async fn tag(&self, source: &ImageRef, target: &ImageRef) -> Result<(), BackendError> {
    self.record(Call::Tag {
      source: source.clone(),
      target: target.clone(),
    })?;
    self.require_image(source)?;
    self.state().images.insert(target.clone());
    Ok(())
  }

  async fn destroy(&self, handle: &SessionHandle) -> Result<(), BackendError> {
    self.state().sessions.remove(&handle.id);
    self.record(Call::Destroy {
      session: handle.id.clone(),
    })
  }
}

#[async_trait]
impl SnapshotBackend for FakeBackend {
  async fn acquire_lease(&self) -> Result<Lease, BackendError> {
    let id = self.next_id("lease");
    self.record(Call::AcquireLease(id.clone()))?;
    self.state().leases.insert(id.clone());
    self.pause(Op::AcquireLease).await;
    Ok(Lease { id })
  }

  async fn release_lease(&self, lease: &Lease) -> Result<(), BackendError> {
    self.state().leases.remove(&lease.id);
    self.record(Call::ReleaseLease(lease.id.clone()))
  }

  async fn create_snapshot(&self, _lease: &Lease, key: &SnapshotKey, image: &ImageRef) -> Result<(), BackendError> {
    self.record(Call::CreateSnapshot {
      key: key.clone(),
      image: image.clone(),
    })?;
    self.require_image(image)?;

    let upper = self.root.path().join("snapshots").join(key.as_str());
    fs::create_dir_all(&upper)?;
    self.state().snapshots.insert(key.clone(), upper);
    self.pause(Op::CreateSnapshot).await;
    Ok(())
  }

  async fn run_in_snapshot(&self, key: &SnapshotKey, command: &[String]) -> Result<i32, BackendError> {
    self.record(Call::RunInSnapshot {
      key: key.clone(),
      command: command.to_vec(),
    })?;

    let (upper, staged) = {
      let state = self.state();
      let upper = state
        .snapshots
        .get(key)
        .cloned()
        .ok_or_else(|| BackendError::SnapshotNotFound(key.clone()))?;
      (upper, state.staged.clone())
    };
    write_staged(&upper, &staged);
    Ok(self.exit_code(command))
  }

  async fn mounts(&self, key: &SnapshotKey) -> Result<Vec<Mount>, BackendError> {
    self.record(Call::Mounts(key.clone()))?;
    let upper = self
      .state()
      .snapshots
      .get(key)
      .cloned()
      .ok_or_else(|| BackendError::SnapshotNotFound(key.clone()))?;
    Ok(vec![Mount::bind(upper, true)])
  }

  async fn delete_snapshot(&self, key: &SnapshotKey) -> Result<(), BackendError> {
    let upper = self.state().snapshots.remove(key);
    if let Some(upper) = upper {
      let _ = fs::remove_dir_all(upper);
    }
    self.record(Call::DeleteSnapshot(key.clone()))
  }
}
