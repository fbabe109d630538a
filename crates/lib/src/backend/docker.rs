//! Backend driving an external container daemon through its CLI.
//!
//! Sessions are detached privileged containers kept alive by `sleep infinity`;
//! commands run in them with `exec`. Because the keep-alive replaces the
//! parent's entrypoint, the parent's `Entrypoint`/`Cmd` are read up front and
//! restored on commit. Session environment variables are passed to each
//! `exec` rather than to `run`, so a commit never bakes them into the image.
//! Snapshots are created containers whose overlay2 upper
//! directory is exposed read-only. Leases are bookkeeping only: a container
//! pins its image for as long as it exists.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::process;
use super::types::{BackendError, Lease, SessionConfig, SessionHandle, SnapshotKey};
use super::{ExecutionBackend, SnapshotBackend};
use crate::image::ImageRef;
use crate::mount::Mount;

const NAME: &str = "docker";

/// The parts of an image's config a keep-alive container overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ImageConfig {
  #[serde(rename = "Entrypoint", default)]
  pub entrypoint: Option<Vec<String>>,
  #[serde(rename = "Cmd", default)]
  pub cmd: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct GraphDriver {
  #[serde(rename = "Name")]
  name: String,
  #[serde(rename = "Data", default)]
  data: Option<HashMap<String, String>>,
}

#[derive(Debug)]
struct LiveSession {
  parent: ImageConfig,
  env: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct State {
  /// Session container name to what its commands and commit need.
  sessions: HashMap<String, LiveSession>,
  /// Snapshot key to (container name, lease id).
  snapshots: HashMap<SnapshotKey, (String, String)>,
  leases: HashSet<String>,
}

pub struct DockerBackend {
  program: String,
  state: Mutex<State>,
}

impl DockerBackend {
  pub fn new(program: impl Into<String>) -> Self {
    Self {
      program: program.into(),
      state: Mutex::new(State::default()),
    }
  }

  /// Create the backend after checking the daemon answers.
  pub async fn connect(program: &str) -> Result<Self, BackendError> {
    let backend = Self::new(program);
    let version = process::capture(backend.command(["version", "--format", "{{.Server.Version}}"]))
      .await
      .map_err(|e| BackendError::Unavailable {
        backend: NAME,
        message: e.to_string(),
      })?;
    debug!(program = %program, version = %version, "container daemon reachable");
    Ok(backend)
  }

  fn command<I, S>(&self, args: I) -> Command
  where
    I: IntoIterator<Item = S>,
    S: AsRef<std::ffi::OsStr>,
  {
    let mut command = Command::new(&self.program);
    command.args(args);
    command
  }

  fn state(&self) -> std::sync::MutexGuard<'_, State> {
    self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  /// Pull `image` if the daemon does not have it yet.
  async fn ensure_image(&self, image: &ImageRef) -> Result<(), BackendError> {
    if self.image_exists(image).await? {
      return Ok(());
    }
    info!(image = %image, "pulling image");
    process::checked(self.command(["pull", image.full_name().as_str()]))
      .await
      .map_err(|_| BackendError::ImageNotFound(image.clone()))
  }

  async fn image_config(&self, image: &ImageRef) -> Result<ImageConfig, BackendError> {
    let json = process::capture(self.command(["image", "inspect", "--format", "{{json .Config}}", image.full_name().as_str()]))
      .await?;
    parse_image_config(&json)
  }

  async fn upper_dir(&self, container: &str) -> Result<PathBuf, BackendError> {
    let json = process::capture(self.command(["container", "inspect", "--format", "{{json .GraphDriver}}", container]))
      .await?;
    parse_upper_dir(&json)
  }

  async fn remove_container(&self, container: &str) -> Result<(), BackendError> {
    process::capture(self.command(["rm", "--force", container])).await.map(|_| ())
  }

  fn exec_command(&self, container: &str, env: &BTreeMap<String, String>, command: &[String]) -> Command {
    self.command(exec_args(container, env, std::io::stdin().is_terminal(), command))
  }
}

fn parse_image_config(json: &str) -> Result<ImageConfig, BackendError> {
  let trimmed = json.trim();
  if trimmed.is_empty() || trimmed == "null" {
    return Ok(ImageConfig::default());
  }
  serde_json::from_str(trimmed).map_err(|e| BackendError::InvalidResponse(format!("image config: {}", e)))
}

fn parse_upper_dir(json: &str) -> Result<PathBuf, BackendError> {
  let driver: GraphDriver =
    serde_json::from_str(json.trim()).map_err(|e| BackendError::InvalidResponse(format!("graph driver: {}", e)))?;

  driver
    .data
    .as_ref()
    .and_then(|data| data.get("UpperDir"))
    .map(PathBuf::from)
    .ok_or_else(|| {
      BackendError::InvalidResponse(format!(
        "storage driver '{}' does not expose an upper directory",
        driver.name
      ))
    })
}

/// Container name safe for the daemon: `[a-zA-Z0-9_.-]` only.
fn container_name(kind: &str, label: &str, id: &str) -> String {
  let label: String = label
    .chars()
    .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') { c } else { '-' })
    .collect();
  format!("stratum-{}-{}-{}", kind, label, id)
}

/// Arguments for a detached keep-alive container.
fn run_args(name: &str, config: &SessionConfig) -> Vec<String> {
  let mut args: Vec<String> = ["run", "-d", "--privileged", "--network", "host", "--name", name]
    .into_iter()
    .map(String::from)
    .collect();

  for mount in &config.mounts {
    let mut volume = format!("{}:{}", mount.source.display(), mount.target.display());
    if mount.read_only {
      volume.push_str(":ro");
    }
    args.push("-v".to_string());
    args.push(volume);
  }

  args.extend(["--entrypoint", "sleep"].map(String::from));
  args.push(config.image.full_name());
  args.push("infinity".to_string());
  args
}

/// Arguments for running `command` in `container` with the session's environment.
fn exec_args(container: &str, env: &BTreeMap<String, String>, interactive: bool, command: &[String]) -> Vec<String> {
  let mut args = vec!["exec".to_string(), "--privileged".to_string()];
  if interactive {
    args.push("-i".to_string());
  }
  for (key, value) in env {
    args.push("-e".to_string());
    args.push(format!("{}={}", key, value));
  }
  args.push(container.to_string());
  args.extend(command.iter().cloned());
  args
}

/// Arguments for committing `container` as `image`, restoring the parent's entrypoint and command.
fn commit_args(container: &str, image: &ImageRef, parent: &ImageConfig) -> Vec<String> {
  let render = |values: &Option<Vec<String>>| serde_json::to_string(values.as_deref().unwrap_or(&[])).unwrap_or_default();

  vec![
    "commit".to_string(),
    "--change".to_string(),
    format!("ENTRYPOINT {}", render(&parent.entrypoint)),
    "--change".to_string(),
    format!("CMD {}", render(&parent.cmd)),
    container.to_string(),
    image.full_name(),
  ]
}

#[async_trait]
impl ExecutionBackend for DockerBackend {
  fn name(&self) -> &'static str {
    NAME
  }

  async fn image_exists(&self, image: &ImageRef) -> Result<bool, BackendError> {
    match process::capture(self.command(["image", "inspect", "--format", "{{.Id}}", image.full_name().as_str()])).await {
      Ok(_) => Ok(true),
      Err(BackendError::CommandFailed { .. }) => Ok(false),
      Err(e) => Err(e),
    }
  }

  async fn import_image(&self, image: &ImageRef, tarball: &Path) -> Result<(), BackendError> {
    info!(image = %image, tarball = ?tarball, "importing image");
    let mut command = self.command(["import"]);
    command.arg(tarball).arg(image.full_name());
    process::capture(command).await.map(|_| ())
  }

  async fn start(&self, config: &SessionConfig) -> Result<SessionHandle, BackendError> {
    self.ensure_image(&config.image).await?;
    let parent = self.image_config(&config.image).await?;

    let id = uuid::Uuid::new_v4().simple().to_string();
    let name = container_name("build", &config.label, &id[..12]);

    process::capture(self.command(run_args(&name, config))).await?;
    info!(container = %name, image = %config.image, "session started");

    self.state().sessions.insert(
      name.clone(),
      LiveSession {
        parent,
        env: config.env.clone(),
      },
    );
    Ok(SessionHandle {
      id: name,
      image: config.image.clone(),
    })
  }

  async fn exec(&self, handle: &SessionHandle, command: &[String]) -> Result<i32, BackendError> {
    let env = self
      .state()
      .sessions
      .get(&handle.id)
      .map(|session| session.env.clone())
      .ok_or_else(|| BackendError::SessionNotFound(handle.id.clone()))?;
    process::passthrough(self.exec_command(&handle.id, &env, command)).await
  }

  async fn commit(&self, handle: &SessionHandle, image: &ImageRef) -> Result<(), BackendError> {
    let parent = self
      .state()
      .sessions
      .get(&handle.id)
      .map(|session| session.parent.clone())
      .ok_or_else(|| BackendError::SessionNotFound(handle.id.clone()))?;

    process::capture(self.command(commit_args(&handle.id, image, &parent))).await?;
    info!(container = %handle.id, image = %image, "committed");
    Ok(())
  }

  async fn tag(&self, source: &ImageRef, target: &ImageRef) -> Result<(), BackendError> {
    process::capture(self.command(["tag", source.full_name().as_str(), target.full_name().as_str()])).await?;
    debug!(source = %source, target = %target, "tagged");
    Ok(())
  }

  async fn destroy(&self, handle: &SessionHandle) -> Result<(), BackendError> {
    self.state().sessions.remove(&handle.id);
    self.remove_container(&handle.id).await?;
    debug!(container = %handle.id, "session removed");
    Ok(())
  }
}

#[async_trait]
impl SnapshotBackend for DockerBackend {
  async fn acquire_lease(&self) -> Result<Lease, BackendError> {
    let lease = Lease::generate();
    self.state().leases.insert(lease.id.clone());
    debug!(lease = %lease.id, "lease acquired");
    Ok(lease)
  }

  async fn release_lease(&self, lease: &Lease) -> Result<(), BackendError> {
    if !self.state().leases.remove(&lease.id) {
      return Err(BackendError::LeaseNotFound(lease.id.clone()));
    }
    debug!(lease = %lease.id, "lease released");
    Ok(())
  }

  async fn create_snapshot(&self, lease: &Lease, key: &SnapshotKey, image: &ImageRef) -> Result<(), BackendError> {
    if !self.state().leases.contains(&lease.id) {
      return Err(BackendError::LeaseNotFound(lease.id.clone()));
    }
    self.ensure_image(image).await?;

    let name = container_name("snapshot", image.name(), key.as_str());
    let reference = image.full_name();
    let create = [
      "create",
      "--privileged",
      "--network",
      "host",
      "--name",
      name.as_str(),
      "--entrypoint",
      "sleep",
      reference.as_str(),
      "infinity",
    ];
    process::capture(self.command(create)).await?;

    self.state().snapshots.insert(key.clone(), (name.clone(), lease.id.clone()));

    if let Err(e) = process::capture(self.command(["start", name.as_str()])).await {
      self.state().snapshots.remove(key);
      if let Err(cleanup) = self.remove_container(&name).await {
        warn!(container = %name, error = %cleanup, "failed to remove snapshot container");
      }
      return Err(e);
    }

    debug!(key = %key, container = %name, "snapshot created");
    Ok(())
  }

  async fn run_in_snapshot(&self, key: &SnapshotKey, command: &[String]) -> Result<i32, BackendError> {
    let container = self.snapshot_container(key)?;
    process::passthrough(self.exec_command(&container, &BTreeMap::new(), command)).await
  }

  async fn mounts(&self, key: &SnapshotKey) -> Result<Vec<Mount>, BackendError> {
    let container = self.snapshot_container(key)?;
    let upper = self.upper_dir(&container).await?;
    Ok(vec![Mount::bind(upper, true)])
  }

  async fn delete_snapshot(&self, key: &SnapshotKey) -> Result<(), BackendError> {
    let container = self.snapshot_container(key)?;
    self.remove_container(&container).await?;
    self.state().snapshots.remove(key);
    debug!(key = %key, "snapshot deleted");
    Ok(())
  }
}

impl DockerBackend {
  fn snapshot_container(&self, key: &SnapshotKey) -> Result<String, BackendError> {
    self
      .state()
      .snapshots
      .get(key)
      .map(|(container, _)| container.clone())
      .ok_or_else(|| BackendError::SnapshotNotFound(key.clone()))
  }
}
