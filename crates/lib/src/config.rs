//! Runtime configuration resolved from the environment.
//!
//! The CLI layers its flags on top of [`Config::from_env`].

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::platform::paths::store_dir;

pub const BACKEND_ENV: &str = "STRATUM_BACKEND";
pub const DOCKER_ENV: &str = "STRATUM_DOCKER";
pub const IMAGES_ENV: &str = "STRATUM_IMAGES";
pub const PREFIX_ENV: &str = "STRATUM_PREFIX";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
  #[error("unknown backend '{0}' (expected 'docker' or 'native')")]
  UnknownBackend(String),
}

/// Which execution backend drives sessions and snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
  /// An external container daemon driven through its CLI.
  #[default]
  Docker,
  /// The built-in snapshot/lease runtime over a local store.
  Native,
}

impl FromStr for BackendKind {
  type Err = ConfigError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_ascii_lowercase().as_str() {
      "docker" => Ok(BackendKind::Docker),
      "native" => Ok(BackendKind::Native),
      _ => Err(ConfigError::UnknownBackend(s.to_string())),
    }
  }
}

impl fmt::Display for BackendKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      BackendKind::Docker => write!(f, "docker"),
      BackendKind::Native => write!(f, "native"),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
  pub backend: BackendKind,
  /// Container CLI binary for the docker backend.
  pub docker: String,
  /// Root of the native backend's store.
  pub store: PathBuf,
  /// Directory holding the image definitions.
  pub images_dir: PathBuf,
  /// Namespace prefixed to every managed image's committed reference.
  pub prefix: String,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      backend: BackendKind::default(),
      docker: "docker".to_string(),
      store: store_dir(),
      images_dir: PathBuf::from("images"),
      prefix: String::new(),
    }
  }
}

fn non_empty_var(name: &str) -> Option<String> {
  std::env::var(name).ok().filter(|v| !v.is_empty())
}

impl Config {
  /// Defaults overridden by any `STRATUM_*` variables that are set.
  pub fn from_env() -> Result<Self, ConfigError> {
    let mut config = Config::default();

    if let Some(backend) = non_empty_var(BACKEND_ENV) {
      config.backend = backend.parse()?;
    }
    if let Some(docker) = non_empty_var(DOCKER_ENV) {
      config.docker = docker;
    }
    if let Some(images) = non_empty_var(IMAGES_ENV) {
      config.images_dir = PathBuf::from(images);
    }
    if let Some(prefix) = non_empty_var(PREFIX_ENV) {
      config.prefix = prefix;
    }

    Ok(config)
  }
}
