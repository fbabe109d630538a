//! Types for build orchestration.
//!
//! This module defines the options a build run takes, the step an image's
//! build failed at, and the report a run produces.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use crate::backend::BackendError;
use crate::image::{DefinitionError, ImageRef, ReferenceError};
use crate::session::{SessionError, Step};

/// Per-run build settings.
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
  /// Namespace prepended to every managed image name (e.g. `registry/team-`).
  pub prefix: String,
  /// Extra tags applied to each committed image.
  pub tags: Vec<String>,
  /// Environment variables injected into every build session.
  pub env: BTreeMap<String, String>,
  /// Host directory mounted at `/packages`, created if absent.
  pub package_cache: Option<PathBuf>,
  /// Rebuild ancestors of the target even when they are already in the store.
  pub rebuild_parents: bool,
}

/// Where in an image's build a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStep {
  Start,
  /// The image's build script.
  Script,
  Commit,
  Tag,
  /// Destroying the build session.
  Teardown,
}

impl From<Step> for BuildStep {
  fn from(step: Step) -> Self {
    match step {
      Step::Start => BuildStep::Start,
      Step::Run => BuildStep::Script,
      Step::Commit => BuildStep::Commit,
      Step::Tag => BuildStep::Tag,
      Step::Destroy => BuildStep::Teardown,
    }
  }
}

impl fmt::Display for BuildStep {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      BuildStep::Start => "start",
      BuildStep::Script => "build script",
      BuildStep::Commit => "commit",
      BuildStep::Tag => "tagging",
      BuildStep::Teardown => "teardown",
    };
    write!(f, "{}", name)
  }
}

/// Errors that can occur while planning or running builds.
#[derive(Debug, Error)]
pub enum BuildError {
  #[error(transparent)]
  Definition(#[from] DefinitionError),

  /// A prefixed name or tag does not form a valid image reference.
  #[error("invalid image reference '{value}': {source}")]
  InvalidReference {
    value: String,
    #[source]
    source: ReferenceError,
  },

  /// A host directory needed by the build could not be prepared.
  #[error("failed to prepare {}: {source}", path.display())]
  Prepare {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  /// Asking the backend whether an image exists failed.
  #[error("failed to look up {image}: {source}")]
  Lookup {
    image: ImageRef,
    #[source]
    source: BackendError,
  },

  #[error("build cancelled while planning")]
  Cancelled,

  /// One image's session failed.
  #[error("image {image} failed at {step}: {source}")]
  Step {
    image: String,
    step: BuildStep,
    #[source]
    source: SessionError,
    /// Teardown error reported alongside the primary failure.
    cleanup: Option<SessionError>,
  },
}

impl BuildError {
  /// The build step, for failures that happened inside a session.
  pub fn step(&self) -> Option<BuildStep> {
    match self {
      BuildError::Step { step, .. } => Some(*step),
      _ => None,
    }
  }
}

/// An image that was not attempted because an earlier image in the run failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedImage {
  pub name: String,
  /// The image whose failure stopped the run. Every image still planned
  /// after a failure is listed, whether or not it inherits from it.
  pub blocked_by: String,
}

/// Outcome of a build run.
///
/// Execution halts at the first failure, so at most one image fails.
#[derive(Debug, Default)]
pub struct BuildReport {
  /// Images built and committed, in build order.
  pub built: Vec<ImageRef>,
  /// Ancestors already present in the store and not rebuilt.
  pub reused: Vec<ImageRef>,
  /// The image that failed and why.
  pub failed: Option<(String, BuildError)>,
  /// Planned images skipped after the failure.
  pub skipped: Vec<SkippedImage>,
}

impl BuildReport {
  pub fn is_success(&self) -> bool {
    self.failed.is_none()
  }
}
