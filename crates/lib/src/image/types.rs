//! Types for image definitions and their validation errors.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::reference::{ImageRef, ReferenceError};
use crate::consts::EXTERNAL_PREFIX;

/// What an image is layered on top of.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parent {
  /// Another image in the same definition store, by name.
  Image(String),
  /// A base image outside the managed tree (`external:<ref>`).
  External(ImageRef),
}

impl Parent {
  /// Parse an `inherits` value.
  pub fn parse(value: &str) -> Result<Self, ReferenceError> {
    match value.strip_prefix(EXTERNAL_PREFIX) {
      Some(reference) => Ok(Parent::External(ImageRef::parse(reference)?)),
      None => Ok(Parent::Image(value.to_string())),
    }
  }

  pub fn is_external(&self) -> bool {
    matches!(self, Parent::External(_))
  }
}

impl fmt::Display for Parent {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Parent::Image(name) => write!(f, "{}", name),
      Parent::External(reference) => write!(f, "{}{}", EXTERNAL_PREFIX, reference),
    }
  }
}

/// One image to be built, read from `<images_dir>/<name>/config.json`.
///
/// Immutable once loaded and rebuilt from disk on every invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageDefinition {
  /// Unique identifier, the directory name.
  pub name: String,
  /// Absolute path of this image's directory.
  pub image_dir: PathBuf,
  /// Absolute path of the directory holding every image definition.
  pub images_dir: PathBuf,
  /// The declared parent.
  pub inherits: Parent,
}

/// On-disk manifest shape.
#[derive(Debug, Deserialize)]
pub(crate) struct ImageManifest {
  pub inherits: Option<String>,
}

/// Errors raised while loading or validating image definitions.
#[derive(Debug, Error)]
pub enum DefinitionError {
  /// The images directory, an image directory, or its manifest is missing.
  #[error("not found: {}", path.display())]
  NotFound { path: PathBuf },

  /// The manifest is malformed or lacks an inheritance declaration.
  #[error("invalid definition for image {name}: {reason}")]
  InvalidDefinition { name: String, reason: String },

  /// `inherits` names an image that is neither defined nor external.
  #[error("image {image} inherits from {parent}, which doesn't exist")]
  UnresolvedParent { image: String, parent: String },

  /// Walking the inheritance chain came back to an image already visited.
  #[error("image {image} has a cyclic dependency")]
  CyclicDependency { image: String },

  /// The requested image is not in the definition set.
  #[error("unknown image: {0}")]
  UnknownImage(String),

  #[error("io error reading {}: {source}", path.display())]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
}
