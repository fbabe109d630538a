//! Image references (`name[:tag]`) addressing content in the backing store.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReferenceError {
  #[error("image reference is empty")]
  Empty,

  #[error("image reference '{0}' contains whitespace")]
  Whitespace(String),

  #[error("image reference '{0}' has an empty name")]
  EmptyName(String),

  #[error("image reference '{0}' has an empty tag")]
  EmptyTag(String),

  #[error("'{0}' is not a valid image tag")]
  InvalidTag(String),
}

/// A fully-qualified image name plus an optional tag.
///
/// Two references with the same name and different tags address distinct artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ImageRef {
  name: String,
  tag: Option<String>,
}

impl ImageRef {
  /// Parse `name[:tag]`.
  ///
  /// Only a `:` after the last `/` introduces a tag, so registry ports
  /// (`registry:5000/os/base`) stay part of the name.
  pub fn parse(s: &str) -> Result<Self, ReferenceError> {
    if s.is_empty() {
      return Err(ReferenceError::Empty);
    }
    if s.chars().any(char::is_whitespace) {
      return Err(ReferenceError::Whitespace(s.to_string()));
    }

    let last_segment_start = s.rfind('/').map(|i| i + 1).unwrap_or(0);
    let (name, tag) = match s[last_segment_start..].rfind(':') {
      Some(pos) => {
        let split = last_segment_start + pos;
        (&s[..split], Some(&s[split + 1..]))
      }
      None => (s, None),
    };

    if name.is_empty() || name.ends_with('/') {
      return Err(ReferenceError::EmptyName(s.to_string()));
    }
    if tag.is_some_and(str::is_empty) {
      return Err(ReferenceError::EmptyTag(s.to_string()));
    }

    Ok(Self {
      name: name.to_string(),
      tag: tag.map(str::to_string),
    })
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn tag(&self) -> Option<&str> {
    self.tag.as_deref()
  }

  /// The same name with `tag` in place of any existing tag.
  pub fn tagged(&self, tag: &str) -> Result<Self, ReferenceError> {
    if tag.is_empty() {
      return Err(ReferenceError::EmptyTag(format!("{}:", self.name)));
    }
    if tag.contains([':', '/']) || tag.chars().any(char::is_whitespace) {
      return Err(ReferenceError::InvalidTag(tag.to_string()));
    }
    Ok(Self {
      name: self.name.clone(),
      tag: Some(tag.to_string()),
    })
  }

  /// `name` or `name:tag`, the form handed to backends.
  pub fn full_name(&self) -> String {
    self.to_string()
  }
}

impl fmt::Display for ImageRef {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.tag {
      Some(tag) => write!(f, "{}:{}", self.name, tag),
      None => write!(f, "{}", self.name),
    }
  }
}

impl FromStr for ImageRef {
  type Err = ReferenceError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Self::parse(s)
  }
}
