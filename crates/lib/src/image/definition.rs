//! The image definition store.
//!
//! Every immediate subdirectory of the images directory is one image. Its
//! `config.json` must declare `inherits`; there is no implicit "no parent".
//!
//! ```text
//! images/
//! ├── base/
//! │   ├── config.json   {"inherits": "external:os/base"}
//! │   └── script
//! └── desktop/
//!     ├── config.json   {"inherits": "base"}
//!     └── script
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::types::{DefinitionError, ImageDefinition, ImageManifest, Parent};
use crate::consts::MANIFEST_FILENAME;
use crate::platform::paths::home_dir;

/// Expand a leading `~` and make the path absolute.
fn resolve_images_dir(images_dir: &Path) -> Result<PathBuf, DefinitionError> {
  let expanded = match images_dir.strip_prefix("~") {
    Ok(rest) => home_dir().join(rest),
    Err(_) => images_dir.to_path_buf(),
  };

  dunce::canonicalize(&expanded).map_err(|source| {
    if source.kind() == io::ErrorKind::NotFound {
      DefinitionError::NotFound { path: expanded.clone() }
    } else {
      DefinitionError::Io { path: expanded.clone(), source }
    }
  })
}

/// Load one image definition from `<images_dir>/<name>`.
pub fn load_definition(name: &str, images_dir: &Path) -> Result<ImageDefinition, DefinitionError> {
  if name.is_empty() {
    return Err(DefinitionError::InvalidDefinition {
      name: name.to_string(),
      reason: "an image name must be provided".to_string(),
    });
  }

  let images_dir = resolve_images_dir(images_dir)?;
  let image_dir = images_dir.join(name);

  if !image_dir.is_dir() {
    return Err(DefinitionError::NotFound { path: image_dir });
  }

  let manifest_path = image_dir.join(MANIFEST_FILENAME);
  let content = match fs::read_to_string(&manifest_path) {
    Ok(content) => content,
    Err(e) if e.kind() == io::ErrorKind::NotFound => {
      return Err(DefinitionError::NotFound { path: manifest_path });
    }
    Err(source) => {
      return Err(DefinitionError::Io {
        path: manifest_path,
        source,
      });
    }
  };

  let manifest: ImageManifest = serde_json::from_str(&content).map_err(|e| DefinitionError::InvalidDefinition {
    name: name.to_string(),
    reason: format!("malformed {}: {}", MANIFEST_FILENAME, e),
  })?;

  let inherits = match manifest.inherits.as_deref().map(str::trim) {
    Some(value) if !value.is_empty() => value,
    _ => {
      return Err(DefinitionError::InvalidDefinition {
        name: name.to_string(),
        reason: "no inherits property given".to_string(),
      });
    }
  };

  let inherits = Parent::parse(inherits).map_err(|e| DefinitionError::InvalidDefinition {
    name: name.to_string(),
    reason: e.to_string(),
  })?;

  debug!(image = %name, inherits = %inherits, "loaded image definition");

  Ok(ImageDefinition {
    name: name.to_string(),
    image_dir,
    images_dir,
    inherits,
  })
}

/// Load every image definition under `images_dir`, without validating parents.
///
/// Hidden directories are skipped. A single bad definition fails the whole load.
pub fn load_definitions(images_dir: &Path) -> Result<BTreeMap<String, ImageDefinition>, DefinitionError> {
  let resolved = resolve_images_dir(images_dir)?;

  let entries = fs::read_dir(&resolved).map_err(|source| DefinitionError::Io {
    path: resolved.clone(),
    source,
  })?;

  let mut names = Vec::new();
  for entry in entries {
    let entry = entry.map_err(|source| DefinitionError::Io {
      path: resolved.clone(),
      source,
    })?;
    if !entry.path().is_dir() {
      continue;
    }
    let Some(name) = entry.file_name().to_str().map(str::to_string) else {
      continue;
    };
    if name.starts_with('.') {
      continue;
    }
    names.push(name);
  }

  let mut definitions = BTreeMap::new();
  for name in names {
    let definition = load_definition(&name, &resolved)?;
    definitions.insert(name, definition);
  }

  Ok(definitions)
}
