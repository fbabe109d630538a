use crate::consts::APP_NAME;
use std::path::PathBuf;

/// Returns the user's home directory
pub fn home_dir() -> PathBuf {
  std::env::var("HOME").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("/root"))
}

/// Returns the directory for data files for the application
pub fn data_dir() -> PathBuf {
  let data_home = std::env::var("XDG_DATA_HOME")
    .map(PathBuf::from)
    .unwrap_or_else(|_| home_dir().join(".local").join("share"));
  data_home.join(APP_NAME)
}

/// Returns the root of the native runtime's layer store.
///
/// `STRATUM_STORE` overrides the default of `<data_dir>/store`.
pub fn store_dir() -> PathBuf {
  if let Ok(path) = std::env::var("STRATUM_STORE")
    && !path.is_empty()
  {
    return PathBuf::from(path);
  }
  data_dir().join("store")
}
