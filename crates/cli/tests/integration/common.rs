//! Shared test helpers for CLI integration tests.

use std::fs::File;
use std::path::PathBuf;

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use tempfile::TempDir;

/// Isolated test environment.
///
/// Each test gets its own temporary directory with an isolated store,
/// images directory, and data paths.
pub struct TestEnv {
  pub temp: TempDir,
}

impl TestEnv {
  pub fn empty() -> Self {
    Self {
      temp: TempDir::new().unwrap(),
    }
  }

  /// Write a file relative to the temp directory.
  pub fn write_file(&self, relative_path: &str, content: &str) {
    let path = self.temp.path().join(relative_path);
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, content).unwrap();
  }

  /// Define image `name` inheriting from `inherits`.
  pub fn write_image(&self, name: &str, inherits: &str) {
    self.write_file(
      &format!("images/{}/config.json", name),
      &format!(r#"{{"inherits": "{}"}}"#, inherits),
    );
    self.write_file(&format!("images/{}/script", name), "#!/bin/sh\ntrue\n");
  }

  pub fn images_path(&self) -> PathBuf {
    self.temp.path().join("images")
  }

  /// Native store root (isolated per test).
  pub fn store_path(&self) -> PathBuf {
    let p = self.temp.path().join("store");
    std::fs::create_dir_all(&p).unwrap();
    dunce::canonicalize(&p).unwrap_or(p)
  }

  /// An uncompressed rootfs tarball holding `files` as `(path, content)` pairs.
  pub fn write_tarball(&self, name: &str, files: &[(&str, &str)]) -> PathBuf {
    let path = self.temp.path().join(name);
    let mut builder = tar::Builder::new(File::create(&path).unwrap());
    for (file, content) in files {
      let mut header = tar::Header::new_gnu();
      header.set_size(content.len() as u64);
      header.set_mode(0o644);
      header.set_uid(0);
      header.set_gid(0);
      header.set_mtime(0);
      header.set_cksum();
      builder.append_data(&mut header, file, content.as_bytes()).unwrap();
    }
    builder.finish().unwrap();
    path
  }

  /// Number of layer directories in the store.
  pub fn layer_count(&self) -> usize {
    match std::fs::read_dir(self.store_path().join("layers")) {
      Ok(entries) => entries.count(),
      Err(_) => 0,
    }
  }

  /// Get a pre-configured Command for the stratum binary.
  ///
  /// Sets environment variables for isolated testing:
  /// - `STRATUM_STORE`: Isolated native store
  /// - `STRATUM_IMAGES`: Isolated images directory
  /// - `STRATUM_BACKEND`: The native backend, so no daemon is needed
  /// - `XDG_DATA_HOME` / `XDG_CACHE_HOME`: Isolated data and cache paths
  pub fn stratum_cmd(&self) -> Command {
    let mut cmd: Command = cargo_bin_cmd!("stratum");
    cmd.env("STRATUM_STORE", self.store_path());
    cmd.env("STRATUM_IMAGES", self.images_path());
    cmd.env("STRATUM_BACKEND", "native");
    cmd.env("XDG_DATA_HOME", self.temp.path().join("data"));
    cmd.env("XDG_CACHE_HOME", self.temp.path().join("cache"));
    cmd.env_remove("STRATUM_PREFIX");
    cmd
  }
}
