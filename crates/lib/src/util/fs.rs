//! Plain filesystem primitives.
//!
//! These follow symlink-free semantics for the paths they create: `copy_file` writes a new regular file,
//! `clean_directory` unlinks symlinks rather than following them.

use std::fs;
use std::io;
use std::path::Path;

/// Returns true if `path` exists and is a directory.
pub fn directory_exists(path: &Path) -> bool {
  path.is_dir()
}

/// Returns true if `path` exists and is a regular file.
pub fn file_exists(path: &Path) -> bool {
  path.is_file()
}

/// Copy `src` to `dst`, creating any missing parent directories of `dst`.
///
/// An existing file at `dst` is overwritten. Permission bits are carried over.
pub fn copy_file(src: &Path, dst: &Path) -> io::Result<u64> {
  if let Some(parent) = dst.parent() {
    fs::create_dir_all(parent)?;
  }
  fs::copy(src, dst)
}

/// Remove everything inside `path` without removing `path` itself.
pub fn clean_directory(path: &Path) -> io::Result<()> {
  for entry in fs::read_dir(path)? {
    let entry = entry?;
    let entry_path = entry.path();
    if entry.file_type()?.is_dir() {
      fs::remove_dir_all(&entry_path)?;
    } else {
      fs::remove_file(&entry_path)?;
    }
  }
  Ok(())
}

/// Total size in bytes of the regular files under `path`.
pub fn dir_size(path: &Path) -> u64 {
  walkdir::WalkDir::new(path)
    .into_iter()
    .filter_map(|e| e.ok())
    .filter(|e| e.file_type().is_file())
    .filter_map(|e| e.metadata().ok())
    .map(|m| m.len())
    .sum()
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  #[test]
  fn copy_file_creates_parents() {
    let temp = TempDir::new().unwrap();
    let src = temp.path().join("src.txt");
    fs::write(&src, "hello").unwrap();

    let dst = temp.path().join("a/b/c/dst.txt");
    copy_file(&src, &dst).unwrap();

    assert_eq!(fs::read_to_string(&dst).unwrap(), "hello");
  }

  #[test]
  fn copy_file_overwrites() {
    let temp = TempDir::new().unwrap();
    let src = temp.path().join("src.txt");
    let dst = temp.path().join("dst.txt");
    fs::write(&src, "new").unwrap();
    fs::write(&dst, "old contents").unwrap();

    copy_file(&src, &dst).unwrap();

    assert_eq!(fs::read_to_string(&dst).unwrap(), "new");
  }

  #[test]
  fn clean_directory_keeps_the_directory() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path().join("out");
    fs::create_dir_all(dir.join("nested/deeper")).unwrap();
    fs::write(dir.join("file"), "x").unwrap();
    fs::write(dir.join("nested/deeper/file"), "y").unwrap();

    clean_directory(&dir).unwrap();

    assert!(directory_exists(&dir));
    assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);
  }

  #[cfg(unix)]
  #[test]
  fn clean_directory_unlinks_symlinks_without_following() {
    let temp = TempDir::new().unwrap();
    let outside = temp.path().join("outside");
    fs::create_dir(&outside).unwrap();
    fs::write(outside.join("keep"), "x").unwrap();

    let dir = temp.path().join("out");
    fs::create_dir(&dir).unwrap();
    std::os::unix::fs::symlink(&outside, dir.join("link")).unwrap();

    clean_directory(&dir).unwrap();

    assert!(file_exists(&outside.join("keep")));
    assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);
  }

  #[test]
  fn predicates_distinguish_files_and_directories() {
    let temp = TempDir::new().unwrap();
    let file = temp.path().join("f");
    fs::write(&file, "x").unwrap();

    assert!(file_exists(&file));
    assert!(!directory_exists(&file));
    assert!(directory_exists(temp.path()));
    assert!(!file_exists(temp.path()));
    assert!(!file_exists(&temp.path().join("missing")));
  }

  #[test]
  fn dir_size_sums_regular_files() {
    let temp = TempDir::new().unwrap();
    fs::create_dir(temp.path().join("sub")).unwrap();
    fs::write(temp.path().join("a"), "1234").unwrap();
    fs::write(temp.path().join("sub/b"), "56").unwrap();

    assert_eq!(dir_size(temp.path()), 6);
  }
}
