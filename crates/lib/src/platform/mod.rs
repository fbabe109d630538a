pub mod paths;

/// Whether the current process runs with an effective uid of 0.
///
/// Mounting snapshots and entering namespaces both need it.
pub fn is_elevated() -> bool {
  rustix::process::geteuid().is_root()
}
