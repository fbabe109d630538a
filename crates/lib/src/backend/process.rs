//! Child process helpers shared by the backends.
//!
//! Every child is spawned with `kill_on_drop`, so dropping the future on
//! cancellation also terminates the process.

use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};

use tokio::process::Command;
use tracing::{debug, info};

use super::types::BackendError;

/// Render a command line for logs and error messages.
pub fn describe(command: &Command) -> String {
  let std = command.as_std();
  std::iter::once(std.get_program())
    .chain(std.get_args())
    .map(|part| part.to_string_lossy().into_owned())
    .collect::<Vec<_>>()
    .join(" ")
}

/// The process's exit code, or `128 + signal` when it was killed.
pub fn exit_code(status: ExitStatus) -> i32 {
  status
    .code()
    .or_else(|| status.signal().map(|signal| 128 + signal))
    .unwrap_or(-1)
}

fn spawn_error(command: &Command, source: std::io::Error) -> BackendError {
  BackendError::Spawn {
    program: command.as_std().get_program().to_string_lossy().into_owned(),
    source,
  }
}

/// Run with the caller's stdio attached and return the exit code.
///
/// Build output streams straight to the terminal; a non-zero exit is not an error here.
pub async fn passthrough(mut command: Command) -> Result<i32, BackendError> {
  let line = describe(&command);
  info!(command = %line, "running");

  command
    .stdin(Stdio::inherit())
    .stdout(Stdio::inherit())
    .stderr(Stdio::inherit())
    .kill_on_drop(true);

  let mut child = command.spawn().map_err(|e| spawn_error(&command, e))?;
  let status = child.wait().await?;
  let code = exit_code(status);

  debug!(command = %line, code, "process exited");
  Ok(code)
}

/// Like [`passthrough`], but a non-zero exit is a [`BackendError::CommandFailed`].
pub async fn checked(command: Command) -> Result<(), BackendError> {
  let line = describe(&command);
  match passthrough(command).await? {
    0 => Ok(()),
    code => Err(BackendError::CommandFailed {
      command: line,
      code,
      stderr: String::new(),
    }),
  }
}

/// Run quietly and return trimmed stdout.
pub async fn capture(mut command: Command) -> Result<String, BackendError> {
  let line = describe(&command);
  debug!(command = %line, "running");

  command
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);

  let output = command.output().await.map_err(|e| spawn_error(&command, e))?;
  let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

  if !output.status.success() {
    if !stderr.is_empty() {
      debug!(stderr = %stderr, "command stderr");
    }
    return Err(BackendError::CommandFailed {
      command: line,
      code: exit_code(output.status),
      stderr,
    });
  }

  let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
  if !stdout.is_empty() {
    debug!(stdout = %stdout, "command output");
  }
  Ok(stdout)
}
