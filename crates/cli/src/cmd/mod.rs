mod build;
mod extract;
mod gc;
mod import;
mod list;
mod validate;

use std::future::Future;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::warn;

use stratum_lib::cancel::{self, Cancellation};
use stratum_lib::config::Config;

pub use build::{BuildArgs, cmd_build};
pub use extract::cmd_extract;
pub use gc::cmd_gc;
pub use import::cmd_import;
pub use list::cmd_list;
pub use validate::cmd_validate;

/// Parse a `KEY=VALUE` pair for `--env`.
pub fn parse_env(s: &str) -> Result<(String, String), String> {
  let (key, value) = s
    .split_once('=')
    .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))?;
  if key.is_empty() {
    return Err(format!("empty variable name in '{}'", s));
  }
  Ok((key.to_string(), value.to_string()))
}

fn images_dir(flag: Option<PathBuf>, config: &Config) -> PathBuf {
  flag.unwrap_or_else(|| config.images_dir.clone())
}

/// Drive `body` on a fresh runtime, cancelling it on Ctrl-C.
///
/// The body still runs to completion after a cancel so its sessions and
/// snapshots are torn down before the process exits.
fn run_async<F, Fut, T>(body: F) -> Result<T>
where
  F: FnOnce(Cancellation) -> Fut,
  Fut: Future<Output = Result<T>>,
{
  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  rt.block_on(async {
    let (handle, cancellation) = cancel::channel();
    let watcher = tokio::spawn(async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        warn!("interrupted, cleaning up");
        handle.cancel();
      }
    });

    let result = body(cancellation).await;
    watcher.abort();
    result
  })
}
