use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use stratum_lib::config::Config;
use stratum_lib::gc::collect_garbage;

use crate::output::{OutputFormat, format_bytes, format_duration, print_info, print_json, print_stat, print_success};

pub fn cmd_gc(dry_run: bool, lease_expiry: Duration, config: &Config, output: OutputFormat) -> Result<()> {
  let start = Instant::now();

  let result = collect_garbage(&config.store, lease_expiry, dry_run)
    .with_context(|| format!("Garbage collection of {} failed", config.store.display()))?;

  if output.is_json() {
    print_json(&result)?;
  } else {
    println!();
    if dry_run {
      print_info("Dry run - no changes made");
    } else {
      print_success("Garbage collection complete!");
    }
    print_stat("Leases removed", &result.stats.leases_deleted.to_string());
    print_stat("Snapshots removed", &result.stats.snapshots_deleted.to_string());
    if result.stats.snapshots_mounted > 0 {
      print_stat("Snapshots in use", &result.stats.snapshots_mounted.to_string());
    }
    print_stat("Layers removed", &result.stats.layers_deleted.to_string());
    print_stat("Space freed", &format_bytes(result.stats.total_bytes_freed()));
    print_stat("Duration", &format_duration(start.elapsed()));
  }

  Ok(())
}
