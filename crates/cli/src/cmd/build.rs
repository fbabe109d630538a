//! Implementation of the `stratum build` command.
//!
//! Definitions are loaded and validated before the backend is contacted, so a
//! bad definition set never starts a session.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use serde::Serialize;

use stratum_lib::backend::connect;
use stratum_lib::build::{BuildError, BuildOptions, BuildReport, BuildStep, SkippedImage, build_images};
use stratum_lib::config::Config;
use stratum_lib::image::ImageGraph;

use crate::output::{
  OutputFormat, format_duration, print_error, print_item, print_json, print_stat, print_success, print_warning,
  symbols,
};

/// Flags for one `stratum build` invocation.
pub struct BuildArgs {
  pub image: Option<String>,
  pub images_dir: Option<PathBuf>,
  pub prefix: Option<String>,
  pub tags: Vec<String>,
  pub env: Vec<(String, String)>,
  pub package_cache: Option<PathBuf>,
  pub rebuild_parents: bool,
}

#[derive(Serialize)]
struct FailedImage {
  image: String,
  step: Option<BuildStep>,
  error: String,
  cleanup: Option<String>,
}

#[derive(Serialize)]
struct BuildSummary {
  success: bool,
  built: Vec<String>,
  reused: Vec<String>,
  failed: Option<FailedImage>,
  skipped: Vec<SkippedImage>,
  duration_ms: u128,
}

fn cleanup_of(err: &BuildError) -> Option<String> {
  match err {
    BuildError::Step { cleanup, .. } => cleanup.as_ref().map(ToString::to_string),
    _ => None,
  }
}

impl BuildSummary {
  fn new(report: &BuildReport, elapsed: std::time::Duration) -> Self {
    Self {
      success: report.is_success(),
      built: report.built.iter().map(ToString::to_string).collect(),
      reused: report.reused.iter().map(ToString::to_string).collect(),
      failed: report.failed.as_ref().map(|(image, err)| FailedImage {
        image: image.clone(),
        step: err.step(),
        error: err.to_string(),
        cleanup: cleanup_of(err),
      }),
      skipped: report.skipped.clone(),
      duration_ms: elapsed.as_millis(),
    }
  }
}

pub fn cmd_build(args: BuildArgs, config: &Config, output: OutputFormat) -> Result<()> {
  let start = Instant::now();

  let dir = super::images_dir(args.images_dir, config);
  let graph = ImageGraph::load(&dir).with_context(|| format!("Failed to load images from {}", dir.display()))?;

  let options = BuildOptions {
    prefix: args.prefix.unwrap_or_else(|| config.prefix.clone()),
    tags: args.tags,
    env: args.env.into_iter().collect(),
    package_cache: args.package_cache,
    rebuild_parents: args.rebuild_parents,
  };
  let target = args.image;

  let report = super::run_async(|cancel| async move {
    let backend = connect(config, "build").await.context("Failed to connect to backend")?;
    build_images(&*backend, &graph, target.as_deref(), &options, &cancel)
      .await
      .context("Build failed")
  })?;

  let summary = BuildSummary::new(&report, start.elapsed());

  if output.is_json() {
    print_json(&summary)?;
  } else {
    for image in &summary.reused {
      print_item(symbols::REUSE, &format!("{} (reused)", image));
    }
    for image in &summary.built {
      print_item(symbols::SUCCESS, image);
    }
    for skipped in &summary.skipped {
      print_item(
        symbols::SKIP,
        &format!("{} (skipped, blocked by {})", skipped.name, skipped.blocked_by),
      );
    }
    if let Some(failed) = &summary.failed {
      print_error(&failed.error);
      if let Some(cleanup) = &failed.cleanup {
        print_warning(&format!("Cleanup also failed: {}", cleanup));
      }
    } else {
      println!();
      print_success("Build complete!");
    }
    print_stat("Built", &summary.built.len().to_string());
    print_stat("Reused", &summary.reused.len().to_string());
    print_stat("Duration", &format_duration(start.elapsed()));
  }

  if let Some(failed) = summary.failed {
    bail!("Build of {} failed", failed.image);
  }
  Ok(())
}
