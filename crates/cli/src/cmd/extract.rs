//! Implementation of the `stratum extract` command.

use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use serde::Serialize;

use stratum_lib::backend::connect;
use stratum_lib::config::Config;
use stratum_lib::extract::{extract_image, missing_boot_artifacts};
use stratum_lib::image::ImageRef;

use crate::output::{OutputFormat, format_bytes, format_duration, print_json, print_stat, print_success};

#[derive(Serialize)]
struct ExtractSummary {
  image: String,
  destination: String,
  files: usize,
  bytes: u64,
  missing_boot_artifacts: Vec<&'static str>,
}

pub fn cmd_extract(image: &str, destination: &Path, verify_boot: bool, config: &Config, output: OutputFormat) -> Result<()> {
  let start = Instant::now();
  let image: ImageRef = image.parse().with_context(|| format!("Invalid image reference '{}'", image))?;

  let report = super::run_async(|cancel| {
    let image = &image;
    async move {
      let backend = connect(config, "extract").await.context("Failed to connect to backend")?;
      extract_image(&*backend, image, destination, &cancel)
        .await
        .with_context(|| format!("Failed to extract {}", image))
    }
  })?;

  let missing = if verify_boot {
    missing_boot_artifacts(destination)
  } else {
    Vec::new()
  };

  if output.is_json() {
    print_json(&ExtractSummary {
      image: image.to_string(),
      destination: destination.display().to_string(),
      files: report.files,
      bytes: report.bytes,
      missing_boot_artifacts: missing.clone(),
    })?;
  } else if missing.is_empty() {
    println!();
    print_success(&format!("Extracted {} to {}", image, destination.display()));
    print_stat("Files", &report.files.to_string());
    print_stat("Size", &format_bytes(report.bytes));
    print_stat("Duration", &format_duration(start.elapsed()));
  }

  if !missing.is_empty() {
    bail!(
      "{} is missing boot artifacts: {}",
      destination.display(),
      missing.join(", ")
    );
  }
  Ok(())
}
