//! Implementation of the `stratum validate` command.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use serde::Serialize;

use stratum_lib::config::Config;
use stratum_lib::image::{load_definitions, validate_image};

use crate::output::{OutputFormat, print_error, print_json, print_success};

#[derive(Serialize)]
struct ValidateReport {
  images: Vec<String>,
  errors: Vec<ImageProblem>,
}

#[derive(Serialize)]
struct ImageProblem {
  image: String,
  error: String,
}

/// Validate every image's inheritance chain, reporting each failing image rather than only the first.
pub fn cmd_validate(images_dir: Option<PathBuf>, config: &Config, output: OutputFormat) -> Result<()> {
  let dir = super::images_dir(images_dir, config);
  let definitions = load_definitions(&dir).with_context(|| format!("Failed to load images from {}", dir.display()))?;

  let errors: Vec<ImageProblem> = definitions
    .values()
    .filter_map(|definition| {
      validate_image(definition, &definitions).err().map(|err| ImageProblem {
        image: definition.name.clone(),
        error: err.to_string(),
      })
    })
    .collect();

  let report = ValidateReport {
    images: definitions.keys().cloned().collect(),
    errors,
  };

  if output.is_json() {
    print_json(&report)?;
  } else if report.errors.is_empty() {
    print_success(&format!("{} image(s) valid", report.images.len()));
  } else {
    for problem in &report.errors {
      print_error(&problem.error);
    }
  }

  if !report.errors.is_empty() {
    bail!("{} of {} image(s) failed validation", report.errors.len(), report.images.len());
  }
  Ok(())
}
