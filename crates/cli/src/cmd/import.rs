//! Implementation of the `stratum import` command.

use std::path::Path;

use anyhow::{Context, Result, bail};

use stratum_lib::backend::connect;
use stratum_lib::config::Config;
use stratum_lib::image::ImageRef;
use stratum_lib::util::fs::file_exists;

use crate::output::{OutputFormat, print_json, print_success};

pub fn cmd_import(reference: &str, tarball: &Path, config: &Config, output: OutputFormat) -> Result<()> {
  let image: ImageRef = reference
    .parse()
    .with_context(|| format!("Invalid image reference '{}'", reference))?;
  if !file_exists(tarball) {
    bail!("Tarball not found: {}", tarball.display());
  }

  super::run_async(|cancel| {
    let image = &image;
    async move {
      let backend = connect(config, "import").await.context("Failed to connect to backend")?;
      cancel
        .run(backend.import_image(image, tarball))
        .await
        .context("Import cancelled")?
        .with_context(|| format!("Failed to import {}", tarball.display()))
    }
  })?;

  if output.is_json() {
    print_json(&serde_json::json!({ "image": image.to_string() }))?;
  } else {
    print_success(&format!("Imported {} as {}", tarball.display(), image));
  }
  Ok(())
}
