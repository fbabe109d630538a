//! Implementation of the `stratum list` command.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Serialize;

use stratum_lib::config::Config;
use stratum_lib::image::{ImageDefinition, ImageGraph};

use crate::output::{OutputFormat, print_info, print_json, print_stat};

#[derive(Serialize)]
struct ListedImage {
  name: String,
  parent: String,
  external: bool,
  /// Images that inherit from this one, directly or transitively.
  dependents: Vec<String>,
}

impl ListedImage {
  fn new(graph: &ImageGraph, definition: &ImageDefinition) -> Self {
    Self {
      name: definition.name.clone(),
      parent: definition.inherits.to_string(),
      external: definition.inherits.is_external(),
      dependents: graph
        .descendants(&definition.name)
        .into_iter()
        .map(|d| d.name.clone())
        .collect(),
    }
  }
}

#[derive(Serialize)]
struct ListReport {
  order: Vec<ListedImage>,
  waves: Vec<Vec<String>>,
}

/// Print every image in build order alongside its parent.
pub fn cmd_list(images_dir: Option<PathBuf>, config: &Config, output: OutputFormat) -> Result<()> {
  let dir = super::images_dir(images_dir, config);
  let graph = ImageGraph::load(&dir).with_context(|| format!("Failed to load images from {}", dir.display()))?;

  if output.is_json() {
    let report = ListReport {
      order: graph
        .build_order()
        .into_iter()
        .map(|definition| ListedImage::new(&graph, definition))
        .collect(),
      waves: graph
        .build_waves()
        .into_iter()
        .map(|wave| wave.into_iter().map(|d| d.name.clone()).collect())
        .collect(),
    };
    print_json(&report)?;
    return Ok(());
  }

  if graph.is_empty() {
    print_info(&format!("No images in {}", dir.display()));
    return Ok(());
  }

  for definition in graph.build_order() {
    let dependents = graph.descendants(&definition.name).len();
    let value = match dependents {
      0 => definition.inherits.to_string(),
      n => format!("{} ({} dependent{})", definition.inherits, n, if n == 1 { "" } else { "s" }),
    };
    print_stat(&definition.name, &value);
  }
  Ok(())
}
