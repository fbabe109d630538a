//! Dependency graph over image definitions.
//!
//! Validation walks each image's `inherits` chain on its own, with a fresh
//! "current stack" per entry point, so a cycle reachable from several images
//! is reported for whichever entry point is validated. The whole set must
//! validate before an [`ImageGraph`] exists, which is what lets the
//! orchestrator refuse to start any build when one definition is bad.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;

use super::definition::load_definitions;
use super::types::{DefinitionError, ImageDefinition, Parent};

/// Verify that `definition`'s inheritance chain ends at an external base with no cycle.
pub fn validate_image(
  definition: &ImageDefinition,
  definitions: &BTreeMap<String, ImageDefinition>,
) -> Result<(), DefinitionError> {
  let mut current_stack: HashSet<&str> = HashSet::new();
  let mut current = definition;

  loop {
    let parent = match &current.inherits {
      Parent::External(_) => return Ok(()),
      Parent::Image(parent) => parent.as_str(),
    };

    if current_stack.contains(parent) {
      return Err(DefinitionError::CyclicDependency {
        image: current.name.clone(),
      });
    }

    current_stack.insert(current.name.as_str());

    current = definitions.get(parent).ok_or_else(|| DefinitionError::UnresolvedParent {
      image: current.name.clone(),
      parent: parent.to_string(),
    })?;
  }
}

/// A validated set of image definitions with parent → child edges.
#[derive(Debug)]
pub struct ImageGraph {
  definitions: BTreeMap<String, ImageDefinition>,
  graph: DiGraph<String, ()>,
  nodes: HashMap<String, NodeIndex>,
}

impl ImageGraph {
  /// Load and validate every definition under `images_dir`.
  pub fn load(images_dir: &Path) -> Result<Self, DefinitionError> {
    Self::from_definitions(load_definitions(images_dir)?)
  }

  /// Validate `definitions` and build the graph.
  ///
  /// # Errors
  ///
  /// The first failing image in name order, as `UnresolvedParent` or `CyclicDependency`.
  pub fn from_definitions(definitions: BTreeMap<String, ImageDefinition>) -> Result<Self, DefinitionError> {
    for definition in definitions.values() {
      validate_image(definition, &definitions)?;
    }

    let mut graph = DiGraph::new();
    let mut nodes = HashMap::new();

    for name in definitions.keys() {
      let idx = graph.add_node(name.clone());
      nodes.insert(name.clone(), idx);
    }

    for (name, definition) in &definitions {
      if let Parent::Image(parent) = &definition.inherits {
        // Edge from parent to child
        graph.add_edge(nodes[parent], nodes[name], ());
      }
    }

    Ok(Self {
      definitions,
      graph,
      nodes,
    })
  }

  pub fn get(&self, name: &str) -> Option<&ImageDefinition> {
    self.definitions.get(name)
  }

  pub fn definitions(&self) -> impl Iterator<Item = &ImageDefinition> {
    self.definitions.values()
  }

  pub fn len(&self) -> usize {
    self.definitions.len()
  }

  pub fn is_empty(&self) -> bool {
    self.definitions.is_empty()
  }

  /// Images grouped into waves; every image's parent is in an earlier wave.
  ///
  /// Images within one wave do not depend on each other. Names are sorted
  /// inside a wave so the order is stable across runs.
  pub fn build_waves(&self) -> Vec<Vec<&ImageDefinition>> {
    let mut in_degree: HashMap<NodeIndex, usize> = self
      .graph
      .node_indices()
      .map(|idx| (idx, self.graph.neighbors_directed(idx, Direction::Incoming).count()))
      .collect();

    let mut waves = Vec::new();
    let mut ready: Vec<NodeIndex> = in_degree
      .iter()
      .filter(|(_, degree)| **degree == 0)
      .map(|(idx, _)| *idx)
      .collect();

    while !ready.is_empty() {
      ready.sort_by(|a, b| self.graph[*a].cmp(&self.graph[*b]));

      let mut next = Vec::new();
      for idx in &ready {
        for child in self.graph.neighbors_directed(*idx, Direction::Outgoing) {
          if let Some(degree) = in_degree.get_mut(&child) {
            *degree -= 1;
            if *degree == 0 {
              next.push(child);
            }
          }
        }
      }

      waves.push(ready.iter().map(|idx| &self.definitions[&self.graph[*idx]]).collect());
      ready = next;
    }

    waves
  }

  /// Every image, parents before children.
  pub fn build_order(&self) -> Vec<&ImageDefinition> {
    self.build_waves().into_iter().flatten().collect()
  }

  /// The managed ancestors of `name`, root-most first, excluding `name` itself.
  pub fn ancestors(&self, name: &str) -> Result<Vec<&ImageDefinition>, DefinitionError> {
    let mut current = self
      .get(name)
      .ok_or_else(|| DefinitionError::UnknownImage(name.to_string()))?;

    let mut chain = Vec::new();
    while let Parent::Image(parent) = &current.inherits {
      current = &self.definitions[parent];
      chain.push(current);
    }
    chain.reverse();
    Ok(chain)
  }

  /// All images inheriting from `name`, directly or transitively.
  pub fn descendants(&self, name: &str) -> Vec<&ImageDefinition> {
    let Some(&start) = self.nodes.get(name) else {
      return Vec::new();
    };

    let mut found = Vec::new();
    let mut dfs = Dfs::new(&self.graph, start);
    while let Some(idx) = dfs.next(&self.graph) {
      if idx != start {
        found.push(&self.definitions[&self.graph[idx]]);
      }
    }
    found.sort_by(|a, b| a.name.cmp(&b.name));
    found
  }
}
