//! Image definitions, references, and the inheritance graph.

pub mod definition;
pub mod graph;
pub mod reference;
pub mod types;

pub use definition::{load_definition, load_definitions};
pub use graph::{ImageGraph, validate_image};
pub use reference::{ImageRef, ReferenceError};
pub use types::{DefinitionError, ImageDefinition, Parent};
