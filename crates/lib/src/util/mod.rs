//! Shared utilities.
//!
//! Filesystem primitives used by extraction and the native runtime, plus test helpers.

pub mod fs;

#[cfg(test)]
pub mod testutil;
