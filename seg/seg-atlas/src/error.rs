//! Error types for atlas handling.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while loading, transforming or sampling an atlas.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AtlasError {
    /// No mesh collection is registered under the requested path.
    #[error("no atlas mesh collection at '{}'", .0.display())]
    UnknownCollection(PathBuf),

    /// The mesh arrays are inconsistent.
    #[error("invalid atlas mesh: {0}")]
    InvalidMesh(String),

    /// A per-node array does not have one entry per mesh node.
    #[error("expected {expected} nodes, got {actual}")]
    NodeCountMismatch {
        /// Number of mesh nodes.
        expected: usize,
        /// Number of supplied entries.
        actual: usize,
    },

    /// A class refers to a label the atlas does not define.
    #[error("class '{class}' refers to unknown atlas label '{label}'")]
    UnknownLabel {
        /// Class name.
        class: String,
        /// Missing label name.
        label: String,
    },

    /// A label is claimed by more than one class.
    #[error("atlas label '{label}' is assigned to more than one class")]
    DuplicateLabel {
        /// Label name.
        label: String,
    },

    /// An atlas label is not assigned to any class.
    #[error("atlas label '{label}' is not assigned to any class")]
    UnmappedLabel {
        /// Label name.
        label: String,
    },

    /// A transform could not be applied.
    #[error(transparent)]
    Config(#[from] seg_types::ConfigError),
}

/// Result type for atlas operations.
pub type AtlasResult<T> = Result<T, AtlasError>;
