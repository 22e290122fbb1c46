//! Error types for trellis-codec.

use thiserror::Error;

/// Per-block decode failures. `block` is the 1-based ordinal of the
/// document within its input file; `line` is where that document starts.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The block is not valid YAML, or not a mapping of the expected shape.
    #[error("document {block} (line {line}): {message}")]
    Parse {
        block: usize,
        line: usize,
        message: String,
    },

    /// A required identity field is absent or empty.
    #[error("document {block} (line {line}): missing required field '{field}'")]
    MissingField {
        block: usize,
        line: usize,
        field: &'static str,
    },

    /// `kind` names something outside the closed taxonomy.
    #[error("document {block} (line {line}): unknown kind '{kind}'")]
    UnknownKind {
        block: usize,
        line: usize,
        kind: String,
    },

    /// Name or namespace cannot be used as a path segment.
    #[error("document {block} (line {line}): {message}")]
    InvalidIdentity {
        block: usize,
        line: usize,
        message: String,
    },

    /// A reference field holds the wrong shape or an unusable name.
    #[error("document {block} (line {line}): reference field '{field}' {message}")]
    InvalidReference {
        block: usize,
        line: usize,
        field: String,
        message: String,
    },

    /// Canonical rendering failed.
    #[error("canonical rendering failed: {0}")]
    Render(#[from] serde_yaml::Error),
}

impl CodecError {
    /// Position of the offending document, if the error is tied to one.
    pub fn block(&self) -> Option<usize> {
        match self {
            CodecError::Parse { block, .. }
            | CodecError::MissingField { block, .. }
            | CodecError::UnknownKind { block, .. }
            | CodecError::InvalidIdentity { block, .. }
            | CodecError::InvalidReference { block, .. } => Some(*block),
            CodecError::Render(_) => None,
        }
    }
}
