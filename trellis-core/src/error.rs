//! Error types for trellis-core.

use std::path::PathBuf;

use thiserror::Error;

use crate::lifecycle::ScopeState;

/// All errors that can arise from scope registry and domain operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Underlying I/O failure (file not found, permission denied, etc.).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization error (write/save path).
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// YAML parse error on load: includes file path and line context from serde_yaml.
    #[error("failed to parse scope record at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// `dirs::home_dir()` returned `None`: cannot locate `~/.trellis/`.
    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,

    /// The scope record did not exist at the expected path.
    #[error("scope not found at {path}")]
    ScopeNotFound { path: PathBuf },

    /// Scope identifiers double as file names and must be path-safe.
    #[error("invalid scope id '{0}'")]
    InvalidScopeId(String),

    /// A name, namespace, or identity key failed validation.
    #[error("invalid object identity: {0}")]
    InvalidIdentity(String),

    /// Kind string outside the closed taxonomy.
    #[error("unknown object kind '{0}'")]
    UnknownKind(String),

    /// Scope configuration rejected by validation.
    #[error("invalid scope configuration: {0}")]
    InvalidConfig(String),

    /// Refusing to remove a scope whose tree still holds managed objects.
    #[error("scope '{scope}' still manages {objects} object(s); prune them first")]
    ScopeInUse { scope: String, objects: usize },

    /// Lifecycle event not permitted from the current state.
    #[error("illegal lifecycle transition: {event} while {from}")]
    InvalidTransition { from: ScopeState, event: String },
}
