//! Error types for trellis-sync.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use trellis_codec::CodecError;
use trellis_core::{CoreError, ScopeErrorKind};

use crate::catalog::CatalogError;
use crate::control_plane::{ClientError, ClientErrorKind};
use crate::vcs::VcsError;

/// All errors that can arise from ingestion and reconciliation.
#[derive(Debug, Error)]
pub enum SyncError {
    /// An error from the scope registry or domain layer.
    #[error("registry error: {0}")]
    Core(#[from] CoreError),

    /// Canonical rendering failed.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON serialization error (manifest, archive log).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The manifest on disk could not be decoded.
    #[error("failed to parse manifest at {path}: {source}")]
    ManifestParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Another process holds the scope's single-writer lock.
    #[error("scope lock busy at {path} ({holder})")]
    LockBusy { path: PathBuf, holder: String },

    /// Control-plane call failed at scope level.
    #[error("control plane: {0}")]
    Client(#[from] ClientError),

    #[error("catalog: {0}")]
    Catalog(#[from] CatalogError),

    #[error("version control: {0}")]
    Vcs(#[from] VcsError),

    /// A sub-step exceeded its hard timeout.
    #[error("{step} timed out after {secs}s")]
    Timeout { step: &'static str, secs: u64 },

    /// Raw input could not be archived; the archive step was rolled back.
    #[error("archiving {path} failed: {message}")]
    ArchiveFailure { path: PathBuf, message: String },

    #[error("object {0} is not managed in this scope")]
    UnknownObject(String),

    /// Refusing to remove an object other objects still point at.
    #[error("object {identity} is still referenced by {}", .by.join(", "))]
    Referenced { identity: String, by: Vec<String> },

    /// A blocking worker panicked or was cancelled.
    #[error("background task failed: {0}")]
    Task(String),

    /// `resolve` was asked to settle a field that is not in conflict.
    #[error("field '{field}' of {identity} is not in conflict")]
    NoConflict { identity: String, field: String },
}

/// Convenience constructor for [`SyncError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> SyncError {
    SyncError::Io {
        path: path.into(),
        source,
    }
}

impl SyncError {
    /// How a scope-level failure is recorded and retried.
    pub fn scope_error_kind(&self) -> ScopeErrorKind {
        match self {
            SyncError::Client(e) => match e.kind {
                ClientErrorKind::Authorization => ScopeErrorKind::Authorization,
                ClientErrorKind::Connectivity => ScopeErrorKind::Connectivity,
                _ => ScopeErrorKind::Internal,
            },
            SyncError::Vcs(_) => ScopeErrorKind::Connectivity,
            SyncError::Timeout { .. } => ScopeErrorKind::Timeout,
            _ => ScopeErrorKind::Internal,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            SyncError::Codec(_) => ErrorClass::Parse,
            SyncError::ArchiveFailure { .. } => ErrorClass::ArchiveFailure,
            SyncError::Timeout { .. } => ErrorClass::Timeout,
            SyncError::Client(e) if e.kind == ClientErrorKind::Authorization => {
                ErrorClass::Authorization
            }
            SyncError::Client(e) if e.kind == ClientErrorKind::Connectivity => {
                ErrorClass::Connectivity
            }
            SyncError::Client(_) => ErrorClass::Rejected,
            SyncError::Vcs(_) => ErrorClass::Connectivity,
            SyncError::NoConflict { .. } => ErrorClass::Conflict,
            _ => ErrorClass::Io,
        }
    }
}

// ---------------------------------------------------------------------------
// Reported (non-fatal) errors
// ---------------------------------------------------------------------------

/// Classification attached to every reported error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorClass {
    Parse,
    DuplicateObject,
    ArchiveFailure,
    Connectivity,
    Authorization,
    Conflict,
    Timeout,
    /// Object-level rejection by the control plane or catalog.
    Rejected,
    Io,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorClass::Parse => "parse",
            ErrorClass::DuplicateObject => "duplicate-object",
            ErrorClass::ArchiveFailure => "archive-failure",
            ErrorClass::Connectivity => "connectivity",
            ErrorClass::Authorization => "authorization",
            ErrorClass::Conflict => "conflict",
            ErrorClass::Timeout => "timeout",
            ErrorClass::Rejected => "rejected",
            ErrorClass::Io => "io",
        };
        f.write_str(label)
    }
}

/// A per-block failure collected alongside the successes of the same input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockError {
    /// Input file, relative to the scope root.
    pub source: PathBuf,
    /// 1-based document ordinal; `None` for whole-file failures.
    pub block: Option<usize>,
    pub line: Option<usize>,
    pub class: ErrorClass,
    pub message: String,
}

impl fmt::Display for BlockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.class, self.source.display())?;
        if let Some(block) = self.block {
            write!(f, " document {block}")?;
        }
        if let Some(line) = self.line {
            write!(f, " (line {line})")?;
        }
        write!(f, ": {}", self.message)
    }
}

impl BlockError {
    pub(crate) fn from_codec(source: PathBuf, err: &CodecError, line: usize) -> Self {
        Self {
            source,
            block: err.block(),
            line: Some(line),
            class: ErrorClass::Parse,
            message: err.to_string(),
        }
    }
}
