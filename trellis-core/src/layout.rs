//! Per-scope canonical file-tree layout.
//!
//! ```text
//! <scope root>/
//!   raw/                                   inbox, user-writable
//!   managed/<kind>/<name>.yaml             namespace "default"
//!   managed/<kind>/<namespace>/<name>.yaml any other namespace
//!   archive/                               move-to-archive-dir strategy only
//!   .meta/manifest                         manifest store (JSON)
//!   .meta/archive-log                      archived originals (JSON lines)
//!   .meta/lock                             single-writer lock
//! ```

use std::path::{Component, Path, PathBuf};

use crate::types::{ObjectIdentity, ObjectKind, ScopeId, DEFAULT_NAMESPACE};

pub const RAW_DIR: &str = "raw";
pub const MANAGED_DIR: &str = "managed";
pub const ARCHIVE_DIR: &str = "archive";
pub const META_DIR: &str = ".meta";
pub const MANIFEST_FILE: &str = "manifest";
pub const ARCHIVE_LOG_FILE: &str = "archive-log";
pub const LOCK_FILE: &str = "lock";

/// Extension of every canonical file.
pub const CANONICAL_EXT: &str = "yaml";
/// Marker inserted by the rename-with-suffix archive strategy.
pub const ARCHIVED_MARKER: &str = ".ingested-";
/// Suffix of in-flight atomic writes.
pub const TMP_SUFFIX: &str = ".trellis.tmp";

/// Path helpers rooted at one scope's tree. Pure: no I/O except
/// [`ScopeLayout::ensure_dirs`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeLayout {
    root: PathBuf,
}

impl ScopeLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn raw_dir(&self) -> PathBuf {
        self.root.join(RAW_DIR)
    }

    pub fn managed_dir(&self) -> PathBuf {
        self.root.join(MANAGED_DIR)
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.root.join(ARCHIVE_DIR)
    }

    pub fn meta_dir(&self) -> PathBuf {
        self.root.join(META_DIR)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.meta_dir().join(MANIFEST_FILE)
    }

    pub fn archive_log_path(&self) -> PathBuf {
        self.meta_dir().join(ARCHIVE_LOG_FILE)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.meta_dir().join(LOCK_FILE)
    }

    /// Canonical path of an object relative to the scope root.
    pub fn relative_canonical_path(kind: ObjectKind, namespace: &str, name: &str) -> PathBuf {
        let mut path = PathBuf::from(MANAGED_DIR).join(kind.as_str());
        if namespace != DEFAULT_NAMESPACE {
            path.push(namespace);
        }
        path.push(format!("{name}.{CANONICAL_EXT}"));
        path
    }

    pub fn canonical_path(&self, identity: &ObjectIdentity) -> PathBuf {
        self.root.join(Self::relative_canonical_path(
            identity.kind,
            &identity.namespace,
            &identity.name,
        ))
    }

    /// Inverse of [`ScopeLayout::relative_canonical_path`]; `None` for paths
    /// that cannot be a canonical file.
    pub fn identity_for_relative(scope: &ScopeId, relative: &Path) -> Option<ObjectIdentity> {
        let parts: Vec<&str> = relative
            .components()
            .map(|c| match c {
                Component::Normal(part) => part.to_str(),
                _ => None,
            })
            .collect::<Option<Vec<_>>>()?;
        let (kind, namespace, file) = match parts.as_slice() {
            [MANAGED_DIR, kind, file] => (*kind, DEFAULT_NAMESPACE, *file),
            [MANAGED_DIR, kind, namespace, file] => (*kind, *namespace, *file),
            _ => return None,
        };
        let name = file.strip_suffix(&format!(".{CANONICAL_EXT}"))?;
        let identity = ObjectIdentity::new(scope.clone(), kind.parse().ok()?, namespace, name);
        identity.validate().ok()?;
        if namespace == DEFAULT_NAMESPACE && parts.len() == 4 {
            // `managed/<kind>/default/<name>.yaml` is never canonical.
            return None;
        }
        Some(identity)
    }

    /// Create `raw/`, `managed/` and `.meta/` if absent.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        for dir in [self.raw_dir(), self.managed_dir(), self.meta_dir()] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

/// Whether a file in `raw/` should be ingested: not hidden, not an in-flight
/// temp file, and not already archived in place.
pub fn is_inbox_candidate(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    !name.starts_with('.') && !name.ends_with(TMP_SUFFIX) && !name.contains(ARCHIVED_MARKER)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
