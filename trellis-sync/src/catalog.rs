//! Catalog: the index of managed objects used for lookup and listing.
//!
//! Every mutation is a compare-and-swap on one identity: the caller passes
//! the content hash it last saw (or `None` for "must not exist yet") and the
//! write is refused with [`CatalogError::Stale`] if the stored entry moved.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use trellis_core::registry::trellis_root;
use trellis_core::types::{ObjectIdentity, ScopeId, Spec};

use crate::writer::tmp_path_for;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog entry {identity} changed concurrently (expected {expected}, found {found})")]
    Stale {
        identity: String,
        expected: String,
        found: String,
    },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt catalog at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// One indexed object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub identity: ObjectIdentity,
    pub content_hash: String,
    #[serde(default)]
    pub spec: Spec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    pub updated_at: DateTime<Utc>,
}

pub trait Catalog: Send + Sync {
    fn list(&self, scope: &ScopeId) -> Result<Vec<CatalogEntry>, CatalogError>;

    /// Insert or replace. `expected_hash = None` requires the entry to be absent.
    fn upsert(&self, entry: CatalogEntry, expected_hash: Option<&str>) -> Result<(), CatalogError>;

    /// Remove if present and still at `expected_hash`. Absent entries are not an error.
    fn remove(&self, identity: &ObjectIdentity, expected_hash: &str) -> Result<(), CatalogError>;
}

// ---------------------------------------------------------------------------
// File-backed catalog
// ---------------------------------------------------------------------------

/// `<dir>/<scope>.json`, one JSON map per scope.
#[derive(Debug)]
pub struct FileCatalog {
    dir: PathBuf,
    guard: Mutex<()>,
}

type ScopeEntries = BTreeMap<String, CatalogEntry>;

impl FileCatalog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            guard: Mutex::new(()),
        }
    }

    /// `<home>/.trellis/catalog/`
    pub fn at_home(home: &Path) -> Self {
        Self::new(trellis_root(home).join("catalog"))
    }

    fn scope_path(&self, scope: &ScopeId) -> PathBuf {
        self.dir.join(format!("{}.json", scope.0))
    }

    fn load(&self, scope: &ScopeId) -> Result<ScopeEntries, CatalogError> {
        let path = self.scope_path(scope);
        match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).map_err(|source| CatalogError::Json { path, source }),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(ScopeEntries::new()),
            Err(source) => Err(CatalogError::Io { path, source }),
        }
    }

    fn store(&self, scope: &ScopeId, entries: &ScopeEntries) -> Result<(), CatalogError> {
        let path = self.scope_path(scope);
        let io = |path: &Path, source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        };
        std::fs::create_dir_all(&self.dir).map_err(|e| io(&self.dir, e))?;
        let json = serde_json::to_string_pretty(entries).map_err(|source| CatalogError::Json {
            path: path.clone(),
            source,
        })?;
        let tmp = tmp_path_for(&path);
        std::fs::write(&tmp, json).map_err(|e| io(&tmp, e))?;
        if let Err(e) = std::fs::rename(&tmp, &path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(io(&path, e));
        }
        Ok(())
    }

    fn locked<T>(&self, f: impl FnOnce() -> Result<T, CatalogError>) -> Result<T, CatalogError> {
        // A panic in another holder leaves the files consistent, so poison is ignored.
        let _held = self.guard.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f()
    }
}

fn check_expected(
    key: &str,
    current: Option<&CatalogEntry>,
    expected: Option<&str>,
) -> Result<(), CatalogError> {
    let found = current.map(|e| e.content_hash.as_str());
    if found == expected {
        return Ok(());
    }
    Err(CatalogError::Stale {
        identity: key.to_string(),
        expected: expected.unwrap_or("<absent>").to_string(),
        found: found.unwrap_or("<absent>").to_string(),
    })
}

impl Catalog for FileCatalog {
    fn list(&self, scope: &ScopeId) -> Result<Vec<CatalogEntry>, CatalogError> {
        self.locked(|| Ok(self.load(scope)?.into_values().collect()))
    }

    fn upsert(&self, entry: CatalogEntry, expected_hash: Option<&str>) -> Result<(), CatalogError> {
        self.locked(|| {
            let scope = entry.identity.scope.clone();
            let key = entry.identity.key();
            let mut entries = self.load(&scope)?;
            check_expected(&key, entries.get(&key), expected_hash)?;
            entries.insert(key, entry);
            self.store(&scope, &entries)
        })
    }

    fn remove(&self, identity: &ObjectIdentity, expected_hash: &str) -> Result<(), CatalogError> {
        self.locked(|| {
            let key = identity.key();
            let mut entries = self.load(&identity.scope)?;
            let Some(current) = entries.get(&key) else {
                return Ok(());
            };
            check_expected(&key, Some(current), Some(expected_hash))?;
            entries.remove(&key);
            self.store(&identity.scope, &entries)
        })
    }
}
