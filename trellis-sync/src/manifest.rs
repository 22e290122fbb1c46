//! Manifest Store: the per-scope record of every managed object.
//!
//! Persists a [`Manifest`] JSON document at `<scope root>/.meta/manifest`.
//! Writes use the same atomic `.tmp` + rename pattern as the canonical
//! files, and callers save after every file-tree mutation so the manifest
//! and the tree never disagree for longer than one step.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use trellis_core::layout::ScopeLayout;
use trellis_core::types::{ManagedObject, ObjectIdentity};

use crate::error::{io_err, SyncError};
use crate::writer::write_atomic;

/// Oldest audit entries are dropped beyond this many.
pub const MAX_ENTRIES: usize = 5000;

/// What happened to an object at one point in its history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntryOutcome {
    /// Canonical file written for the first time by ingestion.
    Created,
    /// Canonical file overwritten by ingestion.
    Updated,
    /// Canonical file already held the rendered bytes but was not tracked.
    Adopted,
    /// Object or fields brought in from the control plane.
    Imported,
    /// File-tree state pushed to the control plane.
    Applied,
    /// Removed after it disappeared from both file tree and control plane.
    Deleted,
    /// Removed on explicit request.
    Pruned,
    /// A conflict was settled by an operator.
    Resolved,
    Failed,
}

/// Append-only audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub at: DateTime<Utc>,
    /// `<kind>/<namespace>/<name>`
    pub object: String,
    pub outcome: EntryOutcome,
    /// Raw input the object was normalized from, relative to the scope root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,
    /// Where that input was archived.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_to: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ManifestEntry {
    pub fn new(identity: &ObjectIdentity, outcome: EntryOutcome, at: DateTime<Utc>) -> Self {
        Self {
            at,
            object: identity.key(),
            outcome,
            source: None,
            archived_to: None,
            detail: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<PathBuf>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// On-disk manifest payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub updated_at: DateTime<Utc>,
    /// Keyed by [`ObjectIdentity::key`].
    #[serde(default)]
    pub objects: BTreeMap<String, ManagedObject>,
    #[serde(default)]
    pub entries: Vec<ManifestEntry>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            updated_at: Utc::now(),
            objects: BTreeMap::new(),
            entries: Vec::new(),
        }
    }
}

impl Manifest {
    pub fn get(&self, identity: &ObjectIdentity) -> Option<&ManagedObject> {
        self.objects.get(&identity.key())
    }

    pub fn get_mut(&mut self, identity: &ObjectIdentity) -> Option<&mut ManagedObject> {
        self.objects.get_mut(&identity.key())
    }

    pub fn upsert(&mut self, object: ManagedObject) {
        self.objects.insert(object.identity.key(), object);
    }

    pub fn remove(&mut self, identity: &ObjectIdentity) -> Option<ManagedObject> {
        self.objects.remove(&identity.key())
    }

    pub fn contains(&self, identity: &ObjectIdentity) -> bool {
        self.objects.contains_key(&identity.key())
    }

    pub fn identities(&self) -> impl Iterator<Item = &ObjectIdentity> {
        self.objects.values().map(|o| &o.identity)
    }

    pub fn record(&mut self, entry: ManifestEntry) {
        self.entries.push(entry);
        if self.entries.len() > MAX_ENTRIES {
            let excess = self.entries.len() - MAX_ENTRIES;
            self.entries.drain(..excess);
        }
    }

    /// Entries recorded for one object, oldest first.
    pub fn history<'a>(&'a self, identity: &ObjectIdentity) -> impl Iterator<Item = &'a ManifestEntry> {
        let key = identity.key();
        self.entries.iter().filter(move |e| e.object == key)
    }
}

/// Load the manifest for a scope. Returns an empty manifest if the file does
/// not yet exist.
pub fn load(layout: &ScopeLayout) -> Result<Manifest, SyncError> {
    load_from(&layout.manifest_path())
}

fn load_from(path: &Path) -> Result<Manifest, SyncError> {
    if !path.exists() {
        return Ok(Manifest::default());
    }
    let contents = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
    serde_json::from_str(&contents).map_err(|source| SyncError::ManifestParse {
        path: path.to_path_buf(),
        source,
    })
}

/// Save the manifest atomically, stamping `updated_at`.
pub fn save(layout: &ScopeLayout, manifest: &mut Manifest) -> Result<(), SyncError> {
    manifest.updated_at = Utc::now();
    let json = serde_json::to_string_pretty(manifest)?;
    write_atomic(&layout.manifest_path(), json.as_bytes())
}
