//! Canonical tree audit.
//!
//! Reads every file under `managed/` and compares it with the manifest:
//!
//! - `untracked`: a canonical file the manifest does not know
//! - `missing`: a manifest record whose file is gone
//! - `modified`: a tracked file whose bytes no longer match the recorded hash
//! - `invalid`: a file that cannot be a canonical object (bad path, bad
//!   content, or content naming a different identity than its path)

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use trellis_codec::{content_hash, parse_canonical};
use trellis_core::layout::{ScopeLayout, TMP_SUFFIX};
use trellis_core::types::{
    FieldOwnership, ManagedObject, ObjectDocument, ObjectIdentity, ObjectOrigin, ScopeId,
};

use crate::error::{io_err, BlockError, ErrorClass, SyncError};
use crate::manifest::{EntryOutcome, Manifest, ManifestEntry};
use crate::writer::read_if_exists;

/// A canonical file as found on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalObject {
    pub document: ObjectDocument,
    pub hash: String,
    /// Relative to the scope root.
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeAudit {
    pub untracked: Vec<PathBuf>,
    pub missing: Vec<PathBuf>,
    pub modified: Vec<PathBuf>,
    pub invalid: Vec<BlockError>,
}

impl TreeAudit {
    pub fn is_clean(&self) -> bool {
        self.untracked.is_empty()
            && self.missing.is_empty()
            && self.modified.is_empty()
            && self.invalid.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct TreeScan {
    pub objects: BTreeMap<ObjectIdentity, LocalObject>,
    pub audit: TreeAudit,
}

pub fn scan_tree(
    scope: &ScopeId,
    layout: &ScopeLayout,
    manifest: &Manifest,
) -> Result<TreeScan, SyncError> {
    let mut scan = TreeScan::default();
    for path in walk(&layout.managed_dir())? {
        let relative = path.strip_prefix(layout.root()).unwrap_or(&path).to_path_buf();
        let invalid = |message: String| BlockError {
            source: relative.clone(),
            block: None,
            line: None,
            class: ErrorClass::Parse,
            message,
        };
        let Some(identity) = ScopeLayout::identity_for_relative(scope, &relative) else {
            scan.audit.invalid.push(invalid("not a canonical object path".to_string()));
            continue;
        };
        let Some(text) = read_if_exists(&path)? else {
            continue;
        };
        let document = match parse_canonical(&text) {
            Ok(document) => document,
            Err(err) => {
                scan.audit.invalid.push(invalid(err.to_string()));
                continue;
            }
        };
        if document.identity(scope) != identity {
            scan.audit.invalid.push(invalid(format!(
                "content names {} but the path belongs to {}",
                document.identity(scope).key(),
                identity.key()
            )));
            continue;
        }
        let hash = content_hash(text.as_bytes());
        match manifest.get(&identity) {
            None => scan.audit.untracked.push(relative.clone()),
            Some(tracked) if tracked.content_hash != hash => {
                scan.audit.modified.push(relative.clone())
            }
            Some(_) => {}
        }
        scan.objects.insert(
            identity,
            LocalObject {
                document,
                hash,
                path: relative,
            },
        );
    }

    for object in manifest.objects.values() {
        if !scan.objects.contains_key(&object.identity)
            && !layout.root().join(&object.canonical_path).exists()
        {
            scan.audit.missing.push(object.canonical_path.clone());
        }
    }
    scan.audit.missing.sort();
    Ok(scan)
}

/// Bring hand-made changes to the tree into the manifest: untracked files
/// become managed objects and locally edited fields become user-owned.
/// Returns how many records changed.
pub fn adopt_local_changes(
    manifest: &mut Manifest,
    scan: &TreeScan,
    now: DateTime<Utc>,
) -> usize {
    let mut changed = 0;
    for (identity, local) in &scan.objects {
        match manifest.get_mut(identity) {
            None => {
                manifest.upsert(ManagedObject {
                    identity: identity.clone(),
                    canonical_path: local.path.clone(),
                    content_hash: local.hash.clone(),
                    resource_version: None,
                    origin: ObjectOrigin::Ingested,
                    ownership: FieldOwnership {
                        user_fields: local.document.spec.keys().cloned().collect(),
                    },
                    baseline: None,
                    last_reconciled: None,
                });
                manifest.record(
                    ManifestEntry::new(identity, EntryOutcome::Adopted, now)
                        .with_detail("untracked file in managed/"),
                );
                changed += 1;
            }
            Some(object) if object.content_hash != local.hash => {
                let edited = edited_fields(object, &local.document);
                for field in &edited {
                    object.ownership.claim(field.as_str());
                }
                object.content_hash = local.hash.clone();
                manifest.record(
                    ManifestEntry::new(identity, EntryOutcome::Updated, now)
                        .with_detail(format!("local edit: {}", edited.join(", "))),
                );
                changed += 1;
            }
            Some(_) => {}
        }
    }
    changed
}

/// Fields of `document` that differ from the last reconciled spec. With no
/// baseline every field counts.
fn edited_fields(object: &ManagedObject, document: &ObjectDocument) -> Vec<String> {
    let Some(baseline) = &object.baseline else {
        return document.spec.keys().cloned().collect();
    };
    let mut fields: Vec<String> = document
        .spec
        .iter()
        .filter(|(k, v)| baseline.get(*k) != Some(*v))
        .map(|(k, _)| k.clone())
        .collect();
    fields.extend(
        baseline
            .keys()
            .filter(|k| !document.spec.contains_key(*k))
            .cloned(),
    );
    fields.sort();
    fields
}

fn walk(dir: &Path) -> Result<Vec<PathBuf>, SyncError> {
    let mut files = Vec::new();
    if !dir.exists() {
        return Ok(files);
    }
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in std::fs::read_dir(&current).map_err(|e| io_err(&current, e))? {
            let entry = entry.map_err(|e| io_err(&current, e))?;
            let path = entry.path();
            let ty = entry.file_type().map_err(|e| io_err(&path, e))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') || name.ends_with(TMP_SUFFIX) {
                continue;
            }
            if ty.is_dir() {
                stack.push(path);
            } else if ty.is_file() {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;
    use trellis_codec::render_with_hash;
    use trellis_core::types::{ObjectKind, Spec};

    fn write_doc(layout: &ScopeLayout, doc: &ObjectDocument) -> String {
        let (text, hash) = render_with_hash(doc).unwrap();
        let path = layout.root().join(ScopeLayout::relative_canonical_path(
            doc.kind,
            &doc.namespace,
            &doc.name,
        ));
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, text).unwrap();
        hash
    }

    fn tenant(descr: &str) -> ObjectDocument {
        let mut spec = Spec::new();
        spec.insert("descr".into(), serde_json::json!(descr));
        ObjectDocument {
            kind: ObjectKind::Tenant,
            namespace: "default".into(),
            name: "acme".into(),
            spec,
        }
    }

    #[test]
    fn reports_untracked_then_adopts() {
        let tmp = TempDir::new().unwrap();
        let layout = ScopeLayout::new(tmp.path());
        let scope = ScopeId::from("s");
        write_doc(&layout, &tenant("a"));

        let mut manifest = Manifest::default();
        let scan = scan_tree(&scope, &layout, &manifest).unwrap();
        assert_eq!(scan.audit.untracked, vec![PathBuf::from("managed/tenant/acme.yaml")]);

        assert_eq!(adopt_local_changes(&mut manifest, &scan, Utc::now()), 1);
        let rescan = scan_tree(&scope, &layout, &manifest).unwrap();
        assert!(rescan.audit.is_clean());
    }

    #[test]
    fn local_edit_claims_changed_fields_only() {
        let tmp = TempDir::new().unwrap();
        let layout = ScopeLayout::new(tmp.path());
        let scope = ScopeId::from("s");
        let original = tenant("a");
        let hash = write_doc(&layout, &original);
        let identity = original.identity(&scope);

        let mut manifest = Manifest::default();
        let mut baseline = original.spec.clone();
        baseline.insert("uid".into(), serde_json::json!("x"));
        manifest.upsert(ManagedObject {
            identity: identity.clone(),
            canonical_path: PathBuf::from("managed/tenant/acme.yaml"),
            content_hash: hash,
            resource_version: Some("1".into()),
            origin: ObjectOrigin::Imported,
            ownership: FieldOwnership::default(),
            baseline: Some(baseline),
            last_reconciled: Some(Utc::now()),
        });

        write_doc(&layout, &tenant("b"));
        let scan = scan_tree(&scope, &layout, &manifest).unwrap();
        assert_eq!(scan.audit.modified.len(), 1);
        adopt_local_changes(&mut manifest, &scan, Utc::now());
        let object = manifest.get(&identity).unwrap();
        assert!(object.ownership.is_user_owned("descr"));
        assert!(object.ownership.is_user_owned("uid"), "removed field counts as edited");
    }

    #[test]
    fn mismatched_content_and_stray_files_are_invalid() {
        let tmp = TempDir::new().unwrap();
        let layout = ScopeLayout::new(tmp.path());
        let scope = ScopeId::from("s");
        let (text, _) = render_with_hash(&tenant("a")).unwrap();
        fs::create_dir_all(tmp.path().join("managed/tenant")).unwrap();
        fs::write(tmp.path().join("managed/tenant/other.yaml"), text).unwrap();
        fs::write(tmp.path().join("managed/notes.txt"), "hi").unwrap();
        fs::write(tmp.path().join("managed/tenant/x.yaml.trellis.tmp"), "partial").unwrap();

        let scan = scan_tree(&scope, &layout, &Manifest::default()).unwrap();
        assert!(scan.objects.is_empty());
        assert_eq!(scan.audit.invalid.len(), 2);
    }

    #[test]
    fn missing_tracked_file_is_reported() {
        let tmp = TempDir::new().unwrap();
        let layout = ScopeLayout::new(tmp.path());
        let scope = ScopeId::from("s");
        let mut manifest = Manifest::default();
        manifest.upsert(ManagedObject {
            identity: tenant("a").identity(&scope),
            canonical_path: PathBuf::from("managed/tenant/acme.yaml"),
            content_hash: "h".into(),
            resource_version: None,
            origin: ObjectOrigin::Ingested,
            ownership: FieldOwnership::default(),
            baseline: None,
            last_reconciled: None,
        });
        let scan = scan_tree(&scope, &layout, &manifest).unwrap();
        assert_eq!(scan.audit.missing, vec![PathBuf::from("managed/tenant/acme.yaml")]);
    }
}
