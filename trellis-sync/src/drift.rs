//! Drift detector: three-way comparison of file tree, control plane and
//! catalog for one scope.
//!
//! Field ownership decides direction. With a baseline (the spec agreed at
//! the last reconciliation) each diverging field is classified:
//!
//! | owner  | control plane vs baseline | result                    |
//! |--------|---------------------------|---------------------------|
//! | user   | unchanged                 | push file value           |
//! | user   | changed                   | conflict, never applied   |
//! | system | changed                   | import control-plane value|
//!
//! A field edited in the file since the baseline counts as user-owned even
//! if the manifest has not recorded it yet.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use trellis_codec::render_with_hash;
use trellis_core::types::{ManagedObject, ObjectDocument, ObjectIdentity, Spec};

use crate::audit::LocalObject;
use crate::catalog::CatalogEntry;
use crate::control_plane::RemoteObject;
use crate::error::SyncError;
use crate::manifest::Manifest;

// ---------------------------------------------------------------------------
// Deltas
// ---------------------------------------------------------------------------

/// Field-level change to a spec: keys to set and keys to remove.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecDelta {
    #[serde(default)]
    pub set: Spec,
    #[serde(default)]
    pub unset: BTreeSet<String>,
}

impl SpecDelta {
    /// The delta that turns `from` into `to`.
    pub fn between(from: &Spec, to: &Spec) -> Self {
        let mut delta = SpecDelta::default();
        for (field, value) in to {
            if from.get(field) != Some(value) {
                delta.set.insert(field.clone(), value.clone());
            }
        }
        for field in from.keys() {
            if !to.contains_key(field) {
                delta.unset.insert(field.clone());
            }
        }
        delta
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.unset.is_empty()
    }

    pub fn apply(&self, spec: &mut Spec) {
        for field in &self.unset {
            spec.remove(field);
        }
        for (field, value) in &self.set {
            spec.insert(field.clone(), value.clone());
        }
    }

    /// Touched fields, sorted.
    pub fn fields(&self) -> Vec<&str> {
        let mut fields: Vec<&str> = self
            .set
            .keys()
            .chain(self.unset.iter())
            .map(String::as_str)
            .collect();
        fields.sort_unstable();
        fields
    }

    fn assign(&mut self, field: &str, value: Option<&Value>) {
        match value {
            Some(value) => {
                self.set.insert(field.to_string(), value.clone());
            }
            None => {
                self.unset.insert(field.to_string());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// One of the three representations of an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Authority {
    FileTree,
    ControlPlane,
    Catalog,
}

impl fmt::Display for Authority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Authority::FileTree => "file-tree",
            Authority::ControlPlane => "control-plane",
            Authority::Catalog => "catalog",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Risk {
    Safe,
    RequiresConfirmation,
}

/// A user-owned field that diverged on both sides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldConflict {
    pub field: String,
    pub file: Option<Value>,
    pub control: Option<Value>,
    pub baseline: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum DiffOp {
    /// `document` is what the target should hold afterwards.
    Create { document: ObjectDocument },
    Update {
        delta: SpecDelta,
        document: ObjectDocument,
    },
    Delete,
    Conflict(FieldConflict),
}

impl DiffOp {
    pub fn label(&self) -> &'static str {
        match self {
            DiffOp::Create { .. } => "create",
            DiffOp::Update { .. } => "update",
            DiffOp::Delete => "delete",
            DiffOp::Conflict(_) => "conflict",
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, DiffOp::Conflict(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffRecord {
    pub identity: ObjectIdentity,
    pub op: DiffOp,
    /// Where the change is applied.
    pub target: Authority,
    /// Which authority's state wins; `None` for conflicts.
    pub desired: Option<Authority>,
    pub risk: Risk,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl DiffRecord {
    fn new(identity: &ObjectIdentity, op: DiffOp, target: Authority, desired: Authority) -> Self {
        Self {
            identity: identity.clone(),
            op,
            target,
            desired: Some(desired),
            risk: Risk::Safe,
            reason: None,
        }
    }

    fn held(mut self, reason: impl Into<String>) -> Self {
        self.risk = Risk::RequiresConfirmation;
        self.reason = Some(reason.into());
        self
    }
}

impl fmt::Display for DiffRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.op.label(), self.target, self.identity.key())?;
        match &self.op {
            DiffOp::Update { delta, .. } => write!(f, " [{}]", delta.fields().join(", "))?,
            DiffOp::Conflict(c) => write!(f, " field '{}'", c.field)?,
            _ => {}
        }
        if self.risk == Risk::RequiresConfirmation {
            write!(f, " (requires confirmation")?;
            if let Some(reason) = &self.reason {
                write!(f, ": {reason}")?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Detection
// ---------------------------------------------------------------------------

/// State of all three authorities at one moment.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub files: BTreeMap<ObjectIdentity, LocalObject>,
    pub control: BTreeMap<ObjectIdentity, RemoteObject>,
    pub catalog: BTreeMap<ObjectIdentity, CatalogEntry>,
}

impl Snapshot {
    /// Every identity appearing in any source or in the manifest.
    pub fn identities(&self, manifest: &Manifest) -> BTreeSet<ObjectIdentity> {
        self.files
            .keys()
            .chain(self.control.keys())
            .chain(self.catalog.keys())
            .cloned()
            .chain(manifest.identities().cloned())
            .collect()
    }
}

/// Compute every discrepancy, ordered by identity then target authority.
pub fn detect(snapshot: &Snapshot, manifest: &Manifest) -> Result<Vec<DiffRecord>, SyncError> {
    let mut records = Vec::new();
    for identity in snapshot.identities(manifest) {
        let file = snapshot.files.get(&identity);
        let control = snapshot.control.get(&identity);
        let tracked = manifest.get(&identity);
        let start = records.len();
        let projected = detect_object(&identity, file, control, tracked, &mut records);
        let has_conflict = records[start..].iter().any(|r| r.op.is_conflict());
        if let Some(record) = catalog_record(
            &identity,
            projected,
            control,
            snapshot.catalog.get(&identity),
            has_conflict,
        )? {
            records.push(record);
        }
    }
    records.sort_by(|a, b| (&a.identity, a.target).cmp(&(&b.identity, b.target)));
    Ok(records)
}

/// Push object records for one identity and return the document the file
/// tree will hold once they are applied.
fn detect_object(
    identity: &ObjectIdentity,
    file: Option<&LocalObject>,
    control: Option<&RemoteObject>,
    tracked: Option<&ManagedObject>,
    out: &mut Vec<DiffRecord>,
) -> Option<ObjectDocument> {
    let reconciled = tracked.is_some_and(ManagedObject::is_reconciled);
    match (file, control) {
        (None, None) => None,
        (Some(file), None) => {
            let record = DiffRecord::new(
                identity,
                DiffOp::Create {
                    document: file.document.clone(),
                },
                Authority::ControlPlane,
                Authority::FileTree,
            );
            out.push(if reconciled {
                record.held("removed from the control plane since the last reconciliation")
            } else {
                record
            });
            Some(file.document.clone())
        }
        (None, Some(_)) if reconciled => {
            out.push(DiffRecord::new(
                identity,
                DiffOp::Delete,
                Authority::ControlPlane,
                Authority::FileTree,
            ));
            None
        }
        (None, Some(control)) => {
            out.push(DiffRecord::new(
                identity,
                DiffOp::Create {
                    document: control.document.clone(),
                },
                Authority::FileTree,
                Authority::ControlPlane,
            ));
            Some(control.document.clone())
        }
        (Some(file), Some(control)) => Some(detect_both(identity, file, control, tracked, out)),
    }
}

fn detect_both(
    identity: &ObjectIdentity,
    file: &LocalObject,
    control: &RemoteObject,
    tracked: Option<&ManagedObject>,
    out: &mut Vec<DiffRecord>,
) -> ObjectDocument {
    let f = &file.document.spec;
    let c = &control.document.spec;
    if f == c {
        return file.document.clone();
    }

    let baseline = tracked.and_then(|t| t.baseline.as_ref());
    let Some(baseline) = baseline else {
        // First reconciliation: one side overwrites the other wholesale.
        let user_authored = tracked.is_some_and(|t| t.ownership.user_modified());
        return if user_authored {
            let mut document = control.document.clone();
            document.spec = f.clone();
            out.push(DiffRecord::new(
                identity,
                DiffOp::Update {
                    delta: SpecDelta::between(c, f),
                    document,
                },
                Authority::ControlPlane,
                Authority::FileTree,
            ));
            file.document.clone()
        } else {
            let mut document = file.document.clone();
            document.spec = c.clone();
            out.push(DiffRecord::new(
                identity,
                DiffOp::Update {
                    delta: SpecDelta::between(f, c),
                    document: document.clone(),
                },
                Authority::FileTree,
                Authority::ControlPlane,
            ));
            document
        };
    };

    let ownership = tracked.map(|t| &t.ownership);
    let fields: BTreeSet<&String> = f.keys().chain(c.keys()).chain(baseline.keys()).collect();
    let mut push = SpecDelta::default();
    let mut import = SpecDelta::default();
    for field in fields {
        let (fv, cv, bv) = (f.get(field), c.get(field), baseline.get(field));
        if fv == cv {
            continue;
        }
        let user_owned = ownership.is_some_and(|o| o.is_user_owned(field)) || fv != bv;
        if !user_owned {
            import.assign(field, cv);
        } else if cv == bv {
            push.assign(field, fv);
        } else {
            out.push(conflict(identity, field, fv, cv, bv));
        }
    }

    if !push.is_empty() {
        let mut document = control.document.clone();
        push.apply(&mut document.spec);
        out.push(DiffRecord::new(
            identity,
            DiffOp::Update {
                delta: push,
                document,
            },
            Authority::ControlPlane,
            Authority::FileTree,
        ));
    }
    let mut projected = file.document.clone();
    if !import.is_empty() {
        import.apply(&mut projected.spec);
        out.push(DiffRecord::new(
            identity,
            DiffOp::Update {
                delta: import,
                document: projected.clone(),
            },
            Authority::FileTree,
            Authority::ControlPlane,
        ));
    }
    projected
}

fn conflict(
    identity: &ObjectIdentity,
    field: &str,
    file: Option<&Value>,
    control: Option<&Value>,
    baseline: Option<&Value>,
) -> DiffRecord {
    DiffRecord {
        identity: identity.clone(),
        op: DiffOp::Conflict(FieldConflict {
            field: field.to_string(),
            file: file.cloned(),
            control: control.cloned(),
            baseline: baseline.cloned(),
        }),
        target: Authority::ControlPlane,
        desired: None,
        risk: Risk::RequiresConfirmation,
        reason: Some("user-owned field changed on both sides".to_string()),
    }
}

/// Catalog entry a live object should have.
pub fn catalog_entry_for(
    identity: &ObjectIdentity,
    document: &ObjectDocument,
    resource_version: Option<String>,
) -> Result<CatalogEntry, SyncError> {
    let (_, content_hash) = render_with_hash(document)?;
    Ok(CatalogEntry {
        identity: identity.clone(),
        content_hash,
        spec: document.spec.clone(),
        resource_version,
        updated_at: chrono::Utc::now(),
    })
}

fn catalog_record(
    identity: &ObjectIdentity,
    projected: Option<ObjectDocument>,
    control: Option<&RemoteObject>,
    current: Option<&CatalogEntry>,
    has_conflict: bool,
) -> Result<Option<DiffRecord>, SyncError> {
    let record = |op| DiffRecord::new(identity, op, Authority::Catalog, Authority::FileTree);
    match (projected, current) {
        (None, None) => Ok(None),
        (None, Some(_)) => Ok(Some(record(DiffOp::Delete))),
        // Index the settled state, not one side of a conflict.
        (Some(_), Some(_)) if has_conflict => Ok(None),
        (Some(document), current) => {
            let wanted = catalog_entry_for(
                identity,
                &document,
                control.map(|c| c.resource_version.clone()),
            )?;
            Ok(match current {
                None => Some(record(DiffOp::Create { document })),
                Some(entry) if entry.content_hash != wanted.content_hash => {
                    let delta = SpecDelta::between(&entry.spec, &document.spec);
                    Some(record(DiffOp::Update { delta, document }))
                }
                Some(_) => None,
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
