//! Unified diffs for `trellis diff`.
//!
//! Runs a dry reconciliation and renders every planned change as a unified
//! diff of canonical text. File-tree targets compare against the file on
//! disk; control-plane targets compare against the control plane's copy.

use std::path::PathBuf;

use serde::Serialize;
use similar::TextDiff;

use trellis_codec::render_canonical;
use trellis_core::types::{ObjectIdentity, ScopeId};
use trellis_core::ScopeLayout;

use crate::drift::{Authority, DiffOp, DiffRecord};
use crate::reconcile::{run_scope, ReconcileEnv, ReconcileOptions, ReconcileReport};
use crate::writer::read_if_exists;
use crate::SyncError;

/// One planned change as text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectDiff {
    pub identity: ObjectIdentity,
    pub target: Authority,
    pub op: &'static str,
    /// Empty for conflicts.
    pub unified_diff: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScopePreview {
    pub scope: ScopeId,
    pub diffs: Vec<ObjectDiff>,
    /// Raw inputs waiting in `raw/`; not yet part of the diff.
    pub pending_inputs: Vec<PathBuf>,
}

/// Everything the next reconciliation would change. Nothing is written.
pub async fn diff_scope(env: &ReconcileEnv, id: &ScopeId) -> Result<ScopePreview, SyncError> {
    let options = ReconcileOptions {
        dry_run: true,
        ..ReconcileOptions::default()
    };
    let report = run_scope(env, id, options).await?;
    let scope = trellis_core::registry::load_scope_at(&env.home, id)?;
    let layout = ScopeLayout::new(&scope.root);
    let control = crate::reconcile::fetch_control(env.control.as_ref(), id).await?;

    let mut diffs = Vec::new();
    for record in report.plan.ops.iter().chain(&report.plan.held) {
        let current = match record.target {
            Authority::FileTree => read_if_exists(&layout.canonical_path(&record.identity))?
                .unwrap_or_default(),
            Authority::ControlPlane => match control.get(&record.identity) {
                Some(remote) => render_canonical(&remote.document)?,
                None => String::new(),
            },
            // Catalog records mirror the projected file content.
            Authority::Catalog => continue,
        };
        diffs.push(object_diff(record, &current)?);
    }

    Ok(ScopePreview {
        scope: id.clone(),
        diffs,
        pending_inputs: pending_inputs(&report),
    })
}

fn object_diff(record: &DiffRecord, current: &str) -> Result<ObjectDiff, SyncError> {
    let desired = match &record.op {
        DiffOp::Create { document } | DiffOp::Update { document, .. } => {
            render_canonical(document)?
        }
        DiffOp::Delete => String::new(),
        DiffOp::Conflict(_) => {
            return Ok(ObjectDiff {
                identity: record.identity.clone(),
                target: record.target,
                op: record.op.label(),
                unified_diff: String::new(),
                note: Some(record.to_string()),
            })
        }
    };
    Ok(ObjectDiff {
        identity: record.identity.clone(),
        target: record.target,
        op: record.op.label(),
        unified_diff: unified(&record.identity, record.target, current, &desired),
        note: record.reason.clone(),
    })
}

fn unified(identity: &ObjectIdentity, target: Authority, old: &str, new: &str) -> String {
    let relative = label_path(identity);
    let old_header = format!("a/{target}/{}", relative.display());
    let new_header = format!("b/{target}/{}", relative.display());
    TextDiff::from_lines(old, new)
        .unified_diff()
        .header(&old_header, &new_header)
        .context_radius(3)
        .to_string()
}

fn label_path(identity: &ObjectIdentity) -> PathBuf {
    ScopeLayout::relative_canonical_path(identity.kind, &identity.namespace, &identity.name)
}

fn pending_inputs(report: &ReconcileReport) -> Vec<PathBuf> {
    report
        .ingest
        .files
        .iter()
        .map(|file| file.source.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drift::Risk;
    use trellis_core::types::{ObjectDocument, ObjectKind, Spec};

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
    fn update_renders_changed_line() {
        let before = render_canonical(&tenant("old")).unwrap();
        let record = DiffRecord {
            identity: tenant("new").identity(&ScopeId::from("s")),
            op: DiffOp::Create {
                document: tenant("new"),
            },
            target: Authority::FileTree,
            desired: Some(Authority::ControlPlane),
            risk: Risk::Safe,
            reason: None,
        };
        let diff = object_diff(&record, &before).unwrap();
        assert!(diff.unified_diff.contains("-  descr: old"), "{}", diff.unified_diff);
        assert!(diff.unified_diff.contains("+  descr: new"));
        assert!(diff.unified_diff.contains("a/file-tree/managed/tenant/acme.yaml"));
    }
}
