//! Reconciliation planner: diff records → ordered, safe operation list.
//!
//! Order: creates (parents first) → updates → deletes (children first) →
//! catalog writes. Deleting an object that a surviving object still
//! references needs confirmation. Conflicts are never planned.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use trellis_core::types::{ObjectDocument, ObjectIdentity};

use crate::drift::{Authority, DiffOp, DiffRecord, Risk, Snapshot};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    /// Operations to execute, in order.
    pub ops: Vec<DiffRecord>,
    /// Conflicts and operations waiting for confirmation.
    pub held: Vec<DiffRecord>,
    /// Catalog writes postponed because the object has held operations.
    pub deferred: Vec<DiffRecord>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty() && self.held.is_empty() && self.deferred.is_empty()
    }

    pub fn conflicts(&self) -> usize {
        self.held.iter().filter(|r| r.op.is_conflict()).count()
    }
}

pub fn plan(records: Vec<DiffRecord>, snapshot: &Snapshot, confirm: bool) -> Plan {
    let records = guard_referenced_deletes(records, snapshot);

    let mut plan = Plan::default();
    let mut catalog = Vec::new();
    for record in records {
        if record.target == Authority::Catalog {
            catalog.push(record);
        } else if record.op.is_conflict() || (record.risk == Risk::RequiresConfirmation && !confirm) {
            plan.held.push(record);
        } else {
            plan.ops.push(record);
        }
    }

    let blocked: BTreeSet<&ObjectIdentity> = plan.held.iter().map(|r| &r.identity).collect();
    let (deferred, catalog): (Vec<_>, Vec<_>) = catalog
        .into_iter()
        .partition(|r| blocked.contains(&r.identity));
    plan.deferred = deferred;

    plan.ops.sort_by(|a, b| order_key(a).cmp(&order_key(b)));
    plan.ops.extend(catalog);
    plan
}

/// (phase, signed rank, identity, target)
fn order_key(record: &DiffRecord) -> (u8, i64, &ObjectIdentity, Authority) {
    let rank = record.identity.kind.rank() as i64;
    let (phase, rank) = match record.op {
        DiffOp::Create { .. } => (0, rank),
        DiffOp::Update { .. } => (1, 0),
        DiffOp::Delete => (2, -rank),
        DiffOp::Conflict(_) => (3, 0),
    };
    (phase, rank, &record.identity, record.target)
}

/// Mark control-plane deletes of still-referenced objects as needing
/// confirmation.
fn guard_referenced_deletes(mut records: Vec<DiffRecord>, snapshot: &Snapshot) -> Vec<DiffRecord> {
    let deleted: BTreeSet<ObjectIdentity> = records
        .iter()
        .filter(|r| r.op == DiffOp::Delete && r.target == Authority::ControlPlane)
        .map(|r| r.identity.clone())
        .collect();
    if deleted.is_empty() {
        return records;
    }

    let mut referrers: BTreeMap<ObjectIdentity, Vec<String>> = BTreeMap::new();
    for (identity, document) in surviving(snapshot, &deleted) {
        for target in document.referenced(&identity.scope) {
            if deleted.contains(&target) {
                referrers.entry(target).or_default().push(identity.key());
            }
        }
    }

    for record in &mut records {
        if record.target != Authority::ControlPlane || record.op != DiffOp::Delete {
            continue;
        }
        if let Some(by) = referrers.get(&record.identity) {
            record.risk = Risk::RequiresConfirmation;
            record.reason = Some(format!("still referenced by {}", by.join(", ")));
        }
    }
    records
}

/// Objects that remain after the planned deletes, file version preferred.
fn surviving<'a>(
    snapshot: &'a Snapshot,
    deleted: &'a BTreeSet<ObjectIdentity>,
) -> impl Iterator<Item = (&'a ObjectIdentity, &'a ObjectDocument)> {
    let files = snapshot.files.iter().map(|(id, local)| (id, &local.document));
    let control = snapshot
        .control
        .iter()
        .filter(|(id, _)| !snapshot.files.contains_key(*id))
        .map(|(id, remote)| (id, &remote.document));
    files
        .chain(control)
        .filter(move |(id, _)| !deleted.contains(*id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::LocalObject;
    use crate::control_plane::RemoteObject;
    use crate::drift::{FieldConflict, SpecDelta};
    use serde_json::json;
    use std::path::PathBuf;
    use trellis_core::types::{ObjectKind, ScopeId, Spec};

    fn document(kind: ObjectKind, name: &str, spec: Spec) -> ObjectDocument {
        ObjectDocument {
            kind,
            namespace: "default".into(),
            name: name.into(),
            spec,
        }
    }

    fn record(kind: ObjectKind, name: &str, op: DiffOp, target: Authority) -> DiffRecord {
        DiffRecord {
            identity: ObjectIdentity::new(ScopeId::from("s"), kind, "default", name),
            op,
            target,
            desired: Some(Authority::FileTree),
            risk: Risk::Safe,
            reason: None,
        }
    }

    fn create(kind: ObjectKind, name: &str) -> DiffRecord {
        let document = document(kind, name, Spec::new());
        record(kind, name, DiffOp::Create { document }, Authority::ControlPlane)
    }

    #[test]
    fn creates_updates_deletes_then_catalog() {
        let update = record(
            ObjectKind::Tenant,
            "t",
            DiffOp::Update {
                delta: SpecDelta::default(),
                document: document(ObjectKind::Tenant, "t", Spec::new()),
            },
            Authority::ControlPlane,
        );
        let records = vec![
            record(ObjectKind::Filter, "old", DiffOp::Delete, Authority::Catalog),
            record(ObjectKind::Tenant, "gone", DiffOp::Delete, Authority::ControlPlane),
            record(ObjectKind::Subnet, "gone", DiffOp::Delete, Authority::ControlPlane),
            update,
            create(ObjectKind::Subnet, "a"),
            create(ObjectKind::Vrf, "a"),
        ];
        let plan = plan(records, &Snapshot::default(), false);
        let order: Vec<_> = plan
            .ops
            .iter()
            .map(|r| format!("{} {} {}", r.op.label(), r.target, r.identity.kind))
            .collect();
        assert_eq!(
            order,
            [
                "create control-plane vrf",
                "create control-plane subnet",
                "update control-plane tenant",
                "delete control-plane subnet",
                "delete control-plane tenant",
                "delete catalog filter",
            ]
        );
    }

    #[test]
    fn referenced_delete_is_held_unless_confirmed() {
        let scope = ScopeId::from("s");
        let mut snapshot = Snapshot::default();
        let bd = document(
            ObjectKind::BridgeDomain,
            "web",
            [("vrf".to_string(), json!("main"))].into(),
        );
        snapshot.files.insert(
            bd.identity(&scope),
            LocalObject {
                document: bd,
                hash: String::new(),
                path: PathBuf::new(),
            },
        );
        let vrf = document(ObjectKind::Vrf, "main", Spec::new());
        snapshot.control.insert(
            vrf.identity(&scope),
            RemoteObject {
                document: vrf,
                resource_version: "1".into(),
            },
        );
        let records = vec![
            record(ObjectKind::Vrf, "main", DiffOp::Delete, Authority::ControlPlane),
            record(ObjectKind::Vrf, "main", DiffOp::Delete, Authority::Catalog),
        ];

        let held = plan(records.clone(), &snapshot, false);
        assert!(held.ops.is_empty());
        assert_eq!(held.held.len(), 1);
        assert_eq!(held.deferred.len(), 1);
        assert!(held.held[0].reason.as_deref().unwrap().contains("bridge-domain/default/web"));

        let confirmed = plan(records, &snapshot, true);
        assert_eq!(confirmed.ops.len(), 2);
    }

    #[test]
    fn deleting_referrer_and_target_together_is_safe() {
        let scope = ScopeId::from("s");
        let mut snapshot = Snapshot::default();
        for d in [
            document(ObjectKind::BridgeDomain, "web", [("vrf".to_string(), json!("main"))].into()),
            document(ObjectKind::Vrf, "main", Spec::new()),
        ] {
            snapshot.control.insert(
                d.identity(&scope),
                RemoteObject {
                    document: d,
                    resource_version: "1".into(),
                },
            );
        }
        let records = vec![
            record(ObjectKind::Vrf, "main", DiffOp::Delete, Authority::ControlPlane),
            record(ObjectKind::BridgeDomain, "web", DiffOp::Delete, Authority::ControlPlane),
        ];
        let plan = plan(records, &snapshot, false);
        assert!(plan.held.is_empty());
        assert_eq!(plan.ops[0].identity.kind, ObjectKind::BridgeDomain);
    }

    #[test]
    fn conflicts_are_held_even_when_confirmed() {
        let mut conflict = record(
            ObjectKind::Tenant,
            "t",
            DiffOp::Conflict(FieldConflict {
                field: "descr".into(),
                file: Some(json!("a")),
                control: Some(json!("b")),
                baseline: None,
            }),
            Authority::ControlPlane,
        );
        conflict.risk = Risk::RequiresConfirmation;
        let plan = plan(vec![conflict], &Snapshot::default(), true);
        assert!(plan.ops.is_empty());
        assert_eq!(plan.conflicts(), 1);
    }
}
