//! Plan executor.
//!
//! One operation per step, each under its own timeout. After every step the
//! manifest is updated and saved before the next one starts, so whatever
//! prefix of the plan ran is durable and a retry picks up the remainder.
//! Object-level rejections are collected; connectivity, authorization,
//! timeouts and file-tree I/O abort the rest of the plan.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use trellis_codec::render_with_hash;
use trellis_core::layout::ScopeLayout;
use trellis_core::types::{
    FieldOwnership, ManagedObject, ObjectDocument, ObjectIdentity, ObjectOrigin, ScopeId, Spec,
};

use crate::catalog::{Catalog, CatalogError};
use crate::control_plane::{ClientError, ClientErrorKind, ControlPlane, RemoteObject};
use crate::drift::{catalog_entry_for, Authority, DiffOp, DiffRecord, Snapshot, SpecDelta};
use crate::error::SyncError;
use crate::manifest::{self, EntryOutcome, Manifest, ManifestEntry};
use crate::plan::Plan;
use crate::writer::{remove_canonical, write_canonical};

/// An operation the target refused; the rest of the plan still ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub identity: ObjectIdentity,
    pub target: Authority,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyReport {
    pub applied: Vec<DiffRecord>,
    pub rejected: Vec<Rejection>,
    /// In-sync objects whose baseline was refreshed.
    pub settled: usize,
    /// Manifest records dropped because the object is gone everywhere.
    pub forgotten: usize,
}

pub(crate) struct Applier<'a> {
    pub scope: &'a ScopeId,
    pub layout: &'a ScopeLayout,
    pub control: &'a dyn ControlPlane,
    pub catalog: Arc<dyn Catalog>,
    pub step_timeout: Duration,
}

enum Step {
    Done,
    Rejected(String),
}

impl Applier<'_> {
    pub async fn apply(
        &self,
        plan: &Plan,
        snapshot: &Snapshot,
        manifest: &mut Manifest,
    ) -> Result<ApplyReport, SyncError> {
        let mut report = ApplyReport::default();
        let mut failed: BTreeSet<ObjectIdentity> = BTreeSet::new();

        for record in &plan.ops {
            if record.target == Authority::Catalog && failed.contains(&record.identity) {
                tracing::debug!("catalog write for {} deferred", record.identity);
                continue;
            }
            let now = Utc::now();
            let step = match record.target {
                Authority::ControlPlane => self.apply_control(record, snapshot, manifest, now).await?,
                Authority::FileTree => self.apply_file(record, snapshot, manifest, now)?,
                Authority::Catalog => self.apply_catalog(record, snapshot, manifest, now).await?,
            };
            match step {
                Step::Done => {
                    tracing::info!("applied: {record}");
                    report.applied.push(record.clone());
                }
                Step::Rejected(message) => {
                    tracing::warn!("rejected: {record}: {message}");
                    manifest.record(
                        ManifestEntry::new(&record.identity, EntryOutcome::Failed, now)
                            .with_detail(format!("{} {}: {message}", record.op.label(), record.target)),
                    );
                    failed.insert(record.identity.clone());
                    report.rejected.push(Rejection {
                        identity: record.identity.clone(),
                        target: record.target,
                        message,
                    });
                }
            }
            manifest::save(self.layout, manifest)?;
        }

        let touched: BTreeSet<&ObjectIdentity> = plan
            .ops
            .iter()
            .chain(&plan.held)
            .chain(&plan.deferred)
            .map(|r| &r.identity)
            .collect();
        let (settled, forgotten) = settle(snapshot, manifest, &touched, Utc::now());
        report.settled = settled;
        report.forgotten = forgotten;
        if settled + forgotten > 0 {
            manifest::save(self.layout, manifest)?;
        }
        Ok(report)
    }

    // -- control plane ------------------------------------------------------

    async fn apply_control(
        &self,
        record: &DiffRecord,
        snapshot: &Snapshot,
        manifest: &mut Manifest,
        now: DateTime<Utc>,
    ) -> Result<Step, SyncError> {
        let identity = &record.identity;
        match &record.op {
            DiffOp::Create { document } => {
                let created = match self.call("create", self.control.create(self.scope, document)).await? {
                    Ok(remote) => remote,
                    Err(e) if e.kind == ClientErrorKind::AlreadyExists => {
                        match self.call("get", self.control.get(identity)).await? {
                            Ok(Some(remote)) => remote,
                            Ok(None) => return Ok(Step::Rejected(e.to_string())),
                            Err(e) => return object_level(e),
                        }
                    }
                    Err(e) => return object_level(e),
                };
                let object = tracked(manifest, identity, ObjectOrigin::Ingested);
                if let Some(local) = snapshot.files.get(identity) {
                    object.content_hash = local.hash.clone();
                }
                object.resource_version = Some(created.resource_version);
                object.baseline = Some(document.spec.clone());
                object.last_reconciled = Some(now);
                manifest.record(
                    ManifestEntry::new(identity, EntryOutcome::Applied, now)
                        .with_detail("created in control plane"),
                );
                Ok(Step::Done)
            }
            DiffOp::Update { delta, .. } => {
                let current = snapshot.control.get(identity);
                let expected = current.map(|c| c.resource_version.as_str());
                let updated = match self
                    .call("update", self.control.update(identity, delta, expected))
                    .await?
                {
                    Ok(remote) => remote,
                    Err(e) => return object_level(e),
                };
                let before = current.map(|c| c.document.spec.clone()).unwrap_or_default();
                let object = tracked(manifest, identity, ObjectOrigin::Ingested);
                if let Some(local) = snapshot.files.get(identity) {
                    object.content_hash = local.hash.clone();
                }
                object.baseline = Some(rebase(object.baseline.take().unwrap_or(before), delta));
                object.resource_version = Some(updated.resource_version);
                object.last_reconciled = Some(now);
                for field in delta.set.keys() {
                    object.ownership.claim(field.as_str());
                }
                manifest.record(
                    ManifestEntry::new(identity, EntryOutcome::Applied, now)
                        .with_detail(format!("pushed {}", delta.fields().join(", "))),
                );
                Ok(Step::Done)
            }
            DiffOp::Delete => {
                match self.call("delete", self.control.delete(identity)).await? {
                    Ok(()) => {}
                    Err(e) if e.kind == ClientErrorKind::NotFound => {}
                    Err(e) => return object_level(e),
                }
                manifest.remove(identity);
                manifest.record(
                    ManifestEntry::new(identity, EntryOutcome::Deleted, now)
                        .with_detail("deleted from control plane"),
                );
                Ok(Step::Done)
            }
            DiffOp::Conflict(_) => Ok(Step::Rejected("conflicts are never applied".to_string())),
        }
    }

    async fn call<T, F>(&self, step: &'static str, fut: F) -> Result<Result<T, ClientError>, SyncError>
    where
        F: Future<Output = Result<T, ClientError>>,
    {
        with_timeout(step, self.step_timeout, fut).await
    }

    // -- file tree ----------------------------------------------------------

    fn apply_file(
        &self,
        record: &DiffRecord,
        snapshot: &Snapshot,
        manifest: &mut Manifest,
        now: DateTime<Utc>,
    ) -> Result<Step, SyncError> {
        let identity = &record.identity;
        let remote = snapshot.control.get(identity);
        match &record.op {
            DiffOp::Create { document } => {
                let hash = self.write(identity, document)?;
                let object = tracked(manifest, identity, ObjectOrigin::Imported);
                object.content_hash = hash;
                object.baseline = Some(document.spec.clone());
                object.resource_version = remote.map(|r| r.resource_version.clone());
                object.last_reconciled = Some(now);
                manifest.record(
                    ManifestEntry::new(identity, EntryOutcome::Imported, now)
                        .with_detail("imported from control plane"),
                );
            }
            DiffOp::Update { delta, document } => {
                let hash = self.write(identity, document)?;
                let before = snapshot
                    .files
                    .get(identity)
                    .map(|f| f.document.spec.clone())
                    .unwrap_or_default();
                let object = tracked(manifest, identity, ObjectOrigin::Imported);
                object.content_hash = hash;
                object.baseline = Some(rebase(object.baseline.take().unwrap_or(before), delta));
                object.resource_version = remote.map(|r| r.resource_version.clone());
                object.last_reconciled = Some(now);
                manifest.record(
                    ManifestEntry::new(identity, EntryOutcome::Imported, now)
                        .with_detail(format!("imported {}", delta.fields().join(", "))),
                );
            }
            DiffOp::Delete => {
                remove_canonical(&self.layout.canonical_path(identity), &self.layout.managed_dir())?;
                manifest.remove(identity);
                manifest.record(ManifestEntry::new(identity, EntryOutcome::Deleted, now));
            }
            DiffOp::Conflict(_) => return Ok(Step::Rejected("conflicts are never applied".to_string())),
        }
        Ok(Step::Done)
    }

    fn write(&self, identity: &ObjectIdentity, document: &ObjectDocument) -> Result<String, SyncError> {
        let (text, hash) = render_with_hash(document)?;
        write_canonical(&self.layout.canonical_path(identity), &text, false)?;
        Ok(hash)
    }

    // -- catalog ------------------------------------------------------------

    async fn apply_catalog(
        &self,
        record: &DiffRecord,
        snapshot: &Snapshot,
        manifest: &mut Manifest,
        now: DateTime<Utc>,
    ) -> Result<Step, SyncError> {
        let identity = record.identity.clone();
        let current = snapshot.catalog.get(&identity).map(|e| e.content_hash.clone());
        let catalog = Arc::clone(&self.catalog);
        let result = match &record.op {
            DiffOp::Create { document } | DiffOp::Update { document, .. } => {
                let version = manifest
                    .get(&identity)
                    .and_then(|o| o.resource_version.clone());
                let entry = catalog_entry_for(&identity, document, version)?;
                let blocking = tokio::task::spawn_blocking(move || {
                    catalog.upsert(entry, current.as_deref())
                });
                with_timeout("catalog", self.step_timeout, blocking).await?
            }
            DiffOp::Delete => {
                let expected = current.unwrap_or_default();
                let id = identity.clone();
                let blocking = tokio::task::spawn_blocking(move || catalog.remove(&id, &expected));
                with_timeout("catalog", self.step_timeout, blocking).await?
            }
            DiffOp::Conflict(_) => return Ok(Step::Rejected("conflicts are never applied".to_string())),
        };
        match result.map_err(|e| SyncError::Task(e.to_string()))? {
            Ok(()) => {}
            Err(e @ CatalogError::Stale { .. }) => return Ok(Step::Rejected(e.to_string())),
            Err(e) => return Err(e.into()),
        }
        manifest.record(
            ManifestEntry::new(&identity, EntryOutcome::Applied, now)
                .with_detail(format!("catalog {}", record.op.label())),
        );
        Ok(Step::Done)
    }
}

fn object_level(err: ClientError) -> Result<Step, SyncError> {
    if err.is_scope_level() {
        Err(err.into())
    } else {
        Ok(Step::Rejected(err.to_string()))
    }
}

pub(crate) async fn with_timeout<F: Future>(
    step: &'static str,
    limit: Duration,
    fut: F,
) -> Result<F::Output, SyncError> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| SyncError::Timeout {
            step,
            secs: limit.as_secs(),
        })
}

/// Baseline after `delta` has been agreed by both sides.
fn rebase(mut baseline: Spec, delta: &SpecDelta) -> Spec {
    delta.apply(&mut baseline);
    baseline
}

/// Manifest record for `identity`, created with `origin` if missing.
fn tracked<'m>(
    manifest: &'m mut Manifest,
    identity: &ObjectIdentity,
    origin: ObjectOrigin,
) -> &'m mut ManagedObject {
    let key = identity.key();
    manifest
        .objects
        .entry(key)
        .or_insert_with(|| ManagedObject {
            identity: identity.clone(),
            canonical_path: ScopeLayout::relative_canonical_path(
                identity.kind,
                &identity.namespace,
                &identity.name,
            ),
            content_hash: String::new(),
            resource_version: None,
            origin,
            ownership: FieldOwnership::default(),
            baseline: None,
            last_reconciled: None,
        })
}

/// Refresh the baseline of in-sync objects that needed no operation and
/// drop records of objects that exist nowhere.
fn settle(
    snapshot: &Snapshot,
    manifest: &mut Manifest,
    touched: &BTreeSet<&ObjectIdentity>,
    now: DateTime<Utc>,
) -> (usize, usize) {
    let mut settled = 0;
    let mut gone = Vec::new();
    for object in manifest.objects.values_mut() {
        let identity = &object.identity;
        match (snapshot.files.get(identity), snapshot.control.get(identity)) {
            (Some(_), Some(_)) if touched.contains(identity) => {}
            (Some(file), Some(remote)) if file.document.spec == remote.document.spec => {
                if needs_settle(object, &file.document.spec, remote) {
                    object.baseline = Some(file.document.spec.clone());
                    object.resource_version = Some(remote.resource_version.clone());
                    object.last_reconciled = Some(now);
                    settled += 1;
                }
            }
            (None, None) => gone.push(identity.clone()),
            _ => {}
        }
    }
    for identity in &gone {
        manifest.remove(identity);
        manifest.record(
            ManifestEntry::new(identity, EntryOutcome::Deleted, now)
                .with_detail("gone from file tree and control plane"),
        );
    }
    (settled, gone.len())
}

fn needs_settle(object: &ManagedObject, spec: &Spec, remote: &RemoteObject) -> bool {
    object.baseline.as_ref() != Some(spec)
        || object.resource_version.as_deref() != Some(remote.resource_version.as_str())
        || object.last_reconciled.is_none()
}
