//! One reconciliation run for one scope, plus the operator actions that
//! settle what a run cannot (`resolve`, `prune`).
//!
//! A run holds the scope lock throughout and moves through short sub-steps,
//! each with a hard timeout:
//!
//! ```text
//! pull → ingest → audit → fetch → catalog → detect/plan → apply… → publish
//! ```
//!
//! Scope-level failures move the record to `error` with a backed-off retry;
//! everything else is reported alongside the results.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use trellis_core::lifecycle::DEFAULT_ATTENTION_THRESHOLD;
use trellis_core::registry::{self, trellis_root};
use trellis_core::types::{ObjectIdentity, ObjectKind, Scope, ScopeId};
use trellis_core::{ScopeLayout, ScopeState};

use crate::apply::{with_timeout, ApplyReport, Applier};
use crate::audit::{adopt_local_changes, scan_tree, TreeAudit};
use crate::catalog::{Catalog, CatalogEntry, CatalogError, FileCatalog};
use crate::control_plane::{ClientErrorKind, ControlPlane, LocalControlPlane, RemoteObject};
use crate::drift::{detect, DiffRecord, Snapshot};
use crate::error::SyncError;
use crate::ingest::{ingest_inbox, IngestReport};
use crate::lock::ScopeLock;
use crate::manifest::{self, EntryOutcome, Manifest, ManifestEntry};
use crate::plan::{plan, Plan};
use crate::vcs::{self, GitCli, VersionControl};
use crate::writer::remove_canonical;

/// Default hard limit for each sub-step.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Environment and options
// ---------------------------------------------------------------------------

/// External collaborators for a run.
#[derive(Clone)]
pub struct ReconcileEnv {
    pub home: PathBuf,
    pub control: Arc<dyn ControlPlane>,
    pub catalog: Arc<dyn Catalog>,
    pub vcs: Option<Arc<dyn VersionControl>>,
}

impl fmt::Debug for ReconcileEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconcileEnv")
            .field("home", &self.home)
            .field("vcs", &self.vcs.is_some())
            .finish_non_exhaustive()
    }
}

impl ReconcileEnv {
    /// Directory-backed control plane (the scope's own, or
    /// `<home>/.trellis/control-plane`), the given catalog, and git when the
    /// scope enables it.
    pub fn local(home: &Path, scope: &Scope, catalog: Arc<dyn Catalog>) -> Self {
        let control_root = scope
            .config
            .control_plane
            .clone()
            .unwrap_or_else(|| trellis_root(home).join("control-plane"));
        let vcs: Option<Arc<dyn VersionControl>> = if scope.config.vcs {
            Some(Arc::new(GitCli::new(&scope.root)))
        } else {
            None
        };
        Self {
            home: home.to_path_buf(),
            control: Arc::new(LocalControlPlane::new(control_root)),
            catalog,
            vcs,
        }
    }

    /// [`ReconcileEnv::local`] with the catalog under `home`.
    pub fn local_with_home_catalog(home: &Path, scope: &Scope) -> Self {
        Self::local(home, scope, Arc::new(FileCatalog::at_home(home)))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReconcileOptions {
    /// Apply operations that need confirmation (never conflicts).
    pub confirm: bool,
    /// Compute and report without writing anything or changing state.
    pub dry_run: bool,
    pub step_timeout: Duration,
    pub attention_threshold: u32,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            confirm: false,
            dry_run: false,
            step_timeout: DEFAULT_STEP_TIMEOUT,
            attention_threshold: DEFAULT_ATTENTION_THRESHOLD,
        }
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub scope: ScopeId,
    pub dry_run: bool,
    pub ingest: IngestReport,
    pub audit: TreeAudit,
    pub records: Vec<DiffRecord>,
    pub plan: Plan,
    pub apply: ApplyReport,
    /// Lifecycle state after the run; unchanged for dry runs.
    pub state: ScopeState,
    pub committed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_error: Option<String>,
}

impl ReconcileReport {
    /// Held operations, open conflicts and rejected operations.
    pub fn unresolved(&self) -> usize {
        self.plan.held.len() + self.apply.rejected.len()
    }

    pub fn conflicts(&self) -> usize {
        self.plan.conflicts()
    }
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// Reconcile one scope end to end and record the outcome on its scope record.
///
/// Returns [`SyncError::LockBusy`] without touching the record if another
/// run holds the scope.
pub async fn run_scope(
    env: &ReconcileEnv,
    id: &ScopeId,
    options: ReconcileOptions,
) -> Result<ReconcileReport, SyncError> {
    let scope = registry::load_scope_at(&env.home, id)?;
    let layout = ScopeLayout::new(&scope.root);
    if options.dry_run {
        return run_steps(env, &scope, &layout, options).await;
    }

    let _lock = ScopeLock::acquire(&layout)?;
    let started = Utc::now();
    registry::update_scope_at(&env.home, id, |record| {
        if record.recover_interrupted(started) {
            tracing::warn!("scope {id}: previous run was interrupted");
        }
        record.begin_run(started)
    })?;
    tracing::info!("scope {id}: reconciliation started");

    match run_steps(env, &scope, &layout, options).await {
        Ok(mut report) => {
            let unresolved = report.unresolved();
            let conflicts = report.conflicts();
            let pending_push = report.push_error.is_some();
            let record = registry::update_scope_at(&env.home, id, |record| {
                record.pending_push = pending_push;
                record.finish_success(Utc::now(), unresolved, conflicts)
            })?;
            report.state = record.state;
            tracing::info!(
                "scope {id}: {} applied, {unresolved} unresolved, now {}",
                report.apply.applied.len(),
                record.state
            );
            Ok(report)
        }
        Err(err) => {
            let kind = err.scope_error_kind();
            tracing::error!("scope {id}: {kind} failure: {err}");
            registry::update_scope_at(&env.home, id, |record| {
                record.finish_failure(Utc::now(), kind, err.to_string(), options.attention_threshold)
            })?;
            Err(err)
        }
    }
}

async fn run_steps(
    env: &ReconcileEnv,
    scope: &Scope,
    layout: &ScopeLayout,
    options: ReconcileOptions,
) -> Result<ReconcileReport, SyncError> {
    let limit = options.step_timeout;
    let dry_run = options.dry_run;

    if let (Some(vcs), false) = (&env.vcs, dry_run) {
        with_timeout("pull", limit, vcs::pull(Arc::clone(vcs))).await??;
    }

    let mut manifest = manifest::load(layout)?;
    let ingest = ingest_inbox(scope, layout, &mut manifest, dry_run)?;

    let scan = scan_tree(&scope.id, layout, &manifest)?;
    if adopt_local_changes(&mut manifest, &scan, Utc::now()) > 0 && !dry_run {
        manifest::save(layout, &mut manifest)?;
    }

    let control = with_timeout("fetch", limit, fetch_control(env.control.as_ref(), &scope.id)).await??;
    let catalog = fetch_catalog(env, &scope.id, limit).await?;
    let snapshot = Snapshot {
        files: scan.objects,
        control,
        catalog,
    };

    let records = detect(&snapshot, &manifest)?;
    let plan = plan(records.clone(), &snapshot, options.confirm);

    let apply = if dry_run {
        ApplyReport::default()
    } else {
        Applier {
            scope: &scope.id,
            layout,
            control: env.control.as_ref(),
            catalog: Arc::clone(&env.catalog),
            step_timeout: limit,
        }
        .apply(&plan, &snapshot, &mut manifest)
        .await?
    };

    let mut report = ReconcileReport {
        scope: scope.id.clone(),
        dry_run,
        ingest,
        audit: scan.audit,
        records,
        plan,
        apply,
        state: scope.state,
        committed: false,
        push_error: None,
    };

    if let (Some(vcs), false) = (&env.vcs, dry_run) {
        let message = commit_message(&report);
        match with_timeout("publish", limit, vcs::publish(Arc::clone(vcs), message)).await {
            Ok(Ok(committed)) => report.committed = committed,
            Ok(Err(err)) => {
                tracing::warn!("scope {}: publish failed, will retry: {err}", scope.id);
                report.push_error = Some(err.to_string());
            }
            Err(err) => {
                tracing::warn!("scope {}: {err}", scope.id);
                report.push_error = Some(err.to_string());
            }
        }
    }
    Ok(report)
}

/// Every object of every kind the control plane holds for `scope`.
pub async fn fetch_control(
    control: &dyn ControlPlane,
    scope: &ScopeId,
) -> Result<BTreeMap<ObjectIdentity, RemoteObject>, SyncError> {
    let mut out = BTreeMap::new();
    for kind in ObjectKind::all() {
        for remote in control.list(scope, *kind).await? {
            out.insert(remote.document.identity(scope), remote);
        }
    }
    Ok(out)
}

async fn fetch_catalog(
    env: &ReconcileEnv,
    scope: &ScopeId,
    limit: Duration,
) -> Result<BTreeMap<ObjectIdentity, CatalogEntry>, SyncError> {
    let catalog = Arc::clone(&env.catalog);
    let id = scope.clone();
    let entries = with_timeout(
        "catalog",
        limit,
        tokio::task::spawn_blocking(move || catalog.list(&id)),
    )
    .await?
    .map_err(|e| SyncError::Task(e.to_string()))??;
    Ok(entries
        .into_iter()
        .map(|entry| (entry.identity.clone(), entry))
        .collect())
}

fn commit_message(report: &ReconcileReport) -> String {
    format!(
        "trellis: reconcile {} ({} ingested, {} applied)",
        report.scope,
        report.ingest.written(),
        report.apply.applied.len()
    )
}

// ---------------------------------------------------------------------------
// Operator actions
// ---------------------------------------------------------------------------

/// Which side of a conflict wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolveSide {
    File,
    ControlPlane,
}

impl FromStr for ResolveSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file" => Ok(ResolveSide::File),
            "control-plane" => Ok(ResolveSide::ControlPlane),
            other => Err(format!("expected 'file' or 'control-plane', got '{other}'")),
        }
    }
}

impl fmt::Display for ResolveSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResolveSide::File => "file",
            ResolveSide::ControlPlane => "control-plane",
        })
    }
}

/// Settle a field conflict. The chosen side becomes the value the next run
/// converges on.
pub async fn resolve_conflict(
    env: &ReconcileEnv,
    id: &ScopeId,
    key: &str,
    field: &str,
    take: ResolveSide,
) -> Result<(), SyncError> {
    let scope = registry::load_scope_at(&env.home, id)?;
    let layout = ScopeLayout::new(&scope.root);
    let identity = ObjectIdentity::parse_key(id, key)?;
    let _lock = ScopeLock::acquire(&layout)?;
    let mut manifest = manifest::load(&layout)?;

    let scan = scan_tree(id, &layout, &manifest)?;
    let remote = with_timeout("fetch", DEFAULT_STEP_TIMEOUT, env.control.get(&identity)).await??;
    let object = manifest
        .get_mut(&identity)
        .ok_or_else(|| SyncError::UnknownObject(identity.key()))?;
    let no_conflict = || SyncError::NoConflict {
        identity: identity.key(),
        field: field.to_string(),
    };
    let (Some(local), Some(remote), Some(baseline)) =
        (scan.objects.get(&identity), remote, object.baseline.as_mut())
    else {
        return Err(no_conflict());
    };

    let fv = local.document.spec.get(field).cloned();
    let cv = remote.document.spec.get(field).cloned();
    let bv = baseline.get(field).cloned();
    let user_owned = object.ownership.is_user_owned(field) || fv != bv;
    if fv == cv || cv == bv || !user_owned {
        return Err(no_conflict());
    }

    // Rewrite the baseline so the chosen side looks like the only change.
    let agreed = match take {
        ResolveSide::File => cv,
        ResolveSide::ControlPlane => fv,
    };
    match agreed {
        Some(value) => {
            baseline.insert(field.to_string(), value);
        }
        None => {
            baseline.remove(field);
        }
    }
    match take {
        ResolveSide::File => object.ownership.claim(field),
        ResolveSide::ControlPlane => object.ownership.release(field),
    };

    manifest.record(
        ManifestEntry::new(&identity, EntryOutcome::Resolved, Utc::now())
            .with_detail(format!("{field}: take {take}")),
    );
    manifest::save(&layout, &mut manifest)?;
    tracing::info!("resolved {identity} field '{field}' in favour of {take}");
    Ok(())
}

/// Remove an object from the control plane, file tree, catalog and
/// manifest. Refuses while another object references it.
pub async fn prune_object(env: &ReconcileEnv, id: &ScopeId, key: &str) -> Result<(), SyncError> {
    let scope = registry::load_scope_at(&env.home, id)?;
    let layout = ScopeLayout::new(&scope.root);
    let identity = ObjectIdentity::parse_key(id, key)?;
    let _lock = ScopeLock::acquire(&layout)?;
    let mut manifest = manifest::load(&layout)?;

    let scan = scan_tree(id, &layout, &manifest)?;
    let control = with_timeout("fetch", DEFAULT_STEP_TIMEOUT, fetch_control(env.control.as_ref(), id)).await??;
    let known = manifest.contains(&identity)
        || scan.objects.contains_key(&identity)
        || control.contains_key(&identity);
    if !known {
        return Err(SyncError::UnknownObject(identity.key()));
    }

    let mut by: Vec<String> = scan
        .objects
        .iter()
        .map(|(other, local)| (other, &local.document))
        .chain(control.iter().map(|(other, remote)| (other, &remote.document)))
        .filter(|(other, document)| **other != identity && document.referenced(id).contains(&identity))
        .map(|(other, _)| other.key())
        .collect();
    by.sort();
    by.dedup();
    if !by.is_empty() {
        return Err(SyncError::Referenced {
            identity: identity.key(),
            by,
        });
    }

    if control.contains_key(&identity) {
        match with_timeout("delete", DEFAULT_STEP_TIMEOUT, env.control.delete(&identity)).await? {
            Ok(()) => {}
            Err(e) if e.kind == ClientErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    remove_canonical(&layout.canonical_path(&identity), &layout.managed_dir())?;

    let catalog = Arc::clone(&env.catalog);
    let target = identity.clone();
    with_timeout(
        "catalog",
        DEFAULT_STEP_TIMEOUT,
        tokio::task::spawn_blocking(move || -> Result<(), CatalogError> {
            let current = catalog
                .list(&target.scope)?
                .into_iter()
                .find(|e| e.identity == target);
            match current {
                Some(entry) => catalog.remove(&target, &entry.content_hash),
                None => Ok(()),
            }
        }),
    )
    .await?
    .map_err(|e| SyncError::Task(e.to_string()))??;

    manifest.remove(&identity);
    manifest.record(ManifestEntry::new(&identity, EntryOutcome::Pruned, Utc::now()));
    manifest::save(&layout, &mut manifest)?;
    tracing::info!("pruned {identity}");
    Ok(())
}

/// Load a scope's manifest without locking, for read-only reporting.
pub fn read_manifest(scope: &Scope) -> Result<Manifest, SyncError> {
    manifest::load(&ScopeLayout::new(&scope.root))
}
