//! Per-scope single-flight dispatch over a bounded worker pool.
//!
//! Each scope has a slot. A trigger for an idle scope claims the slot and
//! spawns a task; the task then waits for a worker permit. While the slot is
//! busy, one manual or watcher trigger is remembered and runs as soon as the
//! current one finishes; anything beyond that is rejected. Scheduled triggers
//! for a busy scope are simply dropped: the next tick will see it again.
//! Manual and watcher triggers for a scope still inside its failure backoff
//! are deferred and folded into the scheduled retry once the window closes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use trellis_core::registry;
use trellis_core::types::{Scope, ScopeId};
use trellis_core::ScopeLayout;
use trellis_sync::lock::ScopeLock;
use trellis_sync::catalog::FileCatalog;
use trellis_sync::{run_scope, ReconcileEnv, ReconcileReport};

use crate::config::DaemonConfig;
use crate::error::DaemonError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TriggerSource {
    Schedule,
    Watcher,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TriggerOutcome {
    /// A run was started for this trigger.
    Accepted,
    /// The scope is busy; this trigger runs right after the current one.
    Queued,
    /// The scope is busy and already has a trigger waiting.
    Rejected,
    /// Scheduled trigger for a busy scope; nothing to do.
    Dropped,
    /// The scope is backing off after a failure; the retry at the end of the
    /// window covers this trigger.
    Deferred,
}

/// Short result of one run, kept for status queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub scope: ScopeId,
    pub finished_at: DateTime<Utc>,
    pub ok: bool,
    pub applied: usize,
    pub unresolved: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunSummary {
    fn from_report(report: &ReconcileReport) -> Self {
        Self {
            scope: report.scope.clone(),
            finished_at: Utc::now(),
            ok: true,
            applied: report.apply.applied.len(),
            unresolved: report.unresolved(),
            error: None,
        }
    }

    fn failed(scope: &ScopeId, error: impl Into<String>) -> Self {
        Self {
            scope: scope.clone(),
            finished_at: Utc::now(),
            ok: false,
            applied: 0,
            unresolved: 0,
            error: Some(error.into()),
        }
    }
}

/// Executes one reconciliation for a scope.
#[async_trait]
pub trait ScopeRunner: Send + Sync {
    async fn run(&self, scope: &ScopeId, confirm: bool) -> RunSummary;
}

/// Reconciles against the scope's configured local control plane and the
/// catalog under `home`. Every run shares one catalog handle, so catalog
/// writes are serialized across scopes.
#[derive(Debug, Clone)]
pub struct LocalRunner {
    home: PathBuf,
    config: DaemonConfig,
    catalog: Arc<FileCatalog>,
}

impl LocalRunner {
    pub fn new(home: &Path, config: DaemonConfig) -> Self {
        Self {
            home: home.to_path_buf(),
            config,
            catalog: Arc::new(FileCatalog::at_home(home)),
        }
    }

    pub fn catalog(&self) -> &Arc<FileCatalog> {
        &self.catalog
    }

    fn env(&self, record: &Scope) -> ReconcileEnv {
        ReconcileEnv::local(&self.home, record, self.catalog.clone())
    }
}

#[async_trait]
impl ScopeRunner for LocalRunner {
    async fn run(&self, scope: &ScopeId, confirm: bool) -> RunSummary {
        let record = match registry::load_scope_at(&self.home, scope) {
            Ok(record) => record,
            Err(err) => return RunSummary::failed(scope, err.to_string()),
        };
        let env = self.env(&record);
        match run_scope(&env, scope, self.config.reconcile_options(confirm)).await {
            Ok(report) => RunSummary::from_report(&report),
            Err(err) => RunSummary::failed(scope, err.to_string()),
        }
    }
}

#[derive(Debug, Default)]
struct Slot {
    running: bool,
    /// `Some(confirm)` when a trigger is waiting.
    pending: Option<bool>,
    /// `Some(confirm)` when a trigger arrived during a backoff window.
    deferred: Option<bool>,
    last: Option<RunSummary>,
}

/// What the scheduler knows about a scope right now.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SlotStatus {
    pub in_flight: bool,
    pub pending: bool,
    pub deferred: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last: Option<RunSummary>,
}

pub struct Scheduler {
    runner: Arc<dyn ScopeRunner>,
    permits: Arc<Semaphore>,
    max_workers: usize,
    slots: Mutex<HashMap<ScopeId, Slot>>,
}

impl Scheduler {
    pub fn new(runner: Arc<dyn ScopeRunner>, max_workers: usize) -> Arc<Self> {
        let max_workers = max_workers.max(1);
        Arc::new(Self {
            runner,
            permits: Arc::new(Semaphore::new(max_workers)),
            max_workers,
            slots: Mutex::new(HashMap::new()),
        })
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<ScopeId, Slot>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim the scope's slot or record the trigger against it. Never waits
    /// for the run itself.
    pub fn trigger(self: &Arc<Self>, scope: &ScopeId, source: TriggerSource, confirm: bool) -> TriggerOutcome {
        let (outcome, confirm) = {
            let mut slots = self.slots();
            let slot = slots.entry(scope.clone()).or_default();
            if !slot.running {
                slot.running = true;
                let deferred = slot.deferred.take().unwrap_or(false);
                (TriggerOutcome::Accepted, confirm || deferred)
            } else if source == TriggerSource::Schedule {
                (TriggerOutcome::Dropped, confirm)
            } else if slot.pending.is_none() {
                slot.pending = Some(confirm);
                (TriggerOutcome::Queued, confirm)
            } else {
                (TriggerOutcome::Rejected, confirm)
            }
        };
        tracing::debug!(scope = %scope, source = ?source, outcome = ?outcome, "trigger");
        if outcome == TriggerOutcome::Accepted {
            let this = Arc::clone(self);
            let scope = scope.clone();
            tokio::spawn(async move { this.drive(scope, confirm).await });
        }
        outcome
    }

    /// Like [`Scheduler::trigger`], but honours the record's failure backoff
    /// for manual and watcher triggers.
    pub fn trigger_scope(
        self: &Arc<Self>,
        scope: &Scope,
        source: TriggerSource,
        confirm: bool,
        now: DateTime<Utc>,
    ) -> TriggerOutcome {
        if source != TriggerSource::Schedule {
            if let Some(until) = scope.backoff_until(now) {
                let mut slots = self.slots();
                let slot = slots.entry(scope.id.clone()).or_default();
                if !slot.running {
                    slot.deferred = Some(slot.deferred.unwrap_or(false) || confirm);
                    tracing::debug!(scope = %scope.id, source = ?source, %until, "trigger deferred by backoff");
                    return TriggerOutcome::Deferred;
                }
            }
        }
        self.trigger(&scope.id, source, confirm)
    }

    /// Run `scope`, then any trigger that arrived meanwhile, then free the slot.
    async fn drive(self: Arc<Self>, scope: ScopeId, mut confirm: bool) {
        loop {
            let permit = match Arc::clone(&self.permits).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    tracing::debug!(scope = %scope, "worker pool closed; run skipped");
                    self.release(&scope);
                    return;
                }
            };
            tracing::info!(scope = %scope, confirm, "reconciliation dispatched");
            let summary = self.runner.run(&scope, confirm).await;
            drop(permit);
            if summary.ok {
                tracing::info!(
                    scope = %scope,
                    applied = summary.applied,
                    unresolved = summary.unresolved,
                    "reconciliation finished",
                );
            } else {
                tracing::warn!(
                    scope = %scope,
                    error = summary.error.as_deref().unwrap_or_default(),
                    "reconciliation failed",
                );
            }

            let mut slots = self.slots();
            let slot = slots.entry(scope.clone()).or_default();
            slot.last = Some(summary);
            match slot.pending.take() {
                Some(next) => confirm = next,
                None => {
                    slot.running = false;
                    return;
                }
            }
        }
    }

    fn release(&self, scope: &ScopeId) {
        let mut slots = self.slots();
        if let Some(slot) = slots.get_mut(scope) {
            slot.running = false;
            slot.pending = None;
        }
    }

    pub fn status(&self, scope: &ScopeId) -> SlotStatus {
        let slots = self.slots();
        slots
            .get(scope)
            .map(|slot| SlotStatus {
                in_flight: slot.running,
                pending: slot.pending.is_some(),
                deferred: slot.deferred.is_some(),
                last: slot.last.clone(),
            })
            .unwrap_or_default()
    }

    pub fn in_flight(&self) -> usize {
        self.slots().values().filter(|slot| slot.running).count()
    }

    /// One master-loop pass: recover runs that died holding `syncing`, then
    /// trigger every scope that is due.
    pub async fn tick(self: &Arc<Self>, home: &Path) -> Result<Vec<ScopeId>, DaemonError> {
        let home = home.to_path_buf();
        let scopes = tokio::task::spawn_blocking(move || {
            recover_interrupted_at(&home)?;
            registry::list_scopes_at(&home).map_err(DaemonError::from)
        })
        .await
        .map_err(|err| DaemonError::Protocol(format!("scope listing join error: {err}")))??;
        let now = Utc::now();
        let mut dispatched = Vec::new();
        for scope in scopes.iter().filter(|s| s.is_due(now)) {
            if self.trigger(&scope.id, TriggerSource::Schedule, false) == TriggerOutcome::Accepted {
                dispatched.push(scope.id.clone());
            }
        }
        Ok(dispatched)
    }

    /// Stop handing out permits and wait up to `grace` for running tasks.
    pub async fn drain(&self, grace: Duration) {
        let permits = u32::try_from(self.max_workers).unwrap_or(u32::MAX);
        match tokio::time::timeout(grace, self.permits.acquire_many(permits)).await {
            Ok(Ok(_all)) => tracing::info!("all reconciliations finished"),
            Ok(Err(_)) => {}
            Err(_) => tracing::warn!(in_flight = self.in_flight(), "shutting down with runs in flight"),
        }
        self.permits.close();
    }
}

/// Move records left in `syncing` by a dead process to `error`, due now.
/// Scopes whose lock is still held belong to a live run and are left alone;
/// the record is re-read under the lock, so a run that just finished is not
/// touched.
pub fn recover_interrupted_at(home: &Path) -> Result<Vec<ScopeId>, DaemonError> {
    let mut recovered = Vec::new();
    for scope in registry::list_scopes_at(home)? {
        if !scope.state.is_syncing() {
            continue;
        }
        let Ok(_lock) = ScopeLock::acquire(&ScopeLayout::new(&scope.root)) else {
            continue;
        };
        let mut changed = false;
        registry::update_scope_at(home, &scope.id, |record| {
            changed = record.recover_interrupted(Utc::now());
            Ok(())
        })?;
        if !changed {
            continue;
        }
        tracing::warn!(scope = %scope.id, "previous run was interrupted; retrying");
        recovered.push(scope.id);
    }
    Ok(recovered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    /// Blocks every run until released; counts runs and peak concurrency.
    #[derive(Default)]
    struct Gate {
        release: Notify,
        started: AtomicUsize,
        active: AtomicUsize,
        peak: AtomicUsize,
        confirms: Mutex<Vec<bool>>,
    }

    #[async_trait]
    impl ScopeRunner for Gate {
        async fn run(&self, scope: &ScopeId, confirm: bool) -> RunSummary {
            self.started.fetch_add(1, Ordering::SeqCst);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.confirms.lock().unwrap().push(confirm);
            self.release.notified().await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            RunSummary {
                scope: scope.clone(),
                finished_at: Utc::now(),
                ok: true,
                applied: 0,
                unresolved: 0,
                error: None,
            }
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn busy_scope_queues_one_trigger_and_rejects_the_rest() {
        let gate = Arc::new(Gate::default());
        let scheduler = Scheduler::new(gate.clone(), 4);
        let scope = ScopeId::from("east");

        assert_eq!(scheduler.trigger(&scope, TriggerSource::Manual, false), TriggerOutcome::Accepted);
        settle().await;
        assert_eq!(scheduler.trigger(&scope, TriggerSource::Schedule, false), TriggerOutcome::Dropped);
        assert_eq!(scheduler.trigger(&scope, TriggerSource::Watcher, false), TriggerOutcome::Queued);
        assert_eq!(scheduler.trigger(&scope, TriggerSource::Manual, true), TriggerOutcome::Rejected);
        assert!(scheduler.status(&scope).pending);

        gate.release.notify_one();
        settle().await;
        assert_eq!(gate.started.load(Ordering::SeqCst), 2, "queued trigger runs next");
        assert_eq!(gate.peak.load(Ordering::SeqCst), 1, "never two runs for one scope");

        gate.release.notify_one();
        settle().await;
        let status = scheduler.status(&scope);
        assert!(!status.in_flight);
        assert!(!status.pending);
        assert!(status.last.unwrap().ok);
        assert_eq!(*gate.confirms.lock().unwrap(), vec![false, false]);
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn worker_pool_bounds_concurrency_across_scopes() {
        let gate = Arc::new(Gate::default());
        let scheduler = Scheduler::new(gate.clone(), 2);
        for name in ["a", "b", "c", "d"] {
            assert_eq!(
                scheduler.trigger(&ScopeId::from(name), TriggerSource::Schedule, false),
                TriggerOutcome::Accepted
            );
        }
        settle().await;
        assert_eq!(gate.started.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.in_flight(), 4, "slots are claimed before permits");

        gate.release.notify_waiters();
        settle().await;
        assert_eq!(gate.started.load(Ordering::SeqCst), 4);
        gate.release.notify_waiters();
        settle().await;
        assert_eq!(gate.peak.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.in_flight(), 0);
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn drain_gives_up_after_grace_period() {
        let gate = Arc::new(Gate::default());
        let scheduler = Scheduler::new(gate.clone(), 1);
        scheduler.trigger(&ScopeId::from("slow"), TriggerSource::Manual, false);
        settle().await;

        scheduler.drain(Duration::from_secs(5)).await;
        assert_eq!(scheduler.in_flight(), 1);
        assert_eq!(
            scheduler.trigger(&ScopeId::from("other"), TriggerSource::Manual, false),
            TriggerOutcome::Accepted
        );
        settle().await;
        assert_eq!(gate.started.load(Ordering::SeqCst), 1, "closed pool starts nothing new");
        assert!(!scheduler.status(&ScopeId::from("other")).in_flight);
    }

    #[test]
    fn local_runs_share_one_catalog() {
        let home = tempfile::TempDir::new().expect("home");
        let runner = LocalRunner::new(home.path(), DaemonConfig::default());
        let east = Scope::new(
            ScopeId::from("east"),
            home.path().join("east"),
            trellis_core::types::ScopeConfig::default(),
        );
        let west = Scope::new(
            ScopeId::from("west"),
            home.path().join("west"),
            trellis_core::types::ScopeConfig::default(),
        );
        let shared = Arc::as_ptr(runner.catalog()).cast::<()>();
        for env in [runner.env(&east), runner.env(&west)] {
            assert_eq!(Arc::as_ptr(&env.catalog).cast::<()>(), shared);
        }
    }

    fn failed_scope(now: DateTime<Utc>) -> Scope {
        let mut scope = Scope::new(
            ScopeId::from("east"),
            PathBuf::from("/srv/east"),
            trellis_core::types::ScopeConfig::default(),
        );
        scope.begin_run(now).unwrap();
        scope
            .finish_failure(now, trellis_core::ScopeErrorKind::Connectivity, "down", 3)
            .unwrap();
        scope
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn triggers_inside_backoff_wait_for_the_scheduled_retry() {
        let gate = Arc::new(Gate::default());
        let scheduler = Scheduler::new(gate.clone(), 4);
        let now = Utc::now();
        let scope = failed_scope(now);

        assert_eq!(
            scheduler.trigger_scope(&scope, TriggerSource::Watcher, false, now),
            TriggerOutcome::Deferred
        );
        assert_eq!(
            scheduler.trigger_scope(&scope, TriggerSource::Manual, true, now),
            TriggerOutcome::Deferred
        );
        settle().await;
        assert_eq!(gate.started.load(Ordering::SeqCst), 0, "no run inside the window");
        assert!(scheduler.status(&scope.id).deferred);

        let after = scope.next_eligible_at.unwrap();
        assert!(scope.is_due(after));
        assert_eq!(
            scheduler.trigger(&scope.id, TriggerSource::Schedule, false),
            TriggerOutcome::Accepted
        );
        settle().await;
        assert_eq!(*gate.confirms.lock().unwrap(), vec![true], "deferred confirm carried over");
        assert!(!scheduler.status(&scope.id).deferred);
        gate.release.notify_one();
        settle().await;

        assert_eq!(
            scheduler.trigger_scope(&scope, TriggerSource::Manual, false, after),
            TriggerOutcome::Accepted,
            "window closed"
        );
        gate.release.notify_one();
        settle().await;
    }

    #[test]
    fn crashed_run_is_recovered_despite_leftover_lock_file() {
        let home = tempfile::TempDir::new().expect("home");
        let workspace = tempfile::TempDir::new().expect("workspace");
        let id = ScopeId::from("east");
        let scope = registry::init_at(
            workspace.path().join("east"),
            id.clone(),
            trellis_core::types::ScopeConfig::default(),
            home.path(),
        )
        .expect("init");
        registry::update_scope_at(home.path(), &id, |record| record.begin_run(Utc::now()))
            .expect("mark syncing");
        let layout = ScopeLayout::new(&scope.root);
        std::fs::create_dir_all(layout.meta_dir()).unwrap();
        std::fs::write(layout.lock_path(), "pid=999999\n").unwrap();

        let recovered = recover_interrupted_at(home.path()).expect("recover");

        assert_eq!(recovered, vec![id.clone()]);
        let record = registry::load_scope_at(home.path(), &id).unwrap();
        assert_eq!(record.state, trellis_core::ScopeState::Error);
        assert!(record.is_due(Utc::now()));
    }

    #[test]
    fn live_run_is_not_recovered() {
        let home = tempfile::TempDir::new().expect("home");
        let workspace = tempfile::TempDir::new().expect("workspace");
        let id = ScopeId::from("east");
        let scope = registry::init_at(
            workspace.path().join("east"),
            id.clone(),
            trellis_core::types::ScopeConfig::default(),
            home.path(),
        )
        .expect("init");
        registry::update_scope_at(home.path(), &id, |record| record.begin_run(Utc::now()))
            .expect("mark syncing");
        let _held = ScopeLock::acquire(&ScopeLayout::new(&scope.root)).expect("lock");

        assert!(recover_interrupted_at(home.path()).expect("recover").is_empty());
        let record = registry::load_scope_at(home.path(), &id).unwrap();
        assert!(record.state.is_syncing());
    }
}
