//! `trellis ingest|reconcile|resolve|prune`: in-process runs against one scope.

use anyhow::{Context, Result};
use clap::Args;

use trellis_core::{registry, types::ScopeId};
use trellis_daemon::DaemonConfig;
use trellis_sync::ingest::IngestAction;
use trellis_sync::{
    ingest_scope, prune_object, resolve_conflict, run_scope, IngestReport, ReconcileEnv,
    ReconcileReport, ResolveSide,
};

/// Arguments for `trellis ingest`.
#[derive(Args, Debug)]
pub struct IngestArgs {
    /// Scope to ingest.
    pub scope: String,

    /// Parse and report without writing or archiving anything.
    #[arg(long)]
    pub dry_run: bool,
}

impl IngestArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home()?;
        let scope = registry::load_scope_at(&home, &ScopeId::from(self.scope.as_str()))
            .with_context(|| format!("unknown scope '{}'", self.scope))?;
        let report = ingest_scope(&scope, self.dry_run)
            .with_context(|| format!("ingest failed for '{}'", self.scope))?;
        print_ingest(&report, self.dry_run);
        Ok(())
    }
}

/// Arguments for `trellis reconcile`.
#[derive(Args, Debug)]
pub struct ReconcileArgs {
    /// Scope to reconcile.
    pub scope: String,

    /// Also apply operations that need confirmation (deletes, risky updates).
    #[arg(long)]
    pub confirm: bool,

    /// Compute the plan without writing anything or changing scope state.
    #[arg(long)]
    pub dry_run: bool,
}

impl ReconcileArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home()?;
        let id = ScopeId::from(self.scope.as_str());
        let scope = registry::load_scope_at(&home, &id)
            .with_context(|| format!("unknown scope '{id}'"))?;
        let mut options = DaemonConfig::load_at(&home)?.reconcile_options(self.confirm);
        options.dry_run = self.dry_run;

        let env = ReconcileEnv::local_with_home_catalog(&home, &scope);
        let report = super::block_on(run_scope(&env, &id, options))?
            .with_context(|| format!("reconcile failed for '{id}'"))?;
        print_reconcile(&report);
        Ok(())
    }
}

/// Arguments for `trellis resolve`.
#[derive(Args, Debug)]
pub struct ResolveArgs {
    /// Scope holding the conflict.
    pub scope: String,

    /// Object key: <kind>/<namespace>/<name>.
    pub object: String,

    /// Conflicting spec field.
    pub field: String,

    /// Side that wins: file | control-plane.
    #[arg(long, value_name = "SIDE")]
    pub take: ResolveSide,
}

impl ResolveArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home()?;
        let id = ScopeId::from(self.scope.as_str());
        let scope = registry::load_scope_at(&home, &id)
            .with_context(|| format!("unknown scope '{id}'"))?;
        let env = ReconcileEnv::local_with_home_catalog(&home, &scope);
        super::block_on(resolve_conflict(&env, &id, &self.object, &self.field, self.take))?
            .with_context(|| format!("cannot resolve '{}' on {}", self.field, self.object))?;
        println!(
            "✓ {} {}: keeping the {} value; run `trellis reconcile {}` to converge",
            self.object, self.field, self.take, id
        );
        Ok(())
    }
}

/// Arguments for `trellis prune`.
#[derive(Args, Debug)]
pub struct PruneArgs {
    /// Scope holding the object.
    pub scope: String,

    /// Object key: <kind>/<namespace>/<name>.
    pub object: String,
}

impl PruneArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home()?;
        let id = ScopeId::from(self.scope.as_str());
        let scope = registry::load_scope_at(&home, &id)
            .with_context(|| format!("unknown scope '{id}'"))?;
        let env = ReconcileEnv::local_with_home_catalog(&home, &scope);
        super::block_on(prune_object(&env, &id, &self.object))?
            .with_context(|| format!("cannot prune {}", self.object))?;
        println!("✓ Pruned {} from '{}'", self.object, id);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

fn print_ingest(report: &IngestReport, dry_run: bool) {
    let prefix = if dry_run { "[dry-run] " } else { "" };
    if report.files.is_empty() {
        println!("{prefix}✓ nothing to ingest");
        return;
    }

    for file in &report.files {
        println!("{prefix}{} ({:?})", file.source.display(), file.status);
        for object in &file.objects {
            let mark = match object.action {
                IngestAction::Created | IngestAction::Updated => "✎",
                IngestAction::WouldWrite => "~",
                IngestAction::Unchanged | IngestAction::Adopted => "·",
            };
            println!("  {mark}  {}", object.path.display());
        }
        for error in &file.errors {
            println!("  ✗  {error}");
        }
    }
    println!(
        "{prefix}{} written, {} error(s)",
        report.written(),
        report.errors().count()
    );
}

fn print_reconcile(report: &ReconcileReport) {
    let prefix = if report.dry_run { "[dry-run] " } else { "" };
    if !report.ingest.files.is_empty() {
        print_ingest(&report.ingest, report.dry_run);
    }
    for error in &report.audit.invalid {
        println!("{prefix}✗  {error}");
    }

    if report.dry_run {
        for record in &report.plan.ops {
            println!(
                "{prefix}~  {} {} on {}",
                record.op.label(),
                record.identity.key(),
                record.target
            );
        }
    } else {
        for record in &report.apply.applied {
            println!(
                "  ✎  {} {} on {}",
                record.op.label(),
                record.identity.key(),
                record.target
            );
        }
    }
    for record in &report.plan.held {
        let why = record.reason.as_deref().unwrap_or("needs --confirm");
        println!(
            "{prefix}!  {} {} on {} held: {why}",
            record.op.label(),
            record.identity.key(),
            record.target
        );
    }
    for rejection in &report.apply.rejected {
        println!(
            "  ✗  {} on {}: {}",
            rejection.identity.key(),
            rejection.target,
            rejection.message
        );
    }
    if let Some(err) = &report.push_error {
        println!("  !  push failed, will retry: {err}");
    }

    let applied = if report.dry_run {
        report.plan.ops.len()
    } else {
        report.apply.applied.len()
    };
    println!(
        "{prefix}✓ '{}' {} ({} applied, {} unresolved, {} conflict(s))",
        report.scope,
        report.state,
        applied,
        report.unresolved(),
        report.conflicts(),
    );
}
