//! `trellis status`: lifecycle state across scopes.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use trellis_core::{registry, Scope, ScopeState};

/// Arguments for `trellis status`.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Filter to one scope.
    #[arg(long)]
    pub scope: Option<String>,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

impl StatusArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home()?;

        let mut scopes = registry::list_scopes_at(&home)
            .context("failed to load scope registry; run `trellis init` first")?;
        if let Some(filter) = self.scope.as_ref() {
            scopes.retain(|scope| scope.id.0 == *filter);
            if scopes.is_empty() {
                anyhow::bail!("unknown scope '{filter}'");
            }
        }

        if self.json {
            print_json(&scopes)?;
            return Ok(());
        }

        print_table(&scopes);
        Ok(())
    }
}

#[derive(Serialize)]
struct StatusReportJson<'a> {
    summary: StatusSummaryJson,
    scopes: Vec<ScopeStatusJson<'a>>,
}

#[derive(Serialize)]
struct StatusSummaryJson {
    scopes: usize,
    in_sync: usize,
    drifted: usize,
    error: usize,
}

#[derive(Serialize)]
struct ScopeStatusJson<'a> {
    scope: &'a str,
    state: ScopeState,
    enabled: bool,
    last_run: Option<DateTime<Utc>>,
    next_eligible_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    consecutive_failures: u32,
    pending_conflicts: usize,
    needs_attention: bool,
    pending_push: bool,
    health: f64,
}

#[derive(Tabled)]
struct StatusTableRow {
    #[tabled(rename = "scope")]
    scope: String,
    #[tabled(rename = "state")]
    state: String,
    #[tabled(rename = "last run")]
    last_run: String,
    #[tabled(rename = "conflicts")]
    conflicts: usize,
    #[tabled(rename = "detail")]
    detail: String,
}

fn count(scopes: &[Scope], state: ScopeState) -> usize {
    scopes.iter().filter(|s| s.state == state).count()
}

fn print_json(scopes: &[Scope]) -> Result<()> {
    let payload = StatusReportJson {
        summary: StatusSummaryJson {
            scopes: scopes.len(),
            in_sync: count(scopes, ScopeState::SyncedInSync),
            drifted: count(scopes, ScopeState::SyncedDrifted),
            error: count(scopes, ScopeState::Error),
        },
        scopes: scopes
            .iter()
            .map(|scope| ScopeStatusJson {
                scope: &scope.id.0,
                state: scope.state,
                enabled: scope.config.enabled,
                last_run: scope.last_run,
                next_eligible_at: scope.next_eligible_at,
                last_error: scope
                    .last_error
                    .as_ref()
                    .map(|e| format!("{}: {}", e.kind, e.message)),
                consecutive_failures: scope.consecutive_failures,
                pending_conflicts: scope.pending_conflicts,
                needs_attention: scope.needs_attention,
                pending_push: scope.pending_push,
                health: scope.health,
            })
            .collect(),
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&payload).context("failed to serialize status JSON")?
    );
    Ok(())
}

fn print_table(scopes: &[Scope]) {
    println!(
        "Trellis v{} | {} scopes | {} drifted | {} in error",
        env!("CARGO_PKG_VERSION"),
        scopes.len(),
        count(scopes, ScopeState::SyncedDrifted),
        count(scopes, ScopeState::Error),
    );

    if scopes.is_empty() {
        println!("No scopes registered.");
        return;
    }

    let rows: Vec<StatusTableRow> = scopes
        .iter()
        .map(|scope| StatusTableRow {
            scope: scope.id.0.clone(),
            state: format!("{} {}", state_indicator(scope.state), scope.state),
            last_run: scope
                .last_run
                .map(format_age)
                .unwrap_or_else(|| "never".to_string()),
            conflicts: scope.pending_conflicts,
            detail: detail(scope),
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");

    if scopes.iter().any(|s| s.needs_attention) {
        println!(
            "{}",
            "Some scopes need attention: repeated authorization failures.".red()
        );
    }
}

fn state_indicator(state: ScopeState) -> String {
    match state {
        ScopeState::NeverSynced => "■".bright_black().bold().to_string(),
        ScopeState::Syncing => "■".blue().bold().to_string(),
        ScopeState::SyncedInSync => "■".green().bold().to_string(),
        ScopeState::SyncedDrifted => "■".yellow().bold().to_string(),
        ScopeState::Error => "■".red().bold().to_string(),
    }
}

fn detail(scope: &Scope) -> String {
    let mut parts = Vec::new();
    if !scope.config.enabled {
        parts.push("disabled".to_string());
    }
    if let Some(err) = &scope.last_error {
        parts.push(format!("{}: {}", err.kind, err.message));
    }
    if scope.needs_attention {
        parts.push("needs attention".to_string());
    }
    if scope.pending_push {
        parts.push("push pending".to_string());
    }
    if parts.is_empty() {
        "ok".to_string()
    } else {
        parts.join("; ")
    }
}

fn format_age(at: DateTime<Utc>) -> String {
    let secs = (Utc::now() - at).num_seconds().max(0);
    match secs {
        0..=59 => format!("{secs}s ago"),
        60..=3599 => format!("{}m ago", secs / 60),
        3600..=86_399 => format!("{}h ago", secs / 3600),
        _ => format!("{}d ago", secs / 86_400),
    }
}
