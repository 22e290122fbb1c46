//! `trellis scope list|show|config|remove`

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};

use trellis_core::{registry, types::ScopeId};

use super::super::ArchiveArg;

/// Inspect and configure registered scopes.
#[derive(Subcommand, Debug)]
pub enum ScopeCommand {
    /// List all registered scopes.
    List,

    /// Print one scope record.
    Show {
        /// Scope identifier.
        scope: String,
    },

    /// Change reconciliation settings of a scope.
    Config(ConfigArgs),

    /// Forget a scope. Refuses while it still manages objects.
    Remove {
        /// Scope identifier.
        scope: String,
    },
}

#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// Scope identifier.
    pub scope: String,

    /// Resume scheduled reconciliation.
    #[arg(long, conflicts_with = "disable")]
    pub enable: bool,

    /// Pause scheduled reconciliation.
    #[arg(long)]
    pub disable: bool,

    /// Seconds between scheduled reconciliations.
    #[arg(long)]
    pub interval: Option<u64>,

    /// How ingested inputs are archived: rename | move.
    #[arg(long, value_name = "STRATEGY")]
    pub archive: Option<ArchiveArg>,

    /// Upper bound for retry backoff in seconds.
    #[arg(long)]
    pub max_backoff: Option<u64>,
}

pub fn run(cmd: ScopeCommand) -> Result<()> {
    match cmd {
        ScopeCommand::List => list(),
        ScopeCommand::Show { scope } => show(&scope),
        ScopeCommand::Config(args) => configure(args),
        ScopeCommand::Remove { scope } => remove(&scope),
    }
}

fn list() -> Result<()> {
    let home = super::home()?;
    let scopes = registry::list_scopes_at(&home).context("failed to load scope registry")?;

    if scopes.is_empty() {
        println!("No scopes registered.");
        println!("Run: trellis init <path> --scope <id>");
        return Ok(());
    }

    for scope in &scopes {
        let enabled = if scope.config.enabled { "" } else { " (disabled)" };
        println!("{} [{}]{}", scope.id, scope.state, enabled);
        println!("  {}", scope.root.display());
    }
    Ok(())
}

fn show(scope: &str) -> Result<()> {
    let home = super::home()?;
    let scope = registry::load_scope_at(&home, &ScopeId::from(scope))
        .with_context(|| format!("unknown scope '{scope}'"))?;

    println!("id:                   {}", scope.id);
    println!("root:                 {}", scope.root.display());
    println!("state:                {}", scope.state);
    println!("enabled:              {}", scope.config.enabled);
    println!("interval:             {}s", scope.config.interval_secs);
    println!("max backoff:          {}s", scope.config.max_backoff_secs);
    println!("archive strategy:     {}", scope.config.archive_strategy);
    if let Some(dir) = &scope.config.control_plane {
        println!("control plane:        {}", dir.display());
    }
    println!("version control:      {}", scope.config.vcs);
    println!("health:               {:.2}", scope.health);
    println!(
        "last run:             {}",
        scope
            .last_run
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string())
    );
    if let Some(next) = scope.next_eligible_at {
        println!("next eligible:        {}", next.to_rfc3339());
    }
    if let Some(err) = &scope.last_error {
        println!("last error:           [{}] {}", err.kind, err.message);
    }
    println!("consecutive failures: {}", scope.consecutive_failures);
    println!("pending conflicts:    {}", scope.pending_conflicts);
    if scope.needs_attention {
        println!("needs attention:      yes");
    }
    if scope.pending_push {
        println!("pending push:         yes");
    }
    Ok(())
}

fn configure(args: ConfigArgs) -> Result<()> {
    let home = super::home()?;
    let id = ScopeId::from(args.scope.as_str());
    if !(args.enable
        || args.disable
        || args.interval.is_some()
        || args.archive.is_some()
        || args.max_backoff.is_some())
    {
        bail!("nothing to change; see `trellis scope config --help`");
    }

    let scope = registry::update_scope_at(&home, &id, |scope| {
        let config = &mut scope.config;
        if args.enable {
            config.enabled = true;
        }
        if args.disable {
            config.enabled = false;
        }
        if let Some(interval) = args.interval {
            config.interval_secs = interval;
        }
        if let Some(archive) = args.archive {
            config.archive_strategy = archive.into();
        }
        if let Some(max_backoff) = args.max_backoff {
            config.max_backoff_secs = max_backoff;
        }
        config.validate()
    })
    .with_context(|| format!("failed to update scope '{id}'"))?;

    println!(
        "✓ '{}': enabled={} interval={}s max-backoff={}s archive={}",
        scope.id,
        scope.config.enabled,
        scope.config.interval_secs,
        scope.config.max_backoff_secs,
        scope.config.archive_strategy,
    );
    Ok(())
}

fn remove(scope: &str) -> Result<()> {
    let home = super::home()?;
    registry::remove_scope_at(&home, &ScopeId::from(scope))
        .with_context(|| format!("failed to remove scope '{scope}'"))?;
    println!("✓ Removed scope '{scope}' (files left in place)");
    Ok(())
}
