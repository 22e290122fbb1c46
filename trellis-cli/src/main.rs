//! Trellis: three-way configuration reconciliation CLI.
//!
//! # Usage
//!
//! ```text
//! trellis init <path> --scope <id> [--interval N] [--archive rename|move] [--control-plane DIR] [--vcs]
//! trellis scope list | show <id> | config <id> [...] | remove <id>
//! trellis ingest <scope> [--dry-run]
//! trellis reconcile <scope> [--confirm] [--dry-run]
//! trellis diff <scope>
//! trellis resolve <scope> <kind>/<namespace>/<name> <field> --take file|control-plane
//! trellis prune <scope> <kind>/<namespace>/<name>
//! trellis status [--scope <id>] [--json]
//! trellis daemon start|stop|status|trigger <scope> [--confirm]
//! ```

mod commands;

use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    daemon::DaemonCommand, diff::DiffArgs, init::InitArgs, reconcile::IngestArgs,
    reconcile::PruneArgs, reconcile::ReconcileArgs, reconcile::ResolveArgs, scope::ScopeCommand,
    status::StatusArgs,
};
use trellis_core::types::ArchiveStrategy;

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "trellis",
    version,
    about = "Reconcile infrastructure configuration across files, control plane and catalog",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Register a scope rooted at a directory.
    Init(InitArgs),

    /// Inspect and configure registered scopes.
    Scope {
        #[command(subcommand)]
        command: ScopeCommand,
    },

    /// Turn raw inputs into canonical files without touching remote systems.
    Ingest(IngestArgs),

    /// Run one full reconciliation of a scope.
    Reconcile(ReconcileArgs),

    /// Show what the next reconciliation would change.
    Diff(DiffArgs),

    /// Settle a field conflict in favour of one side.
    Resolve(ResolveArgs),

    /// Remove an object from every representation.
    Prune(PruneArgs),

    /// Show lifecycle state across scopes.
    Status(StatusArgs),

    /// Run and talk to the background scheduler.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
}

// ---------------------------------------------------------------------------
// Shared ArchiveStrategy argument
// ---------------------------------------------------------------------------

/// Thin wrapper so clap can parse `ArchiveStrategy` from CLI args.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArchiveArg(pub ArchiveStrategy);

impl FromStr for ArchiveArg {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rename" | "rename-with-suffix" => Ok(Self(ArchiveStrategy::RenameWithSuffix)),
            "move" | "move-to-archive-dir" => Ok(Self(ArchiveStrategy::MoveToArchiveDir)),
            other => Err(format!(
                "unknown archive strategy '{other}'; expected: rename, move"
            )),
        }
    }
}

impl fmt::Display for ArchiveArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<ArchiveArg> for ArchiveStrategy {
    fn from(a: ArchiveArg) -> Self {
        a.0
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();

    // The daemon installs its own subscriber, which also captures `log` records.
    if !matches!(
        cli.command,
        Commands::Daemon {
            command: DaemonCommand::Start
        }
    ) {
        let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
            .try_init();
    }

    match cli.command {
        Commands::Init(args) => args.run(),
        Commands::Scope { command } => commands::scope::run(command),
        Commands::Ingest(args) => args.run(),
        Commands::Reconcile(args) => args.run(),
        Commands::Diff(args) => args.run(),
        Commands::Resolve(args) => args.run(),
        Commands::Prune(args) => args.run(),
        Commands::Status(args) => args.run(),
        Commands::Daemon { command } => commands::daemon::run(command),
    }
}
