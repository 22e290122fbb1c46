//! `trellis daemon`: background scheduler lifecycle.

use std::path::Path;

use anyhow::{Context, Result};
use clap::Subcommand;
use serde_json::json;

use trellis_daemon::{
    request_status, request_stop, request_trigger, start_blocking, DaemonError, TriggerOutcome,
};

#[derive(Subcommand, Debug)]
pub enum DaemonCommand {
    /// Run the daemon in the foreground until stopped.
    Start,
    /// Ask a running daemon to drain and exit.
    Stop,
    /// Print the daemon's per-scope runtime status as JSON.
    Status {
        /// Narrow the report to one scope.
        #[arg(long)]
        scope: Option<String>,
    },
    /// Ask the running daemon to reconcile a scope now.
    Trigger {
        /// Scope to reconcile.
        scope: String,

        /// Also apply operations that need confirmation.
        #[arg(long)]
        confirm: bool,
    },
}

pub fn run(command: DaemonCommand) -> Result<()> {
    let home = super::home()?;
    match command {
        DaemonCommand::Start => start_blocking(&home).context("daemon exited with error"),
        DaemonCommand::Stop => stop(&home),
        DaemonCommand::Status { scope } => status(&home, scope),
        DaemonCommand::Trigger { scope, confirm } => trigger(&home, &scope, confirm),
    }
}

fn stop(home: &Path) -> Result<()> {
    match request_stop(home) {
        Ok(()) => println!("daemon stop requested"),
        Err(DaemonError::DaemonNotRunning { socket }) => {
            println!("daemon is not running ({})", socket.display());
        }
        Err(err) => return Err(err).context("failed to stop daemon"),
    }
    Ok(())
}

fn status(home: &Path, scope: Option<String>) -> Result<()> {
    let report = match request_status(home, scope) {
        Ok(report) => report,
        Err(DaemonError::DaemonNotRunning { socket }) => json!({
            "running": false,
            "socket": socket.display().to_string(),
        }),
        Err(err) => return Err(err).context("failed to query daemon status"),
    };
    let rendered =
        serde_json::to_string_pretty(&report).context("failed to render daemon status JSON")?;
    println!("{rendered}");
    Ok(())
}

fn trigger(home: &Path, scope: &str, confirm: bool) -> Result<()> {
    let outcome = request_trigger(home, scope, confirm)
        .with_context(|| format!("failed to trigger '{scope}'"))?;
    let line = match outcome {
        TriggerOutcome::Accepted => format!("✓ '{scope}' reconciliation started"),
        TriggerOutcome::Queued => format!("✓ '{scope}' is busy; queued one more run"),
        TriggerOutcome::Rejected => format!("'{scope}' already has a run queued"),
        TriggerOutcome::Dropped => format!("'{scope}' is busy; trigger dropped"),
        TriggerOutcome::Deferred => {
            format!("'{scope}' is backing off after a failure; it will retry when the window ends")
        }
    };
    println!("{line}");
    Ok(())
}
