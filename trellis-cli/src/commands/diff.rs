//! `trellis diff <scope>`: show what the next reconciliation would change.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use trellis_core::{registry, types::ScopeId};
use trellis_sync::{diff_scope, ReconcileEnv};

/// Arguments for `trellis diff`.
#[derive(Args, Debug)]
pub struct DiffArgs {
    /// Scope to diff.
    pub scope: String,
}

impl DiffArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home()?;
        let id = ScopeId::from(self.scope.as_str());
        let scope = registry::load_scope_at(&home, &id)
            .with_context(|| format!("unknown scope '{id}'"))?;
        let env = ReconcileEnv::local_with_home_catalog(&home, &scope);

        let preview = super::block_on(diff_scope(&env, &id))?
            .with_context(|| format!("diff failed for '{id}'"))?;

        for input in &preview.pending_inputs {
            println!("{} {}", "pending input:".yellow(), input.display());
        }
        if preview.diffs.is_empty() {
            println!("No differences for '{}'.", preview.scope);
            return Ok(());
        }

        for diff in preview.diffs {
            let header = format!("{} {} on {}", diff.op, diff.identity.key(), diff.target);
            println!("{}", header.bold());
            if let Some(note) = &diff.note {
                println!("# {note}");
            }
            print!("{}", diff.unified_diff);
            if !diff.unified_diff.is_empty() && !diff.unified_diff.ends_with('\n') {
                println!();
            }
        }

        Ok(())
    }
}
