//! `trellis init <path> --scope <id> [...]`

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use trellis_core::{registry, types::ScopeConfig, types::ScopeId};

use super::super::ArchiveArg;

/// Register a scope rooted at a directory.
#[derive(Args, Debug)]
pub struct InitArgs {
    /// Directory holding the scope's canonical tree. Created if missing.
    pub path: PathBuf,

    /// Scope identifier (e.g. "fabric-east"). Creates ~/.trellis/scopes/<id>.yaml
    #[arg(long, short = 's')]
    pub scope: String,

    /// Seconds between scheduled reconciliations.
    #[arg(long)]
    pub interval: Option<u64>,

    /// How ingested inputs are archived: rename | move.
    #[arg(long, value_name = "STRATEGY")]
    pub archive: Option<ArchiveArg>,

    /// Directory backing the local control plane.
    #[arg(long, value_name = "DIR")]
    pub control_plane: Option<PathBuf>,

    /// Commit and push the scope root after each run.
    #[arg(long)]
    pub vcs: bool,
}

impl InitArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home()?;
        fs::create_dir_all(&self.path)
            .with_context(|| format!("cannot create '{}'", self.path.display()))?;
        let path = self
            .path
            .canonicalize()
            .with_context(|| format!("cannot resolve path '{}'", self.path.display()))?;

        let mut config = ScopeConfig::default();
        if let Some(interval) = self.interval {
            config.interval_secs = interval;
            config.max_backoff_secs = config.max_backoff_secs.max(interval);
        }
        if let Some(archive) = self.archive {
            config.archive_strategy = archive.into();
        }
        if let Some(dir) = self.control_plane {
            fs::create_dir_all(&dir)
                .with_context(|| format!("cannot create '{}'", dir.display()))?;
            config.control_plane = Some(dir.canonicalize()?);
        }
        config.vcs = self.vcs;

        let scope = registry::init_at(path.clone(), ScopeId::from(self.scope), config, &home)
            .with_context(|| format!("failed to init scope at '{}'", path.display()))?;

        println!("✓ Registered scope '{}' at {}", scope.id, scope.root.display());
        println!("  Saved to: ~/.trellis/scopes/{}.yaml", scope.id);
        println!("  Drop inputs into: {}", scope.root.join("raw").display());
        Ok(())
    }
}
