//! Version-control seam over a scope's working copy.
//!
//! [`GitCli`] shells out to `git`. Pushes from every scope go through one
//! process-wide funnel since all scopes may share a single upstream.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, OnceLock};

use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VcsError {
    #[error("git executable is not available in PATH")]
    NotInstalled,

    #[error("git command failed: git {args} ({message})")]
    CommandFailed { args: String, message: String },

    /// The remote refused the push (non-fast-forward and similar).
    #[error("push rejected: {message}")]
    Rejected { message: String },
}

impl VcsError {
    /// Whether retrying on a later run can succeed without operator help.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, VcsError::NotInstalled)
    }
}

pub trait VersionControl: Send + Sync {
    fn pull(&self) -> Result<(), VcsError>;

    /// Stage everything and commit. Returns `false` when there was nothing to commit.
    fn commit(&self, message: &str) -> Result<bool, VcsError>;

    fn push(&self) -> Result<(), VcsError>;
}

#[derive(Debug, Clone)]
pub struct GitCli {
    workdir: PathBuf,
}

impl GitCli {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }
}

impl VersionControl for GitCli {
    fn pull(&self) -> Result<(), VcsError> {
        run_git(&self.workdir, &["pull", "--ff-only"]).map(|_| ())
    }

    fn commit(&self, message: &str) -> Result<bool, VcsError> {
        run_git(&self.workdir, &["add", "-A", "--", ".", ":!.meta/lock"])?;
        // `diff --cached --quiet` exits 1 when something is staged.
        if run_git(&self.workdir, &["diff", "--cached", "--quiet"]).is_ok() {
            return Ok(false);
        }
        run_git(&self.workdir, &["commit", "-m", message])?;
        Ok(true)
    }

    fn push(&self) -> Result<(), VcsError> {
        match run_git(&self.workdir, &["push"]) {
            Err(VcsError::CommandFailed { message, .. }) if is_rejection(&message) => {
                Err(VcsError::Rejected { message })
            }
            other => other.map(|_| ()),
        }
    }
}

fn is_rejection(stderr: &str) -> bool {
    ["non-fast-forward", "[rejected]", "fetch first"]
        .iter()
        .any(|marker| stderr.contains(marker))
}

fn run_git(cwd: &Path, args: &[&str]) -> Result<String, VcsError> {
    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                VcsError::NotInstalled
            } else {
                VcsError::CommandFailed {
                    args: args.join(" "),
                    message: e.to_string(),
                }
            }
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let message = if stderr.is_empty() {
            format!("exit status {}", output.status)
        } else {
            stderr
        };
        return Err(VcsError::CommandFailed {
            args: args.join(" "),
            message,
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

// ---------------------------------------------------------------------------
// Async helpers
// ---------------------------------------------------------------------------

fn push_funnel() -> &'static Mutex<()> {
    static FUNNEL: OnceLock<Mutex<()>> = OnceLock::new();
    FUNNEL.get_or_init(|| Mutex::new(()))
}

fn joined(err: tokio::task::JoinError) -> VcsError {
    VcsError::CommandFailed {
        args: "<task>".to_string(),
        message: err.to_string(),
    }
}

pub async fn pull(vcs: Arc<dyn VersionControl>) -> Result<(), VcsError> {
    tokio::task::spawn_blocking(move || vcs.pull())
        .await
        .map_err(joined)?
}

/// Commit then push, holding the global push funnel for the push.
/// Returns whether a commit was made.
pub async fn publish(vcs: Arc<dyn VersionControl>, message: String) -> Result<bool, VcsError> {
    let committer = Arc::clone(&vcs);
    let committed = tokio::task::spawn_blocking(move || committer.commit(&message))
        .await
        .map_err(joined)??;
    let _turn = push_funnel().lock().await;
    tokio::task::spawn_blocking(move || vcs.push())
        .await
        .map_err(joined)??;
    Ok(committed)
}
