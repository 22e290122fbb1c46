//! Cross-process single-writer lock for a scope's file tree.
//!
//! An exclusive advisory lock on `<scope root>/.meta/lock`. The file stays
//! on disk between runs and records the current holder's pid and acquisition
//! time; the lock itself is released when the guard drops or the holding
//! process dies.

use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use fs2::FileExt;

use trellis_core::layout::ScopeLayout;

use crate::error::{io_err, SyncError};

#[derive(Debug)]
pub struct ScopeLock {
    path: PathBuf,
    file: File,
}

impl ScopeLock {
    /// Never blocks: a held lock is reported as [`SyncError::LockBusy`].
    pub fn acquire(layout: &ScopeLayout) -> Result<Self, SyncError> {
        let path = layout.lock_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| io_err(&path, e))?;

        if let Err(err) = file.try_lock_exclusive() {
            if err.kind() == fs2::lock_contended_error().kind() {
                return Err(busy(&path));
            }
            return Err(io_err(&path, err));
        }

        if let Err(err) = record_holder(&mut file) {
            tracing::debug!("could not record lock holder in {}: {err}", path.display());
        }
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScopeLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn record_holder(file: &mut File) -> std::io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    writeln!(
        file,
        "pid={}\nutc={}",
        std::process::id(),
        Utc::now().to_rfc3339()
    )?;
    file.flush()
}

fn busy(path: &Path) -> SyncError {
    let holder = fs::read_to_string(path)
        .ok()
        .map(|s| s.lines().collect::<Vec<_>>().join(", "))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown holder".to_string());
    SyncError::LockBusy {
        path: path.to_path_buf(),
        holder,
    }
}
