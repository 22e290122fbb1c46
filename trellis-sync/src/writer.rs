//! Atomic canonical-file writer.
//!
//! ## `write_canonical` protocol
//!
//! 1. Normalise line endings to LF.
//! 2. Compare with the bytes already on disk → skip if identical.
//! 3. Write to `<path>.trellis.tmp`.
//! 4. Rename to the final path (atomic on POSIX).
//!
//! A failed rename removes the temp file and leaves the previous version of
//! the canonical file untouched.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use trellis_core::layout::TMP_SUFFIX;

use crate::error::{io_err, SyncError};

// ---------------------------------------------------------------------------
// Write result
// ---------------------------------------------------------------------------

/// Outcome of an individual file write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteResult {
    /// File did not exist and was written.
    Created { path: PathBuf },
    /// File existed with different content and was overwritten.
    Updated { path: PathBuf },
    /// File already holds exactly this content.
    Unchanged { path: PathBuf },
    /// Dry-run mode: the file *would* have been written.
    WouldWrite { path: PathBuf },
}

impl WriteResult {
    pub fn path(&self) -> &Path {
        match self {
            WriteResult::Created { path }
            | WriteResult::Updated { path }
            | WriteResult::Unchanged { path }
            | WriteResult::WouldWrite { path } => path,
        }
    }

    pub fn changed_disk(&self) -> bool {
        matches!(self, WriteResult::Created { .. } | WriteResult::Updated { .. })
    }
}

/// `<path>.trellis.tmp`
pub fn tmp_path_for(path: &Path) -> PathBuf {
    PathBuf::from(format!("{}{TMP_SUFFIX}", path.display()))
}

/// Write `content` to `path` unless it already holds exactly those bytes.
pub fn write_canonical(path: &Path, content: &str, dry_run: bool) -> Result<WriteResult, SyncError> {
    write_canonical_with_tmp(path, content, dry_run, &tmp_path_for(path))
}

fn write_canonical_with_tmp(
    path: &Path,
    content: &str,
    dry_run: bool,
    tmp: &Path,
) -> Result<WriteResult, SyncError> {
    let normalized = content.replace("\r\n", "\n");

    let existing = read_if_exists(path)?;
    if existing.as_deref() == Some(normalized.as_str()) {
        tracing::debug!("unchanged: {}", path.display());
        return Ok(WriteResult::Unchanged {
            path: path.to_path_buf(),
        });
    }

    if dry_run {
        tracing::info!("[dry-run] would write: {}", path.display());
        return Ok(WriteResult::WouldWrite {
            path: path.to_path_buf(),
        });
    }

    replace_file(path, normalized.as_bytes(), tmp)?;

    tracing::info!("wrote: {}", path.display());
    if existing.is_some() {
        Ok(WriteResult::Updated {
            path: path.to_path_buf(),
        })
    } else {
        Ok(WriteResult::Created {
            path: path.to_path_buf(),
        })
    }
}

/// Unconditional temp-file-plus-rename write, used for the manifest and
/// catalog documents.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), SyncError> {
    replace_file(path, bytes, &tmp_path_for(path))
}

fn replace_file(path: &Path, bytes: &[u8], tmp: &Path) -> Result<(), SyncError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }
    if let Some(tmp_parent) = tmp.parent() {
        std::fs::create_dir_all(tmp_parent).map_err(|e| io_err(tmp_parent, e))?;
    }
    std::fs::write(tmp, bytes).map_err(|e| io_err(tmp, e))?;

    if let Err(e) = std::fs::rename(tmp, path) {
        let _ = std::fs::remove_file(tmp);
        return Err(io_err(path, e));
    }
    Ok(())
}

/// File contents with LF line endings, or `None` if the file is absent.
pub(crate) fn read_if_exists(path: &Path) -> Result<Option<String>, SyncError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(Some(content.replace("\r\n", "\n"))),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(io_err(path, err)),
    }
}

/// Remove a canonical file and any directories it leaves empty, stopping at
/// `stop_at`. Returns `false` if the file was already gone.
pub fn remove_canonical(path: &Path, stop_at: &Path) -> Result<bool, SyncError> {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(io_err(path, err)),
    }
    let mut dir = path.parent();
    while let Some(current) = dir {
        if current == stop_at || !current.starts_with(stop_at) {
            break;
        }
        // Fails on non-empty directories, which ends the walk.
        if std::fs::remove_dir(current).is_err() {
            break;
        }
        dir = current.parent();
    }
    tracing::info!("removed: {}", path.display());
    Ok(true)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn first_write_returns_created() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("managed").join("vrf").join("main.yaml");
        let result = write_canonical(&path, "kind: vrf\n", false).unwrap();
        assert!(matches!(result, WriteResult::Created { .. }));
        assert!(path.exists(), "parent directories are created");
    }

    #[test]
    fn same_content_returns_unchanged_and_keeps_mtime() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("a.yaml");
        write_canonical(&path, "same\n", false).unwrap();
        let old = filetime::FileTime::from_unix_time(1_000_000, 0);
        filetime::set_file_mtime(&path, old).unwrap();

        let result = write_canonical(&path, "same\n", false).unwrap();
        assert!(matches!(result, WriteResult::Unchanged { .. }));
        let mtime = filetime::FileTime::from_last_modification_time(&fs::metadata(&path).unwrap());
        assert_eq!(mtime, old, "unchanged content must not be rewritten");
    }

    #[test]
    fn changed_content_returns_updated() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("a.yaml");
        write_canonical(&path, "v1\n", false).unwrap();
        let result = write_canonical(&path, "v2\n", false).unwrap();
        assert!(matches!(result, WriteResult::Updated { .. }));
        assert_eq!(fs::read_to_string(&path).unwrap(), "v2\n");
    }

    #[test]
    fn dry_run_does_not_write_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nope.yaml");
        let result = write_canonical(&path, "content\n", true).unwrap();
        assert!(matches!(result, WriteResult::WouldWrite { .. }));
        assert!(!path.exists(), "dry-run must not create files");
    }

    #[test]
    fn no_tmp_file_left_behind() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("clean.yaml");
        write_canonical(&path, "data\n", false).unwrap();
        assert!(!tmp_path_for(&path).exists(), ".trellis.tmp must be cleaned up");
    }

    #[test]
    fn crlf_and_lf_content_compare_equal() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("normalize.yaml");
        write_canonical(&path, "line1\r\nline2\r\n", false).unwrap();
        let second = write_canonical(&path, "line1\nline2\n", false).unwrap();
        assert!(matches!(second, WriteResult::Unchanged { .. }));
        assert_eq!(fs::read_to_string(&path).unwrap(), "line1\nline2\n");
    }

    #[test]
    fn remove_canonical_prunes_empty_parents() {
        let tmp = TempDir::new().unwrap();
        let managed = tmp.path().join("managed");
        let path = managed.join("subnet").join("prod").join("web.yaml");
        write_canonical(&path, "x\n", false).unwrap();
        assert!(remove_canonical(&path, &managed).unwrap());
        assert!(!managed.join("subnet").exists());
        assert!(managed.exists(), "stop directory is kept");
        assert!(!remove_canonical(&path, &managed).unwrap());
    }

    #[test]
    #[cfg(unix)]
    fn failed_rename_keeps_previous_content() {
        use std::os::unix::fs::PermissionsExt;

        let root = TempDir::new().unwrap();
        let readonly_dir = root.path().join("readonly");
        fs::create_dir_all(&readonly_dir).unwrap();

        let path = readonly_dir.join("file.yaml");
        fs::write(&path, "original").unwrap();

        let mut perms = fs::metadata(&readonly_dir).unwrap().permissions();
        perms.set_mode(0o555);
        fs::set_permissions(&readonly_dir, perms).unwrap();

        let tmp_dir = TempDir::new().unwrap();
        let tmp_path = tmp_dir.path().join("file.yaml.trellis.tmp");

        let result = write_canonical_with_tmp(&path, "new content", false, &tmp_path);

        let mut perms = fs::metadata(&readonly_dir).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&readonly_dir, perms).unwrap();

        // Privileged test runners may be allowed to rename anyway.
        if result.is_err() {
            let current = fs::read_to_string(&path).unwrap();
            assert_eq!(current, "original", "original file should be intact");
            assert!(!tmp_path.exists(), ".trellis.tmp should be cleaned up");
        }
    }
}
