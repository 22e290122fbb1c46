//! Ingestion pipeline: `raw/` inbox → one canonical file per object.
//!
//! Per input file:
//!
//! 1. Split into document blocks and parse each one. Bad blocks and
//!    duplicate identities become [`BlockError`]s; the rest carry on.
//! 2. Write each object's canonical file (skipped when the bytes already
//!    match). System-owned fields already present in the canonical file are
//!    kept when the input does not mention them.
//! 3. If every write succeeded, archive the input: rename, append to
//!    `.meta/archive-log`, save the manifest. A failure after the rename
//!    moves the input back.
//!
//! Inputs whose blocks are all invalid stay in `raw/` so they can be fixed.
//! Re-running on an input that was written but never archived adopts the
//! existing canonical files and completes the archive step.

use std::collections::BTreeSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use trellis_codec::{parse_canonical, parse_documents, render_with_hash};
use trellis_core::layout::{is_inbox_candidate, ScopeLayout, ARCHIVED_MARKER};
use trellis_core::types::{
    ArchiveStrategy, FieldOwnership, ManagedObject, ObjectDocument, ObjectIdentity, ObjectOrigin,
    Scope,
};

use crate::error::{io_err, BlockError, ErrorClass, SyncError};
use crate::lock::ScopeLock;
use crate::manifest::{self, EntryOutcome, Manifest, ManifestEntry};
use crate::writer::{read_if_exists, write_canonical, WriteResult};

// ---------------------------------------------------------------------------
// Report types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IngestAction {
    Created,
    Updated,
    /// File already held these bytes and was tracked.
    Unchanged,
    /// File already held these bytes but was missing from the manifest.
    Adopted,
    /// Dry run: a write would have happened.
    WouldWrite,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestedObject {
    pub identity: ObjectIdentity,
    /// Relative to the scope root.
    pub path: PathBuf,
    pub action: IngestAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FileStatus {
    Archived,
    /// Left in `raw/` because nothing in it could be written.
    Retained,
    ArchiveFailed,
    DryRun,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileReport {
    /// Relative to the scope root.
    pub source: PathBuf,
    pub objects: Vec<IngestedObject>,
    pub errors: Vec<BlockError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_to: Option<PathBuf>,
    pub status: FileStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReport {
    pub files: Vec<FileReport>,
}

impl IngestReport {
    pub fn objects(&self) -> impl Iterator<Item = &IngestedObject> {
        self.files.iter().flat_map(|f| f.objects.iter())
    }

    pub fn errors(&self) -> impl Iterator<Item = &BlockError> {
        self.files.iter().flat_map(|f| f.errors.iter())
    }

    /// Objects whose canonical file was created or rewritten.
    pub fn written(&self) -> usize {
        self.objects()
            .filter(|o| matches!(o.action, IngestAction::Created | IngestAction::Updated))
            .count()
    }
}

// ---------------------------------------------------------------------------
// Archive log
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArchiveStatus {
    Archived,
    RolledBack,
}

/// One line of `.meta/archive-log`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveRecord {
    pub at: DateTime<Utc>,
    pub source: PathBuf,
    pub archived_to: PathBuf,
    pub objects: Vec<String>,
    pub status: ArchiveStatus,
}

fn append_archive_log(layout: &ScopeLayout, record: &ArchiveRecord) -> Result<(), SyncError> {
    let path = layout.archive_log_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }
    let line = serde_json::to_string(record)?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| io_err(&path, e))?;
    writeln!(file, "{line}").map_err(|e| io_err(&path, e))
}

/// All archive-log records, oldest first. Unreadable lines are skipped.
pub fn read_archive_log(layout: &ScopeLayout) -> Result<Vec<ArchiveRecord>, SyncError> {
    let Some(text) = read_if_exists(&layout.archive_log_path())? else {
        return Ok(Vec::new());
    };
    Ok(text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect())
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Ingest every inbox file of `scope`, taking the scope lock.
pub fn ingest_scope(scope: &Scope, dry_run: bool) -> Result<IngestReport, SyncError> {
    let layout = ScopeLayout::new(&scope.root);
    let _lock = ScopeLock::acquire(&layout)?;
    let mut manifest = manifest::load(&layout)?;
    ingest_inbox(scope, &layout, &mut manifest, dry_run)
}

/// Ingest with the lock already held and the manifest already loaded.
pub(crate) fn ingest_inbox(
    scope: &Scope,
    layout: &ScopeLayout,
    manifest: &mut Manifest,
    dry_run: bool,
) -> Result<IngestReport, SyncError> {
    let mut report = IngestReport::default();
    for path in inbox_files(layout)? {
        let file = ingest_file(scope, layout, manifest, &path, dry_run)?;
        tracing::info!(
            "ingested {}: {} object(s), {} error(s), {:?}",
            file.source.display(),
            file.objects.len(),
            file.errors.len(),
            file.status
        );
        report.files.push(file);
    }
    Ok(report)
}

fn inbox_files(layout: &ScopeLayout) -> Result<Vec<PathBuf>, SyncError> {
    let raw = layout.raw_dir();
    if !raw.exists() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in std::fs::read_dir(&raw).map_err(|e| io_err(&raw, e))? {
        let entry = entry.map_err(|e| io_err(&raw, e))?;
        let path = entry.path();
        if path.is_file() && is_inbox_candidate(&path) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

struct Parsed {
    document: ObjectDocument,
    claimed: BTreeSet<String>,
}

fn ingest_file(
    scope: &Scope,
    layout: &ScopeLayout,
    manifest: &mut Manifest,
    path: &Path,
    dry_run: bool,
) -> Result<FileReport, SyncError> {
    let source = path.strip_prefix(layout.root()).unwrap_or(path).to_path_buf();
    let mut report = FileReport {
        source: source.clone(),
        objects: Vec::new(),
        errors: Vec::new(),
        archived_to: None,
        status: FileStatus::Retained,
    };

    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) => {
            report.errors.push(BlockError {
                source,
                block: None,
                line: None,
                class: ErrorClass::Io,
                message: err.to_string(),
            });
            return Ok(report);
        }
    };
    // Undecodable input stays in raw/ untouched.
    let text = match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(err) => {
            let valid_up_to = err.utf8_error().valid_up_to();
            let line = 1 + err.as_bytes()[..valid_up_to]
                .iter()
                .filter(|b| **b == b'\n')
                .count();
            report.errors.push(BlockError {
                source,
                block: None,
                line: Some(line),
                class: ErrorClass::Parse,
                message: format!("input is not valid UTF-8 (byte offset {valid_up_to})"),
            });
            return Ok(report);
        }
    };

    // 1. parse, first occurrence of an identity wins
    let mut seen = BTreeSet::new();
    let mut valid = Vec::new();
    let mut blocks = 0usize;
    for (block, parsed) in parse_documents(&text) {
        blocks += 1;
        let document = match parsed {
            Ok(document) => document,
            Err(err) => {
                report
                    .errors
                    .push(BlockError::from_codec(source.clone(), &err, block.line));
                continue;
            }
        };
        let identity = document.identity(&scope.id);
        if !seen.insert(identity.clone()) {
            report.errors.push(BlockError {
                source: source.clone(),
                block: Some(block.index),
                line: Some(block.line),
                class: ErrorClass::DuplicateObject,
                message: format!("{} already defined earlier in this input", identity.key()),
            });
            continue;
        }
        let claimed = document.spec.keys().cloned().collect();
        valid.push(Parsed { document, claimed });
    }

    // 2. canonical writes
    let mut pending = Vec::new();
    let mut write_failures = 0usize;
    let now = Utc::now();
    for parsed in valid {
        match write_object(scope, layout, manifest, parsed, dry_run, now) {
            Ok((object, entry)) => {
                report.objects.push(object);
                pending.extend(entry);
            }
            Err(err) => {
                write_failures += 1;
                report.errors.push(BlockError {
                    source: source.clone(),
                    block: None,
                    line: None,
                    class: err.class(),
                    message: err.to_string(),
                });
            }
        }
    }

    if dry_run {
        report.status = FileStatus::DryRun;
        return Ok(report);
    }

    let nothing_usable = report.objects.is_empty() && blocks > 0;
    if write_failures > 0 || nothing_usable {
        for entry in pending {
            manifest.record(entry.with_source(&source));
        }
        manifest::save(layout, manifest)?;
        return Ok(report);
    }

    // 3. archive
    match archive_input(scope, layout, manifest, path, &source, &report, pending, now) {
        Ok(archived_to) => {
            report.archived_to = Some(archived_to);
            report.status = FileStatus::Archived;
        }
        Err(err) => {
            tracing::warn!("archiving {} failed: {err}", source.display());
            report.status = FileStatus::ArchiveFailed;
            report.errors.push(BlockError {
                source,
                block: None,
                line: None,
                class: ErrorClass::ArchiveFailure,
                message: err.to_string(),
            });
        }
    }
    Ok(report)
}

/// Write one object and update its manifest record. Returns the entry to
/// append once the input's fate is known.
fn write_object(
    scope: &Scope,
    layout: &ScopeLayout,
    manifest: &mut Manifest,
    parsed: Parsed,
    dry_run: bool,
    now: DateTime<Utc>,
) -> Result<(IngestedObject, Option<ManifestEntry>), SyncError> {
    let Parsed {
        mut document,
        claimed,
    } = parsed;
    let identity = document.identity(&scope.id);
    let relative = ScopeLayout::relative_canonical_path(identity.kind, &identity.namespace, &identity.name);
    let path = layout.root().join(&relative);

    let existing_text = read_if_exists(&path)?;
    if let Some(existing) = existing_text.as_deref().and_then(|t| parse_canonical(t).ok()) {
        let ownership = manifest.get(&identity).map(|o| o.ownership.clone()).unwrap_or_default();
        keep_system_fields(&mut document, &existing, &ownership);
    }
    let (text, hash) = render_with_hash(&document)?;

    let tracked_hash = manifest.get(&identity).map(|o| o.content_hash.clone());
    let action = if existing_text.as_deref() == Some(text.as_str()) {
        if tracked_hash.as_deref() == Some(hash.as_str()) {
            IngestAction::Unchanged
        } else {
            IngestAction::Adopted
        }
    } else {
        match write_canonical(&path, &text, dry_run)? {
            WriteResult::Created { .. } => IngestAction::Created,
            WriteResult::Updated { .. } => IngestAction::Updated,
            WriteResult::Unchanged { .. } => IngestAction::Unchanged,
            WriteResult::WouldWrite { .. } => IngestAction::WouldWrite,
        }
    };

    let outcome = match action {
        IngestAction::Created => Some(EntryOutcome::Created),
        IngestAction::Updated => Some(EntryOutcome::Updated),
        IngestAction::Adopted => Some(EntryOutcome::Adopted),
        IngestAction::Unchanged | IngestAction::WouldWrite => None,
    };
    if outcome.is_some() && !dry_run {
        track(manifest, &identity, relative.clone(), hash, &claimed);
    }

    let object = IngestedObject {
        identity: identity.clone(),
        path: relative,
        action,
    };
    Ok((object, outcome.map(|o| ManifestEntry::new(&identity, o, now))))
}

/// Carry over fields of the current canonical file that the user never
/// owned and the input does not mention.
fn keep_system_fields(
    document: &mut ObjectDocument,
    existing: &ObjectDocument,
    ownership: &FieldOwnership,
) {
    for (field, value) in &existing.spec {
        if !ownership.is_user_owned(field) && !document.spec.contains_key(field) {
            document.spec.insert(field.clone(), value.clone());
        }
    }
}

fn track(
    manifest: &mut Manifest,
    identity: &ObjectIdentity,
    canonical_path: PathBuf,
    content_hash: String,
    claimed: &BTreeSet<String>,
) {
    if let Some(object) = manifest.get_mut(identity) {
        object.canonical_path = canonical_path;
        object.content_hash = content_hash;
        for field in claimed {
            object.ownership.claim(field.as_str());
        }
        return;
    }
    manifest.upsert(ManagedObject {
        identity: identity.clone(),
        canonical_path,
        content_hash,
        resource_version: None,
        origin: ObjectOrigin::Ingested,
        ownership: FieldOwnership {
            user_fields: claimed.clone(),
        },
        baseline: None,
        last_reconciled: None,
    });
}

// ---------------------------------------------------------------------------
// Archive step
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
fn archive_input(
    scope: &Scope,
    layout: &ScopeLayout,
    manifest: &mut Manifest,
    path: &Path,
    source: &Path,
    report: &FileReport,
    pending: Vec<ManifestEntry>,
    now: DateTime<Utc>,
) -> Result<PathBuf, SyncError> {
    let target = archive_target(layout, path, scope.config.archive_strategy, now)?;
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent).map_err(|e| archive_failure(source, e.to_string()))?;
    }
    std::fs::rename(path, &target).map_err(|e| archive_failure(source, e.to_string()))?;
    let archived_to = target.strip_prefix(layout.root()).unwrap_or(&target).to_path_buf();

    let mut record = ArchiveRecord {
        at: now,
        source: source.to_path_buf(),
        archived_to: archived_to.clone(),
        objects: report.objects.iter().map(|o| o.identity.key()).collect(),
        status: ArchiveStatus::Archived,
    };
    if let Err(err) = append_archive_log(layout, &record) {
        restore(&target, path);
        return Err(archive_failure(source, err.to_string()));
    }

    let count = pending.len();
    for mut entry in pending {
        entry.source = Some(source.to_path_buf());
        entry.archived_to = Some(archived_to.clone());
        manifest.record(entry);
    }
    if let Err(err) = manifest::save(layout, manifest) {
        restore(&target, path);
        let start = manifest.entries.len().saturating_sub(count);
        for entry in &mut manifest.entries[start..] {
            entry.archived_to = None;
        }
        record.status = ArchiveStatus::RolledBack;
        record.at = Utc::now();
        if let Err(log_err) = append_archive_log(layout, &record) {
            tracing::warn!(
                "could not record rollback of {} in the archive log: {log_err}",
                source.display()
            );
        }
        return Err(archive_failure(source, err.to_string()));
    }
    Ok(archived_to)
}

fn restore(archived: &Path, original: &Path) {
    if let Err(err) = std::fs::rename(archived, original) {
        tracing::error!(
            "could not move {} back to {}: {err}",
            archived.display(),
            original.display()
        );
    }
}

fn archive_failure(source: &Path, message: String) -> SyncError {
    SyncError::ArchiveFailure {
        path: source.to_path_buf(),
        message,
    }
}

/// Free archive destination for `path` under the scope's strategy.
fn archive_target(
    layout: &ScopeLayout,
    path: &Path,
    strategy: ArchiveStrategy,
    now: DateTime<Utc>,
) -> Result<PathBuf, SyncError> {
    let stamp = now.format("%Y%m%dT%H%M%SZ").to_string();
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| archive_failure(path, "input file name is not valid UTF-8".to_string()))?;
    let candidate = |n: usize| -> PathBuf {
        let suffix = if n == 0 { String::new() } else { format!("-{n}") };
        match strategy {
            ArchiveStrategy::RenameWithSuffix => layout
                .raw_dir()
                .join(format!("{file_name}{ARCHIVED_MARKER}{stamp}{suffix}")),
            ArchiveStrategy::MoveToArchiveDir => layout
                .archive_dir()
                .join(format!("{stamp}{suffix}-{file_name}")),
        }
    };
    let mut n = 0;
    loop {
        let target = candidate(n);
        if !target.exists() {
            return Ok(target);
        }
        n += 1;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
