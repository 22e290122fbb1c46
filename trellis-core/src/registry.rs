//! Per-scope YAML registry.
//!
//! # Storage layout
//!
//! ```text
//! ~/.trellis/
//!   scopes/
//!     <scope_id>.yaml   (one file per scope: mode 0600; dir mode 0700)
//! ```
//!
//! The scope record doubles as the durable schedule record: `last_run` and
//! `next_eligible_at` survive restarts so the scheduler neither loses nor
//! double-fires a run.
//!
//! # API pattern
//!
//! Every function has two forms:
//! - `fn_at(home: &Path, …)`: explicit home; used in tests with `TempDir`
//! - `fn(…)`: derives home from `dirs::home_dir()`, delegates to `_at`
//!
//! Tests must NEVER call the no-arg wrappers; always use `_at`.

use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::error::CoreError;
use crate::layout::ScopeLayout;
use crate::types::{Scope, ScopeConfig, ScopeId};

// ---------------------------------------------------------------------------
// 1. Path helpers
// ---------------------------------------------------------------------------

/// `<home>/.trellis`
pub fn trellis_root(home: &Path) -> PathBuf {
    home.join(".trellis")
}

/// `<home>/.trellis/scopes/`: created (mode `0700`) if absent.
pub fn scopes_dir_at(home: &Path) -> Result<PathBuf, CoreError> {
    let dir = trellis_root(home).join("scopes");
    if !dir.exists() {
        std::fs::create_dir_all(&dir)?;
        set_dir_permissions(&dir)?;
    }
    Ok(dir)
}

/// `<home>/.trellis/scopes/<scope>.yaml`: pure, no I/O.
pub fn scope_path_at(home: &Path, scope: &ScopeId) -> PathBuf {
    trellis_root(home)
        .join("scopes")
        .join(format!("{}.yaml", scope.0))
}

// ---------------------------------------------------------------------------
// 2. Load
// ---------------------------------------------------------------------------

/// Load a single scope record.
///
/// Returns `CoreError::ScopeNotFound` if absent,
/// `CoreError::Parse` (with path + line context) if malformed YAML.
pub fn load_scope_at(home: &Path, scope: &ScopeId) -> Result<Scope, CoreError> {
    let path = scope_path_at(home, scope);
    if !path.exists() {
        return Err(CoreError::ScopeNotFound { path });
    }
    let contents = std::fs::read_to_string(&path)?;
    serde_yaml::from_str(&contents).map_err(|e| CoreError::Parse { path, source: e })
}

/// `load_scope_at` convenience wrapper.
pub fn load_scope(scope: &ScopeId) -> Result<Scope, CoreError> {
    load_scope_at(&home()?, scope)
}

/// All scope records, sorted by id. Non-YAML files and in-flight `.tmp`
/// files are skipped.
pub fn list_scopes_at(home: &Path) -> Result<Vec<Scope>, CoreError> {
    let dir = trellis_root(home).join("scopes");
    if !dir.exists() {
        return Ok(vec![]);
    }

    let mut entries: Vec<_> = std::fs::read_dir(&dir)?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .collect();
    entries.sort_by_key(|e| e.file_name());

    let mut scopes = Vec::new();
    for entry in entries {
        let fname = entry.file_name();
        let name = fname.to_string_lossy();
        if !name.ends_with(".yaml") {
            continue;
        }
        let contents = std::fs::read_to_string(entry.path())?;
        let scope: Scope = serde_yaml::from_str(&contents).map_err(|e| CoreError::Parse {
            path: entry.path(),
            source: e,
        })?;
        scopes.push(scope);
    }
    scopes.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(scopes)
}

/// `list_scopes_at` convenience wrapper.
pub fn list_scopes() -> Result<Vec<Scope>, CoreError> {
    list_scopes_at(&home()?)
}

// ---------------------------------------------------------------------------
// 3. Save (atomic)
// ---------------------------------------------------------------------------

/// Atomically save a scope record.
///
/// Write flow: serialize → `.yaml.tmp` sibling → `chmod 0600` → `rename`.
/// `.tmp` is always in the same directory as the target (same filesystem).
pub fn save_scope_at(home: &Path, scope: &Scope) -> Result<(), CoreError> {
    scope.id.validate()?;
    scopes_dir_at(home)?;
    let path = scope_path_at(home, &scope.id);
    let tmp_path = path.with_file_name(format!("{}.yaml.tmp", scope.id.0));

    let yaml = serde_yaml::to_string(scope)?;
    std::fs::write(&tmp_path, yaml)?;
    set_file_permissions(&tmp_path)?;
    std::fs::rename(&tmp_path, &path)?;
    Ok(())
}

/// `save_scope_at` convenience wrapper.
pub fn save_scope(scope: &Scope) -> Result<(), CoreError> {
    save_scope_at(&home()?, scope)
}

/// Load, mutate, and save a scope record in one call.
pub fn update_scope_at<F>(home: &Path, scope: &ScopeId, mutate: F) -> Result<Scope, CoreError>
where
    F: FnOnce(&mut Scope) -> Result<(), CoreError>,
{
    let mut record = load_scope_at(home, scope)?;
    mutate(&mut record)?;
    record.updated_at = Utc::now();
    save_scope_at(home, &record)?;
    Ok(record)
}

// ---------------------------------------------------------------------------
// 4. Init (onboard)
// ---------------------------------------------------------------------------

/// Onboard a scope whose canonical tree lives at `root`.
///
/// Creates the tree skeleton and `<home>/.trellis/scopes/<id>.yaml`.
/// Idempotent: if the record already exists, loads and returns it unchanged.
pub fn init_at(
    root: PathBuf,
    id: ScopeId,
    config: ScopeConfig,
    home: &Path,
) -> Result<Scope, CoreError> {
    id.validate()?;
    config.validate()?;

    let path = scope_path_at(home, &id);
    if path.exists() {
        return load_scope_at(home, &id);
    }

    ScopeLayout::new(&root).ensure_dirs()?;
    let scope = Scope::new(id, root, config);
    save_scope_at(home, &scope)?;
    Ok(scope)
}

/// `init_at` convenience wrapper.
pub fn init(root: PathBuf, id: ScopeId, config: ScopeConfig) -> Result<Scope, CoreError> {
    init_at(root, id, config, &home()?)
}

// ---------------------------------------------------------------------------
// 5. Remove (protect-on-delete)
// ---------------------------------------------------------------------------

/// Remove a scope record. Refuses while canonical files remain under
/// `managed/`; the tree itself is never touched.
pub fn remove_scope_at(home: &Path, id: &ScopeId) -> Result<(), CoreError> {
    let scope = load_scope_at(home, id)?;
    let objects = count_canonical_files(&ScopeLayout::new(&scope.root).managed_dir())?;
    if objects > 0 {
        return Err(CoreError::ScopeInUse {
            scope: id.0.clone(),
            objects,
        });
    }
    std::fs::remove_file(scope_path_at(home, id))?;
    Ok(())
}

/// `remove_scope_at` convenience wrapper.
pub fn remove_scope(id: &ScopeId) -> Result<(), CoreError> {
    remove_scope_at(&home()?, id)
}

fn count_canonical_files(dir: &Path) -> Result<usize, CoreError> {
    if !dir.exists() {
        return Ok(0);
    }
    let mut count = 0;
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in std::fs::read_dir(&current)? {
            let entry = entry?;
            let ty = entry.file_type()?;
            if ty.is_dir() {
                stack.push(entry.path());
            } else if entry.path().extension().and_then(|e| e.to_str())
                == Some(crate::layout::CANONICAL_EXT)
            {
                count += 1;
            }
        }
    }
    Ok(count)
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

/// The user's home directory, or `CoreError::HomeNotFound`.
pub fn home() -> Result<PathBuf, CoreError> {
    dirs::home_dir().ok_or(CoreError::HomeNotFound)
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), CoreError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
    Ok(())
}
#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), CoreError> {
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), CoreError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}
#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), CoreError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_home() -> TempDir {
        TempDir::new().expect("tempdir")
    }

    fn sid() -> ScopeId {
        ScopeId::from("fabric-east")
    }

    #[test]
    fn scope_path_is_correct() {
        let home = make_home();
        let path = scope_path_at(home.path(), &sid());
        assert!(path.ends_with(".trellis/scopes/fabric-east.yaml"));
    }

    #[test]
    fn scopes_dir_created_with_perms() {
        let home = make_home();
        let dir = scopes_dir_at(home.path()).expect("scopes_dir_at");
        assert!(dir.exists());
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&dir).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o700);
        }
    }

    #[test]
    fn init_creates_tree_and_record() {
        let home = make_home();
        let tree = make_home();
        let scope = init_at(
            tree.path().to_path_buf(),
            sid(),
            ScopeConfig::default(),
            home.path(),
        )
        .expect("init");
        assert_eq!(scope.id, sid());
        assert!(tree.path().join("raw").is_dir());
        assert!(tree.path().join("managed").is_dir());
        assert!(tree.path().join(".meta").is_dir());
        assert!(scope_path_at(home.path(), &sid()).exists());
    }

    #[test]
    fn init_is_idempotent() {
        let home = make_home();
        let tree = make_home();
        let first = init_at(
            tree.path().to_path_buf(),
            sid(),
            ScopeConfig::default(),
            home.path(),
        )
        .unwrap();
        let second = init_at(
            PathBuf::from("/elsewhere"),
            sid(),
            ScopeConfig::default(),
            home.path(),
        )
        .unwrap();
        assert_eq!(first.root, second.root);
        assert_eq!(first.created_at, second.created_at);
    }

    #[test]
    fn init_rejects_bad_id_and_config() {
        let home = make_home();
        let tree = make_home();
        let err = init_at(
            tree.path().to_path_buf(),
            ScopeId::from("../escape"),
            ScopeConfig::default(),
            home.path(),
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::InvalidScopeId(_)));

        let config = ScopeConfig {
            interval_secs: 1,
            ..ScopeConfig::default()
        };
        let err = init_at(tree.path().to_path_buf(), sid(), config, home.path()).unwrap_err();
        assert!(matches!(err, CoreError::InvalidConfig(_)));
    }

    #[test]
    fn atomic_write_cleans_up_tmp() {
        let home = make_home();
        let scope = Scope::new(sid(), PathBuf::from("/srv/x"), ScopeConfig::default());
        save_scope_at(home.path(), &scope).expect("save");
        let tmp = scope_path_at(home.path(), &sid()).with_file_name("fabric-east.yaml.tmp");
        assert!(!tmp.exists(), ".tmp must be gone after successful save");
    }

    #[test]
    fn load_missing_scope_returns_not_found() {
        let home = make_home();
        let err = load_scope_at(home.path(), &sid()).unwrap_err();
        assert!(matches!(err, CoreError::ScopeNotFound { .. }));
    }

    #[test]
    fn list_scopes_empty_when_none() {
        let home = make_home();
        assert!(list_scopes_at(home.path()).expect("list").is_empty());
    }

    #[test]
    fn remove_refuses_while_objects_remain() {
        let home = make_home();
        let tree = make_home();
        init_at(
            tree.path().to_path_buf(),
            sid(),
            ScopeConfig::default(),
            home.path(),
        )
        .unwrap();
        let canonical = tree.path().join("managed").join("vrf").join("main.yaml");
        std::fs::create_dir_all(canonical.parent().unwrap()).unwrap();
        std::fs::write(&canonical, "kind: vrf\n").unwrap();

        let err = remove_scope_at(home.path(), &sid()).unwrap_err();
        assert!(matches!(err, CoreError::ScopeInUse { objects: 1, .. }));

        std::fs::remove_file(&canonical).unwrap();
        remove_scope_at(home.path(), &sid()).expect("remove once empty");
        assert!(!scope_path_at(home.path(), &sid()).exists());
    }

    #[test]
    fn update_scope_persists_mutation() {
        let home = make_home();
        let tree = make_home();
        init_at(
            tree.path().to_path_buf(),
            sid(),
            ScopeConfig::default(),
            home.path(),
        )
        .unwrap();
        update_scope_at(home.path(), &sid(), |s| {
            s.config.enabled = false;
            Ok(())
        })
        .unwrap();
        assert!(!load_scope_at(home.path(), &sid()).unwrap().config.enabled);
    }

    #[test]
    fn home_not_found_error_message() {
        assert!(CoreError::HomeNotFound.to_string().contains("home directory"));
    }
}
