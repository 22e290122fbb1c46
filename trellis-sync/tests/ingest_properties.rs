use std::fs;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use filetime::{set_file_mtime, FileTime};
use tempfile::TempDir;

use trellis_codec::parse_canonical;
use trellis_core::layout::ScopeLayout;
use trellis_core::registry;
use trellis_core::types::{ObjectIdentity, ObjectKind, Scope, ScopeConfig, ScopeId};
use trellis_sync::ingest::{read_archive_log, ArchiveStatus, FileStatus, IngestAction};
use trellis_sync::manifest;
use trellis_sync::{ingest_scope, ErrorClass};

fn init_scope(home: &TempDir, workspace: &TempDir, name: &str) -> Scope {
    let root = workspace.path().join(name);
    registry::init_at(root, ScopeId::from(name), ScopeConfig::default(), home.path())
        .expect("init scope")
}

fn drop_input(scope: &Scope, file: &str, text: &str) -> PathBuf {
    let path = ScopeLayout::new(&scope.root).raw_dir().join(file);
    fs::write(&path, text).expect("write input");
    path
}

fn canonical(scope: &Scope, kind: ObjectKind, ns: &str, name: &str) -> PathBuf {
    ScopeLayout::new(&scope.root).canonical_path(&ObjectIdentity::new(scope.id.clone(), kind, ns, name))
}

const BATCH: &str = "\
kind: Tenant
metadata: {name: acme, namespace: default}
spec:
  descr: Acme
---
kind: bridge_domain
metadata: {name: web, namespace: prod}
spec:
  vrf: main
  mtu: 9000
---
kind: Vrf
metadata: {name: main, namespace: prod}
---
kind: Filter
metadata: {namespace: prod}
";

#[test]
fn every_valid_block_lands_and_every_bad_block_is_reported() {
    let home = TempDir::new().expect("home");
    let workspace = TempDir::new().expect("workspace");
    let scope = init_scope(&home, &workspace, "fabric-east");
    drop_input(&scope, "batch.yaml", BATCH);

    let report = ingest_scope(&scope, false).expect("ingest");

    assert_eq!(report.objects().count(), 3);
    let errors: Vec<_> = report.errors().collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].block, Some(4));
    assert_eq!(errors[0].class, ErrorClass::Parse);
    for (kind, ns, name) in [
        (ObjectKind::Tenant, "default", "acme"),
        (ObjectKind::BridgeDomain, "prod", "web"),
        (ObjectKind::Vrf, "prod", "main"),
    ] {
        assert!(canonical(&scope, kind, ns, name).exists(), "{kind}/{ns}/{name}");
    }
    assert_eq!(report.files[0].status, FileStatus::Archived);
}

#[test]
fn canonical_files_reparse_to_the_ingested_object() {
    let home = TempDir::new().expect("home");
    let workspace = TempDir::new().expect("workspace");
    let scope = init_scope(&home, &workspace, "fabric-east");
    drop_input(&scope, "batch.yaml", BATCH);
    ingest_scope(&scope, false).expect("ingest");

    let text = fs::read_to_string(canonical(&scope, ObjectKind::BridgeDomain, "prod", "web"))
        .expect("read canonical");
    let document = parse_canonical(&text).expect("canonical text parses");
    assert_eq!(document.kind, ObjectKind::BridgeDomain);
    assert_eq!(document.spec["mtu"], serde_json::json!(9000));
    assert_eq!(document.spec["vrf"], serde_json::json!("main"));
}

#[test]
fn scopes_never_see_each_others_inputs() {
    let home = TempDir::new().expect("home");
    let workspace = TempDir::new().expect("workspace");
    let east = init_scope(&home, &workspace, "fabric-east");
    let west = init_scope(&home, &workspace, "fabric-west");
    drop_input(&east, "batch.yaml", BATCH);

    ingest_scope(&west, false).expect("ingest west");
    ingest_scope(&east, false).expect("ingest east");

    let west_manifest = manifest::load(&ScopeLayout::new(&west.root)).expect("west manifest");
    assert!(west_manifest.objects.is_empty());
    assert!(!canonical(&west, ObjectKind::Tenant, "default", "acme").exists());
    let east_manifest = manifest::load(&ScopeLayout::new(&east.root)).expect("east manifest");
    assert!(east_manifest.identities().all(|id| id.scope == east.id));
}

#[test]
fn same_input_twice_writes_nothing_the_second_time() {
    let home = TempDir::new().expect("home");
    let workspace = TempDir::new().expect("workspace");
    let scope = init_scope(&home, &workspace, "fabric-east");
    drop_input(&scope, "one.yaml", BATCH);
    ingest_scope(&scope, false).expect("first ingest");

    let tenant = canonical(&scope, ObjectKind::Tenant, "default", "acme");
    let old = FileTime::from_system_time(SystemTime::now() - Duration::from_secs(3600));
    set_file_mtime(&tenant, old).expect("age canonical file");

    drop_input(&scope, "two.yaml", BATCH);
    let report = ingest_scope(&scope, false).expect("second ingest");

    assert!(report
        .objects()
        .all(|o| o.action == IngestAction::Unchanged));
    assert_eq!(report.written(), 0);
    let mtime = FileTime::from_last_modification_time(&fs::metadata(&tenant).expect("stat"));
    assert_eq!(mtime, old, "unchanged file must not be rewritten");
}

#[test]
fn interrupted_ingest_is_completed_on_the_next_pass() {
    let home = TempDir::new().expect("home");
    let workspace = TempDir::new().expect("workspace");
    let scope = init_scope(&home, &workspace, "fabric-east");
    let layout = ScopeLayout::new(&scope.root);
    let input = drop_input(&scope, "batch.yaml", BATCH);
    ingest_scope(&scope, false).expect("ingest");

    // Simulate a crash between writing canonical files and archiving:
    // the input is back in raw/ and the manifest was never saved.
    let archived = read_archive_log(&layout).expect("archive log");
    let archived_to = scope.root.join(&archived[0].archived_to);
    fs::rename(&archived_to, &input).expect("restore input");
    fs::remove_file(layout.manifest_path()).expect("drop manifest");

    let report = ingest_scope(&scope, false).expect("re-ingest");

    assert!(report.objects().all(|o| o.action == IngestAction::Adopted));
    assert!(!input.exists());
    let manifest = manifest::load(&layout).expect("manifest");
    assert_eq!(manifest.objects.len(), 3);
    let log = read_archive_log(&layout).expect("archive log");
    assert_eq!(log.len(), 2);
    assert!(log.iter().all(|r| r.status == ArchiveStatus::Archived));
}

#[test]
fn held_lock_blocks_ingest() {
    let home = TempDir::new().expect("home");
    let workspace = TempDir::new().expect("workspace");
    let scope = init_scope(&home, &workspace, "fabric-east");
    let input = drop_input(&scope, "batch.yaml", BATCH);
    let _held = trellis_sync::lock::ScopeLock::acquire(&ScopeLayout::new(&scope.root)).expect("lock");

    let err = ingest_scope(&scope, false).unwrap_err();
    assert!(matches!(err, trellis_sync::SyncError::LockBusy { .. }), "got: {err}");
    assert!(input.exists());
}

#[test]
fn undecodable_input_is_reported_and_left_in_place() {
    let home = TempDir::new().expect("home");
    let workspace = TempDir::new().expect("workspace");
    let scope = init_scope(&home, &workspace, "fabric-east");
    let input = ScopeLayout::new(&scope.root).raw_dir().join("latin1.yaml");
    let bytes = b"kind: tenant\nmetadata: {name: acme, namespace: default}\nspec:\n  descr: caf\xE9\n";
    fs::write(&input, bytes).expect("write input");

    let report = ingest_scope(&scope, false).expect("ingest");

    let errors: Vec<_> = report.errors().collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].class, ErrorClass::Parse);
    assert_eq!(errors[0].line, Some(4));
    assert_eq!(report.files[0].status, FileStatus::Retained);
    assert_eq!(fs::read(&input).expect("input kept"), bytes);
    assert!(!canonical(&scope, ObjectKind::Tenant, "default", "acme").exists());
}

#[test]
fn namespace_cannot_shadow_a_default_namespace_file() {
    let home = TempDir::new().expect("home");
    let workspace = TempDir::new().expect("workspace");
    let scope = init_scope(&home, &workspace, "fabric-east");
    drop_input(
        &scope,
        "clash.yaml",
        "\
kind: vrf
metadata: {name: web, namespace: default}
---
kind: vrf
metadata: {name: x, namespace: web.yaml}
",
    );

    let report = ingest_scope(&scope, false).expect("ingest");

    assert_eq!(report.objects().count(), 1);
    let errors: Vec<_> = report.errors().collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].block, Some(2));
    assert_eq!(errors[0].class, ErrorClass::Parse);
    assert!(canonical(&scope, ObjectKind::Vrf, "default", "web").is_file());
    assert_eq!(report.files[0].status, FileStatus::Archived);
}
