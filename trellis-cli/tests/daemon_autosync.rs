use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use trellis_core::{
    registry,
    types::{ScopeConfig, ScopeId},
    ScopeLayout, ScopeState,
};

fn trellis_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_trellis"))
}

struct DaemonProcess {
    child: Child,
    home: PathBuf,
}

impl DaemonProcess {
    fn start(home: PathBuf) -> Self {
        let child = Command::new(trellis_bin())
            .env("HOME", &home)
            .env("USERPROFILE", &home)
            .args(["daemon", "start"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn daemon");
        Self { child, home }
    }

    fn stop(&mut self) {
        let _ = Command::new(trellis_bin())
            .env("HOME", &self.home)
            .env("USERPROFILE", &self.home)
            .args(["daemon", "stop"])
            .status();

        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if let Ok(Some(_)) = self.child.try_wait() {
                return;
            }
            sleep(Duration::from_millis(50));
        }

        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for DaemonProcess {
    fn drop(&mut self) {
        self.stop();
    }
}

fn daemon_status(home: &Path) -> Option<serde_json::Value> {
    let output = Command::new(trellis_bin())
        .env("HOME", home)
        .env("USERPROFILE", home)
        .args(["daemon", "status"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    serde_json::from_slice(&output.stdout).ok()
}

fn daemon_running(home: &Path) -> bool {
    daemon_status(home)
        .and_then(|v| v.get("running").and_then(|r| r.as_bool()))
        .unwrap_or(false)
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(100));
    }
    false
}

fn init_scope(home: &Path, workspace: &TempDir) -> PathBuf {
    let root = workspace.path().join("fabric");
    let control = workspace.path().join("control-plane");
    std::fs::create_dir_all(&control).expect("control plane dir");
    let config = ScopeConfig {
        control_plane: Some(control),
        ..ScopeConfig::default()
    };
    registry::init_at(root.clone(), ScopeId::from("fabric-east"), config, home).expect("init");
    root
}

fn state(home: &Path) -> ScopeState {
    registry::load_scope_at(home, &ScopeId::from("fabric-east"))
        .map(|s| s.state)
        .unwrap_or_default()
}

const TENANT: &str = "\
kind: Tenant
metadata:
  name: acme
  namespace: default
spec:
  descr: from-the-inbox
";

#[test]
fn inbox_drop_is_reconciled_by_the_daemon() {
    let home = TempDir::new().expect("home");
    let workspace = TempDir::new().expect("workspace");
    let root = init_scope(home.path(), &workspace);

    let _daemon = DaemonProcess::start(home.path().to_path_buf());
    assert!(
        wait_until(Duration::from_secs(5), || daemon_running(home.path())),
        "daemon did not become ready"
    );
    assert!(
        wait_until(Duration::from_secs(10), || state(home.path()) == ScopeState::SyncedInSync),
        "first scheduled pass did not complete"
    );

    let layout = ScopeLayout::new(&root);
    std::fs::write(layout.raw_dir().join("tenant.yaml"), TENANT).expect("drop input");
    let canonical = root.join("managed/tenant/acme.yaml");
    let remote = workspace
        .path()
        .join("control-plane/fabric-east/tenant/default/acme.json");
    assert!(
        wait_until(Duration::from_secs(10), || canonical.exists() && remote.exists()),
        "watcher-triggered run did not reach the control plane"
    );
}

#[test]
fn manual_trigger_reports_an_outcome_and_status_lists_the_scope() {
    let home = TempDir::new().expect("home");
    let workspace = TempDir::new().expect("workspace");
    init_scope(home.path(), &workspace);

    let _daemon = DaemonProcess::start(home.path().to_path_buf());
    assert!(
        wait_until(Duration::from_secs(5), || daemon_running(home.path())),
        "daemon did not become ready"
    );

    let output = Command::new(trellis_bin())
        .env("HOME", home.path())
        .env("USERPROFILE", home.path())
        .args(["daemon", "trigger", "fabric-east", "--confirm"])
        .output()
        .expect("trigger");
    assert!(
        output.status.success(),
        "trigger failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(String::from_utf8_lossy(&output.stdout).contains("fabric-east"));

    assert!(wait_until(Duration::from_secs(10), || {
        daemon_status(home.path())
            .and_then(|v| v["scopes"][0]["last_result"]["ok"].as_bool())
            .unwrap_or(false)
    }));
    let status = daemon_status(home.path()).expect("status");
    assert_eq!(status["scopes"][0]["scope"], "fabric-east");
    assert_eq!(status["scopes"][0]["state"], "synced-in-sync");
}

#[test]
fn stop_without_daemon_is_not_an_error() {
    let home = TempDir::new().expect("home");
    let output = Command::new(trellis_bin())
        .env("HOME", home.path())
        .args(["daemon", "stop"])
        .output()
        .expect("stop");
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("not running"));
}
