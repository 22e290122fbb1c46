use std::path::Path;
use std::time::Duration;

use tempfile::TempDir;
use trellis_core::registry;
use trellis_core::types::{ScopeConfig, ScopeId};
use trellis_daemon::paths::socket_path;
use trellis_daemon::{request_status, request_stop, request_trigger, TriggerOutcome};

async fn wait_for_socket(home: &Path) {
    let socket = socket_path(home);
    for _ in 0..100 {
        if socket.exists() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("daemon socket never appeared at {}", socket.display());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn status_trigger_and_stop_over_the_socket() {
    let tmp = TempDir::new().expect("tmp");
    let home = tmp.path().join("home");
    let control = tmp.path().join("control-plane");
    std::fs::create_dir_all(&control).expect("control plane");
    let config = ScopeConfig {
        enabled: false,
        control_plane: Some(control),
        ..ScopeConfig::default()
    };
    registry::init_at(tmp.path().join("fabric"), ScopeId::from("fabric-east"), config, &home)
        .expect("init scope");

    let daemon = tokio::spawn(trellis_daemon::run(home.clone()));
    wait_for_socket(&home).await;

    let client_home = home.clone();
    let status = tokio::task::spawn_blocking(move || request_status(&client_home, None))
        .await
        .expect("join")
        .expect("status");
    assert_eq!(status["running"], true);
    assert_eq!(status["scopes"][0]["scope"], "fabric-east");
    assert_eq!(status["scopes"][0]["in_flight"], false);

    // Disabled scopes are skipped by the schedule but can still be triggered.
    let client_home = home.clone();
    let outcome =
        tokio::task::spawn_blocking(move || request_trigger(&client_home, "fabric-east", false))
            .await
            .expect("join")
            .expect("trigger");
    assert_eq!(outcome, TriggerOutcome::Accepted);

    let client_home = home.clone();
    let unknown = tokio::task::spawn_blocking(move || request_trigger(&client_home, "nowhere", false))
        .await
        .expect("join");
    assert!(unknown.is_err());

    let client_home = home.clone();
    tokio::task::spawn_blocking(move || request_stop(&client_home))
        .await
        .expect("join")
        .expect("stop");

    tokio::time::timeout(Duration::from_secs(10), daemon)
        .await
        .expect("daemon exits after stop")
        .expect("join")
        .expect("clean shutdown");
    assert!(!socket_path(&home).exists(), "socket is removed on shutdown");
}
