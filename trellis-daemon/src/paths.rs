//! Files the daemon keeps under the trellis root.

use std::path::{Path, PathBuf};
use std::time::Duration;

use trellis_core::registry::trellis_root;

/// Quiet period after the last inbox event before a scope is triggered.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);

pub fn socket_path(home: &Path) -> PathBuf {
    trellis_root(home).join("daemon.sock")
}

pub fn config_path(home: &Path) -> PathBuf {
    trellis_root(home).join("daemon.yaml")
}

/// Scratch space for the running daemon; created on start.
pub fn run_dir(home: &Path) -> PathBuf {
    trellis_root(home).join("run")
}
