use std::path::PathBuf;

use thiserror::Error;

/// Error surface for the scheduler, watcher and socket protocol.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("inbox watcher: {0}")]
    Notify(#[from] notify::Error),

    #[error("scope registry: {0}")]
    Core(#[from] trellis_core::CoreError),

    #[error("reconcile: {0}")]
    Sync(#[from] trellis_sync::SyncError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid daemon config at {path}: {source}")]
    Config {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("{0} channel closed")]
    ChannelClosed(&'static str),

    #[error("daemon protocol: {0}")]
    Protocol(String),

    #[error("no daemon listening on {socket}")]
    DaemonNotRunning { socket: PathBuf },
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> DaemonError {
    DaemonError::Io {
        path: path.into(),
        source,
    }
}
