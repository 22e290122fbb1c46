//! `~/.trellis/daemon.yaml`: scheduler tuning. Every key is optional.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use trellis_core::lifecycle::DEFAULT_ATTENTION_THRESHOLD;
use trellis_sync::ReconcileOptions;

use crate::error::{io_err, DaemonError};
use crate::paths::config_path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    /// Master loop cadence.
    pub tick_secs: u64,
    /// Reconciliations allowed to run at once across all scopes.
    pub max_workers: usize,
    /// Hard limit for each sub-step of a run.
    pub step_timeout_secs: u64,
    /// Consecutive authorization failures before a scope needs attention.
    pub attention_threshold: u32,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            tick_secs: 60,
            max_workers: 4,
            step_timeout_secs: 30,
            attention_threshold: DEFAULT_ATTENTION_THRESHOLD,
        }
    }
}

impl DaemonConfig {
    /// Read `daemon.yaml` under `home`; defaults when the file is absent.
    pub fn load_at(home: &Path) -> Result<Self, DaemonError> {
        let path = config_path(home);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => return Err(io_err(&path, err)),
        };
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self =
            serde_yaml::from_str(&text).map_err(|source| DaemonError::Config { path, source })?;
        Ok(config.clamped())
    }

    fn clamped(mut self) -> Self {
        self.tick_secs = self.tick_secs.max(1);
        self.max_workers = self.max_workers.max(1);
        self.step_timeout_secs = self.step_timeout_secs.max(1);
        self
    }

    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }

    /// Options for one scheduled or triggered run.
    pub fn reconcile_options(&self, confirm: bool) -> ReconcileOptions {
        ReconcileOptions {
            confirm,
            dry_run: false,
            step_timeout: Duration::from_secs(self.step_timeout_secs),
            attention_threshold: self.attention_threshold,
        }
    }
}
