//! Trellis daemon: periodic scheduler, inbox watcher and control socket.

pub mod config;
mod error;
pub mod paths;
pub mod protocol;
mod runtime;
pub mod scheduler;

pub use config::DaemonConfig;
pub use error::DaemonError;
pub use protocol::{
    request_status, request_stop, request_trigger, send_request, DaemonRequest, DaemonResponse,
};
pub use runtime::{run, start_blocking};
pub use scheduler::{
    recover_interrupted_at, LocalRunner, RunSummary, Scheduler, ScopeRunner, TriggerOutcome,
    TriggerSource,
};
