pub mod daemon;
pub mod diff;
pub mod init;
pub mod reconcile;
pub mod scope;
pub mod status;

use std::future::Future;
use std::path::PathBuf;

use anyhow::{Context, Result};

pub(crate) fn home() -> Result<PathBuf> {
    dirs::home_dir().context("could not determine home directory")
}

/// Drive one async library call to completion on a fresh runtime.
pub(crate) fn block_on<F: Future>(future: F) -> Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    Ok(runtime.block_on(future))
}
