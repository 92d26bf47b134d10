pub mod dump;
pub mod init;
pub mod project;
pub mod server;
pub mod user;

use std::future::Future;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use marksync_core::config;
use marksync_store::Store;

pub(crate) fn home() -> Result<PathBuf> {
    config::home().context("could not determine home directory")
}

/// Run one admin operation on a throwaway current-thread runtime.
pub(crate) fn block_on<F: Future>(future: F) -> Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    Ok(runtime.block_on(future))
}

/// Open the configured database, creating it on first use.
pub(crate) async fn open_store(home: &Path) -> Result<Store> {
    let config = config::load_at(home).context("failed to load ~/.marksync/config.yaml")?;
    let path = config.database_path(home);
    Store::open(
        &path,
        &config.storage,
        config.server.exclusive_kind_groups.clone(),
    )
    .await
    .with_context(|| format!("failed to open database {}", path.display()))
}
