//! Subcommand implementations.

pub mod build;
pub mod cache;
pub mod graph;
pub mod peers;
pub mod worker;

use std::sync::Arc;

use color_eyre::{Result, eyre::ContextCompat as _};
use tokio_util::sync::CancellationToken;
use tracing::info;

use anvil::{fs::Ufs, path::AbsPath};

/// Default directory for build products and the graph store.
pub const OUT_DIR: &str = ".anvil";

/// Resolve the project root from an optional flag.
pub fn project_root(root: Option<std::path::PathBuf>) -> Result<AbsPath> {
    match root {
        Some(root) if root.is_absolute() => AbsPath::new(root),
        Some(root) => Ok(AbsPath::current_dir()?.join(root)),
        None => AbsPath::current_dir(),
    }
}

/// The user-global cache directory, `~/.cache/anvil` style per platform.
pub fn user_cache_dir() -> Result<AbsPath> {
    let dirs = directories::ProjectDirs::from("", "", "anvil")
        .context("determine user cache directory")?;
    AbsPath::new(dirs.cache_dir().to_path_buf())
}

/// A cancellation token that closes on ctrl-c.
pub fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, cancelling");
            trigger.cancel();
        }
    });
    cancel
}

/// Shared façade constructor so every command uses one instance.
pub fn ufs() -> Arc<Ufs> {
    Arc::new(Ufs::new())
}
