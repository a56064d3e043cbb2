//! `anvil cache`: inspect and maintain the action cache.

use std::time::Duration;

use clap::{Args, Subcommand};
use color_eyre::Result;
use humansize::{DECIMAL, format_size};

use anvil::cache::{ActionCache, DEFAULT_MAX_BULK_AGE};

use crate::cmd;

#[derive(Clone, Debug, Subcommand)]
pub enum Command {
    /// Report entry and bulk counts and total size
    Show(Options),
    /// Validate every bulk, deleting stale or corrupt ones
    Check(CheckOptions),
    /// Delete the whole cache
    Reset(Options),
}

#[derive(Clone, Debug, Args)]
pub struct Options {
    /// Cache directory (defaults to the user cache location)
    #[arg(long)]
    pub dir: Option<std::path::PathBuf>,
}

#[derive(Clone, Debug, Args)]
pub struct CheckOptions {
    #[command(flatten)]
    pub common: Options,

    /// Maximum bulk age, in days
    #[arg(long, default_value_t = 30)]
    pub max_age_days: u64,
}

async fn open(dir: Option<std::path::PathBuf>) -> Result<(std::sync::Arc<anvil::fs::Ufs>, ActionCache)> {
    let ufs = cmd::ufs();
    let root = match dir {
        Some(dir) => cmd::project_root(Some(dir))?,
        None => cmd::user_cache_dir()?.join("actions"),
    };
    let cache = ActionCache::open(&ufs, root).await?;
    Ok((ufs, cache))
}

pub async fn show(opts: Options) -> Result<()> {
    let (_ufs, cache) = open(opts.dir).await?;
    let stats = cache.stats().await?;
    println!("cache root: {}", cache.root());
    println!("entries:    {}", stats.entries);
    println!("bulks:      {}", stats.bulks);
    println!("size:       {}", format_size(stats.bytes, DECIMAL));
    Ok(())
}

pub async fn check(opts: CheckOptions) -> Result<()> {
    let (ufs, cache) = open(opts.common.dir).await?;
    let max_age = if opts.max_age_days == 30 {
        DEFAULT_MAX_BULK_AGE
    } else {
        Duration::from_secs(opts.max_age_days * 24 * 60 * 60)
    };
    let report = cache.check(&ufs, max_age).await?;
    println!(
        "checked {} entries: kept {} bulks, deleted {}",
        report.entries, report.bulks_kept, report.bulks_deleted
    );
    Ok(())
}

pub async fn reset(opts: Options) -> Result<()> {
    let (_ufs, cache) = open(opts.dir).await?;
    cache.reset().await?;
    println!("cache reset: {}", cache.root());
    Ok(())
}
