//! `anvil peers`: inspect the cluster roster.

use std::{path::PathBuf, time::Duration};

use clap::{Args, Subcommand};
use color_eyre::Result;
use humansize::{DECIMAL, format_size};

use anvil::cluster::broker::{Brokerage, Roster};

use crate::cmd;

#[derive(Clone, Debug, Subcommand)]
pub enum Command {
    /// Scan the brokerage and list live peers
    List(Options),
}

#[derive(Clone, Debug, Args)]
pub struct Options {
    /// Brokerage directory
    #[arg(long)]
    pub brokerage: PathBuf,

    /// Peer liveness timeout, in seconds
    #[arg(long, default_value_t = 3)]
    pub peer_timeout: u64,
}

pub async fn list(opts: Options) -> Result<()> {
    let ufs = cmd::ufs();
    let brokerage = Brokerage::new(
        cmd::project_root(Some(opts.brokerage))?,
        Duration::from_secs(opts.peer_timeout),
    );
    let roster = Roster::new(brokerage.timeout());
    let adopted = brokerage.discover(&ufs, &roster).await?;

    println!("{adopted} live peer(s)");
    for entry in roster.snapshot() {
        let hw = &entry.descriptor.hardware;
        println!(
            "  {} {} ({} cores / {} threads, {}, {})",
            entry.descriptor.fqdn,
            entry.descriptor.tunnel_addr(),
            hw.cores,
            hw.threads,
            format_size(hw.ram_bytes, DECIMAL),
            entry.descriptor.compression,
        );
    }
    Ok(())
}
