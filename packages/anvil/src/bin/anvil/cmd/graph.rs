//! `anvil graph`: inspect the persisted build graph.

use std::path::PathBuf;

use clap::{Args, Subcommand};
use color_eyre::{Result, eyre::ContextCompat};

use anvil::graph::{node::Alias, store};

use crate::cmd;

#[derive(Clone, Debug, Subcommand)]
pub enum Command {
    /// Show the shortest dependency chain between two aliases
    Why(WhyOptions),
}

#[derive(Clone, Debug, Args)]
pub struct WhyOptions {
    /// The depending alias
    pub from: String,
    /// The depended-upon alias
    pub to: String,

    /// Project root (defaults to the current directory)
    #[arg(long)]
    pub root: Option<PathBuf>,
}

pub async fn why(opts: WhyOptions) -> Result<()> {
    let root = cmd::project_root(opts.root)?;
    let ufs = cmd::ufs();
    let store_path = root.join(cmd::OUT_DIR).join("graph.bin");
    let graph = store::load(&ufs, &store_path)
        .await?
        .context("no graph store; run a build first")?;

    let chain = graph.dependency_chain(&Alias::new(opts.from), &Alias::new(opts.to))?;
    for link in chain {
        match link.via {
            Some(kind) => println!("  -[{kind}]-> {}", link.alias),
            None => println!("{}", link.alias),
        }
    }
    Ok(())
}
