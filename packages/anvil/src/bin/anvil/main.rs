//! The binary entrypoint for `anvil`, the distributed incremental build
//! orchestrator.

use clap::{Parser, Subcommand};
use color_eyre::Result;
use tracing_subscriber::util::SubscriberInitExt;

// Since this is a binary crate, we need to ensure these modules aren't pub
// so that they can correctly warn about dead code.
mod cmd;
mod log;

#[derive(Clone, Debug, Parser)]
#[command(name = "anvil", about = "Distributed, cache-aware incremental builds")]
struct TopLevelFlags {
    #[command(subcommand)]
    command: Command,

    /// When to colorize output
    #[arg(long, value_enum, default_value_t = log::WhenColor::Auto)]
    color: log::WhenColor,
}

#[derive(Clone, Debug, Subcommand)]
enum Command {
    /// Build one or more aliases from the project description
    Build(cmd::build::Options),

    /// Manage the action cache
    #[clap(subcommand)]
    Cache(cmd::cache::Command),

    /// Inspect the build graph
    #[clap(subcommand)]
    Graph(cmd::graph::Command),

    /// List live cluster peers
    #[clap(subcommand)]
    Peers(cmd::peers::Command),

    /// Run the cluster worker
    #[clap(subcommand)]
    Worker(cmd::worker::Command),
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let top = TopLevelFlags::parse();

    let logger = log::make_logger(std::io::stderr, top.color)?;
    logger.init();

    match top.command {
        Command::Build(opts) => cmd::build::exec(opts).await,
        Command::Cache(cmd) => match cmd {
            cmd::cache::Command::Show(opts) => cmd::cache::show(opts).await,
            cmd::cache::Command::Check(opts) => cmd::cache::check(opts).await,
            cmd::cache::Command::Reset(opts) => cmd::cache::reset(opts).await,
        },
        Command::Graph(cmd) => match cmd {
            cmd::graph::Command::Why(opts) => cmd::graph::why(opts).await,
        },
        Command::Peers(cmd) => match cmd {
            cmd::peers::Command::List(opts) => cmd::peers::list(opts).await,
        },
        Command::Worker(cmd) => match cmd {
            cmd::worker::Command::Start(opts) => cmd::worker::start(opts).await,
        },
    }
}
