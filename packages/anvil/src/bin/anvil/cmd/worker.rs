//! `anvil worker`: serve remote build tasks.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use clap::{Args, Subcommand};
use color_eyre::Result;
use tracing::info;

use anvil::{
    action::runner::LocalRunner,
    cluster::{
        broker::Brokerage,
        worker::{PeerMode, Worker, WorkerConfig},
    },
    host,
};
use mesh::compress::Format;

use crate::cmd;

#[derive(Clone, Debug, Subcommand)]
pub enum Command {
    /// Start serving tasks from the cluster
    Start(Options),
}

#[derive(Clone, Debug, Args)]
pub struct Options {
    /// Brokerage directory to advertise in
    #[arg(long)]
    pub brokerage: PathBuf,

    /// Address to bind the tunnel endpoint on
    #[arg(long, default_value = "0.0.0.0:0")]
    pub bind: SocketAddr,

    /// Address peers should dial (defaults to the bind address)
    #[arg(long)]
    pub advertise: Option<IpAddr>,

    /// Admission mode
    #[arg(long, value_enum, default_value = "dedicated")]
    pub mode: ModeArg,

    /// Cap on concurrently admitted tasks
    #[arg(long)]
    pub max_threads: Option<u32>,

    /// Peer liveness timeout, in seconds
    #[arg(long, default_value_t = 3)]
    pub peer_timeout: u64,

    /// Frame compression to advertise
    #[arg(long, value_enum, default_value = "zstd")]
    pub compression: CompressionArg,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum ModeArg {
    Disabled,
    Dedicated,
    Proportional,
    Idle,
}

impl From<ModeArg> for PeerMode {
    fn from(mode: ModeArg) -> PeerMode {
        match mode {
            ModeArg::Disabled => PeerMode::Disabled,
            ModeArg::Dedicated => PeerMode::Dedicated,
            ModeArg::Proportional => PeerMode::Proportional,
            ModeArg::Idle => PeerMode::Idle,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum CompressionArg {
    Zstd,
    Lz4,
}

impl From<CompressionArg> for Format {
    fn from(compression: CompressionArg) -> Format {
        match compression {
            CompressionArg::Zstd => Format::Zstd,
            CompressionArg::Lz4 => Format::Lz4,
        }
    }
}

pub async fn start(opts: Options) -> Result<()> {
    let ufs = cmd::ufs();
    let cancel = cmd::cancel_on_ctrl_c();

    let advertise = opts
        .advertise
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
    let descriptor = host::describe(advertise, opts.compression.into());

    let brokerage = Brokerage::new(
        cmd::project_root(Some(opts.brokerage))?,
        Duration::from_secs(opts.peer_timeout),
    );
    let config = WorkerConfig {
        mode: opts.mode.into(),
        max_threads: opts.max_threads,
        ..WorkerConfig::default()
    };

    let worker = Worker::bind(
        opts.bind,
        descriptor,
        brokerage,
        config,
        ufs,
        Arc::new(LocalRunner),
    )?;
    info!(fqdn = worker.descriptor().fqdn, "worker starting");
    worker.serve(cancel).await
}
