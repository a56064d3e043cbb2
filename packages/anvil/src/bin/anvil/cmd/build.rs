//! `anvil build`: plan aliases and drive the graph.

use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::Args;
use color_eyre::{Result, eyre::Context as _};
use tracing::{debug, info};

use anvil::{
    action::runner::LocalRunner,
    cache::ActionCache,
    cluster::{
        broker::{Brokerage, Roster},
        dispatch::{RemoteDispatcher, ShareMount},
    },
    executor::{Executor, Services},
    graph::{build::BuildOptions, node::Alias, store},
    loader,
    pool::Pool,
};
use mesh::tunnel::TunnelConfig;

use crate::cmd;

#[derive(Clone, Debug, Args)]
pub struct Options {
    /// Aliases to build; defaults to every target in the project file
    pub aliases: Vec<String>,

    /// Project root (defaults to the current directory)
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// Project description file, relative to the root
    #[arg(long, default_value = "targets.json")]
    pub targets: String,

    /// Rebuild everything regardless of stamps
    #[arg(long)]
    pub force: bool,

    /// Downgrade missing declared outputs to warnings
    #[arg(long)]
    pub warn_missing_output: bool,

    /// Disable the action cache for this run
    #[arg(long)]
    pub no_cache: bool,

    /// Brokerage directory; enables distributed execution
    #[arg(long)]
    pub brokerage: Option<PathBuf>,

    /// Peer liveness timeout, in seconds
    #[arg(long, default_value_t = 3)]
    pub peer_timeout: u64,

    /// URL prefix under which this client's project root is shared
    #[arg(long)]
    pub share_url: Option<String>,
}

pub async fn exec(opts: Options) -> Result<()> {
    let root = cmd::project_root(opts.root.clone())?;
    let ufs = cmd::ufs();
    let pool = Pool::with_default_size();
    let cancel = cmd::cancel_on_ctrl_c();

    // Flags win over the persisted config; the config store fills in what
    // the command line left unset.
    let config = anvil::config::ConfigStore::load(&ufs, &root.join(cmd::OUT_DIR).join("config.json"))
        .await
        .context("load config store")?;
    let opts = apply_config(opts, &config);

    let mut executor = Executor::new(
        Arc::clone(&ufs),
        pool.clone(),
        Arc::new(LocalRunner),
        cancel.clone(),
        num_cpus::get().saturating_sub(1).max(1),
    );

    if !opts.no_cache {
        let cache_root = cmd::user_cache_dir()?.join("actions");
        let cache = ActionCache::open(&ufs, cache_root).await?;
        executor = executor.with_cache(cache);
    }

    if let Some(brokerage_dir) = opts.brokerage.clone() {
        let brokerage = Brokerage::new(
            cmd::project_root(Some(brokerage_dir))?,
            Duration::from_secs(opts.peer_timeout),
        );
        let roster = Arc::new(Roster::new(brokerage.timeout()));
        brokerage.discover(&ufs, &roster).await?;
        spawn_discovery(brokerage, Arc::clone(&roster), Arc::clone(&ufs), &cancel);

        let share = opts.share_url.clone().map(|url_prefix| ShareMount {
            path: root.clone(),
            url_prefix,
        });
        let remote = RemoteDispatcher::new(roster, TunnelConfig::default(), share)?;
        executor = executor.with_remote(remote);
    }

    let services = Services::new(Arc::clone(&ufs), pool.clone(), Arc::new(executor), cancel);

    // The graph survives across runs in a single schema-tagged store;
    // an unreadable store just means a cold start.
    let out_dir = root.join(cmd::OUT_DIR);
    ufs.create_dir_all(&out_dir).await?;
    let store_path = out_dir.join("graph.bin");
    let graph = store::load(&ufs, &store_path).await?.unwrap_or_default();
    debug!(nodes = graph.len(), "graph loaded");

    let targets_file = root.join(&opts.targets);
    let registered = loader::load(&ufs, &graph, &root, &targets_file)
        .await
        .context("load project description")?;

    let aliases = if opts.aliases.is_empty() {
        registered
    } else {
        opts.aliases
            .iter()
            .map(|alias| Alias::new(alias.clone()))
            .collect()
    };

    let options = BuildOptions {
        force: opts.force,
        warn_missing_output: opts.warn_missing_output,
        dirty_if: None,
    };
    let result = graph
        .build_many(&aliases, options, Arc::clone(&services))
        .await;

    // Persist whatever progress we made, success or not, so a failed run
    // still avoids repeating finished work.
    store::save(&graph, &ufs, &store_path).await?;
    pool.join_async().await?;

    let built = result?;
    let rebuilt = built.iter().filter(|outcome| outcome.rebuilt).count();
    info!(
        targets = built.len(),
        rebuilt,
        up_to_date = built.len() - rebuilt,
        "build complete"
    );
    Ok(())
}

fn apply_config(mut opts: Options, config: &anvil::config::ConfigStore) -> Options {
    if opts.brokerage.is_none()
        && let Some(brokerage) = config.get("build", "brokerage")
    {
        opts.brokerage = Some(PathBuf::from(brokerage));
    }
    if opts.share_url.is_none()
        && let Some(share_url) = config.get("build", "share_url")
    {
        opts.share_url = Some(share_url.to_string());
    }
    if opts.peer_timeout == 3
        && let Some(timeout) = config.get("build", "peer_timeout")
        && let Ok(timeout) = timeout.parse()
    {
        opts.peer_timeout = timeout;
    }
    opts
}

fn spawn_discovery(
    brokerage: Brokerage,
    roster: Arc<Roster>,
    ufs: Arc<anvil::fs::Ufs>,
    cancel: &tokio_util::sync::CancellationToken,
) {
    let cancel = cancel.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(brokerage.discovery_interval());
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            if let Err(err) = brokerage.discover(&ufs, &roster).await {
                tracing::warn!(?err, "peer discovery failed");
            }
        }
    });
}
