//! The action executor: cache, then cluster, then local pool.
//!
//! When a dirty action becomes runnable the executor asks each backend in
//! order whether it can take it. The cache answers synchronously; a remote
//! worker may refuse or time out, in which case another peer is tried
//! within the retry budget; the local slot pool is the fallback and cannot
//! refuse.

use std::sync::Arc;

use color_eyre::{Result, eyre::Context};
use derive_more::Display;
use mesh::Digest;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::{
    action::{OptionFlags, runner::{CommandRules, ProcessOutcome, ProcessRunner}},
    cache::ActionCache,
    cluster::dispatch::RemoteDispatcher,
    fs::Ufs,
    path::AbsPath,
    pool::Pool,
};

/// Everything a build run needs, injected rather than ambient.
///
/// The façade, the pool, the executor and the cancellation token are
/// created once at command entry and torn down in reverse order at exit.
pub struct Services {
    pub ufs: Arc<Ufs>,
    pub pool: Pool,
    pub executor: Arc<Executor>,
    pub cancel: CancellationToken,
}

impl Services {
    pub fn new(
        ufs: Arc<Ufs>,
        pool: Pool,
        executor: Arc<Executor>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            ufs,
            pool,
            executor,
            cancel,
        })
    }
}

/// What an action asks the executor to do.
#[derive(Clone, Debug)]
pub struct ExecRequest {
    pub rules: CommandRules,
    /// Input files, static plus previously discovered dynamic ones.
    pub inputs: Vec<AbsPath>,
    pub outputs: Vec<AbsPath>,
    /// Root the outputs live under; cache bulks store paths relative to it.
    pub workspace: AbsPath,
    /// The action's content fingerprint.
    pub fingerprint: Digest,
    pub flags: OptionFlags,
}

/// Which backend satisfied an execution.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display)]
pub enum Backend {
    Cache,
    Remote,
    Local,
}

/// The result of executing an action.
#[derive(Clone, Debug)]
pub struct Execution {
    pub outcome: ProcessOutcome,
    pub via: Backend,
}

/// The backend ladder.
pub struct Executor {
    ufs: Arc<Ufs>,
    pool: Pool,
    runner: Arc<dyn ProcessRunner>,
    cache: Option<ActionCache>,
    remote: Option<RemoteDispatcher>,
    local_slots: Arc<tokio::sync::Semaphore>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("cache", &self.cache.is_some())
            .field("remote", &self.remote.is_some())
            .finish_non_exhaustive()
    }
}

impl Executor {
    pub fn new(
        ufs: Arc<Ufs>,
        pool: Pool,
        runner: Arc<dyn ProcessRunner>,
        cancel: CancellationToken,
        local_slots: usize,
    ) -> Self {
        Self {
            ufs,
            pool,
            runner,
            cache: None,
            remote: None,
            local_slots: Arc::new(tokio::sync::Semaphore::new(local_slots.max(1))),
            cancel,
        }
    }

    pub fn with_cache(mut self, cache: ActionCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_remote(mut self, remote: RemoteDispatcher) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Run one action through the backend ladder.
    #[instrument(skip_all, fields(fingerprint = %request.fingerprint))]
    pub async fn execute(&self, request: &ExecRequest) -> Result<Execution> {
        // The cache key covers the action definition plus every input
        // file's content, resolved now.
        let cache_key = match (&self.cache, request.flags.allow_cache()) {
            (Some(_), true) => {
                match ActionCache::cache_key(
                    &self.ufs,
                    &self.pool,
                    request.fingerprint,
                    &request.inputs,
                )
                .await
                {
                    Ok(key) => Some(key),
                    Err(err) => {
                        debug!(?err, "inputs unreadable, skipping cache");
                        None
                    }
                }
            }
            _ => None,
        };

        if let (Some(cache), Some((key, stamp))) = (&self.cache, &cache_key)
            && let Some(hit) = cache
                .lookup(&self.ufs, key, stamp, &request.workspace)
                .await?
        {
            debug!(bulk = hit.bulk, "satisfied from cache");
            return Ok(Execution {
                outcome: ProcessOutcome::default(),
                via: Backend::Cache,
            });
        }

        let execution = match self.try_remote(request).await? {
            Some(outcome) => Execution {
                outcome,
                via: Backend::Remote,
            },
            None => {
                let _permit = self
                    .local_slots
                    .acquire()
                    .await
                    .context("acquire local slot")?;
                let outcome = self.runner.run(&request.rules, &self.cancel).await?;
                Execution {
                    outcome,
                    via: Backend::Local,
                }
            }
        };

        // Ingest fresh outputs so equivalent work is never repeated, here
        // or on another machine sharing the cache.
        if execution.outcome.success()
            && let (Some(cache), Some((key, stamp))) = (&self.cache, &cache_key)
        {
            let mut existing = Vec::new();
            for output in request.outputs.iter() {
                self.ufs.invalidate(output);
                if output.starts_with(&request.workspace) && self.ufs.exists(output).await {
                    existing.push(output.clone());
                }
            }
            if !existing.is_empty()
                && let Err(err) = cache
                    .store(&self.ufs, key, stamp, &request.workspace, &existing)
                    .await
            {
                // A cache write failure must never fail the build.
                warn!(?err, "failed to store outputs in cache");
            }
        }

        Ok(execution)
    }

    async fn try_remote(&self, request: &ExecRequest) -> Result<Option<ProcessOutcome>> {
        let Some(remote) = &self.remote else {
            return Ok(None);
        };
        if !request.flags.allow_distribution() {
            return Ok(None);
        }
        remote.execute(request, &self.cancel).await
    }
}
