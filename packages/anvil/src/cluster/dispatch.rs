//! Client-side remote dispatch.
//!
//! One attempt per retry: pick a random live peer, open a tunnel, send the
//! task, and stream back file accesses and output until the stop message.
//! A refusal or a transient failure moves on to another peer; after the
//! budget is spent the caller falls back to local execution. A task that
//! ran and failed is final: its exit code is meaningful and is never
//! retried.

use std::sync::Arc;

use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use mesh::{
    compress::Codec,
    message::{Message, MountPoint, RemoteError, TaskDispatch},
    peer::PeerDescriptor,
    tunnel::{self, Tunnel, TunnelConfig},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::{
    action::runner::ProcessOutcome,
    cluster::broker::Roster,
    executor::ExecRequest,
    path::AbsPath,
};

/// A client-local path prefix exposed to workers over HTTP.
#[derive(Clone, Debug)]
pub struct ShareMount {
    pub path: AbsPath,
    pub url_prefix: String,
}

/// Dispatches actions to cluster workers.
pub struct RemoteDispatcher {
    endpoint: quinn::Endpoint,
    roster: Arc<Roster>,
    config: TunnelConfig,
    share: Option<ShareMount>,
}

impl std::fmt::Debug for RemoteDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteDispatcher")
            .field("peers", &self.roster.len())
            .finish_non_exhaustive()
    }
}

impl RemoteDispatcher {
    pub fn new(
        roster: Arc<Roster>,
        config: TunnelConfig,
        share: Option<ShareMount>,
    ) -> Result<Self> {
        let endpoint = tunnel::client_endpoint()?;
        Ok(Self {
            endpoint,
            roster,
            config,
            share,
        })
    }

    /// Try to run the request remotely.
    ///
    /// `Ok(None)` means no peer took the task; the caller runs it locally.
    #[instrument(skip_all)]
    pub async fn execute(
        &self,
        request: &ExecRequest,
        cancel: &CancellationToken,
    ) -> Result<Option<ProcessOutcome>> {
        for attempt in 0..self.config.retry_count {
            if cancel.is_cancelled() {
                bail!("dispatch cancelled");
            }
            let Some(peer) = self.roster.random_peer() else {
                debug!(attempt, "no live peers, falling back to local");
                return Ok(None);
            };

            match self.try_peer(&peer, request).await {
                Ok(PeerReply::Done(outcome)) => return Ok(Some(outcome)),
                Ok(PeerReply::Refused) => {
                    debug!(peer = peer.fqdn, attempt, "worker refused, trying another");
                }
                Err(err) => {
                    // Transient by policy: timeouts and internal errors
                    // burn a retry, then the local fallback picks it up.
                    warn!(peer = peer.fqdn, attempt, ?err, "remote attempt failed");
                }
            }
        }
        Ok(None)
    }

    async fn try_peer(
        &self,
        peer: &PeerDescriptor,
        request: &ExecRequest,
    ) -> Result<PeerReply> {
        let mut config = self.config.clone();
        config.codec = Codec::new(peer.compression);
        let mut tunnel = Tunnel::connect(&self.endpoint, peer.tunnel_addr(), config)
            .await
            .with_context(|| format!("connect to {}", peer.fqdn))?;

        let mounts = self
            .share
            .iter()
            .map(|share| MountPoint {
                path: share.path.as_std_path().to_path_buf(),
                url_prefix: share.url_prefix.clone(),
            })
            .collect();
        let dispatch = TaskDispatch {
            executable: request.rules.executable.as_std_path().to_path_buf(),
            arguments: request.rules.arguments.clone(),
            environment: request.rules.environment.clone(),
            working_dir: request.rules.working_dir.as_std_path().to_path_buf(),
            mounts,
            inputs: request
                .inputs
                .iter()
                .map(|input| input.as_std_path().to_path_buf())
                .collect(),
            use_response_file: false,
        };
        tunnel.send(Message::Dispatch(dispatch)).await?;

        match tunnel.next_message().await? {
            Message::Start {
                code: RemoteError::NoError,
            } => {}
            Message::Start {
                code: RemoteError::Refused,
            } => {
                tunnel.goodbye().await.ok();
                return Ok(PeerReply::Refused);
            }
            Message::Start { code } => bail!("worker rejected task: {code}"),
            other => bail!("expected start, got {}", other.kind()),
        }

        let mut outcome = ProcessOutcome::default();
        loop {
            match tunnel.next_message().await? {
                Message::FileAccess { records } => outcome.accesses.extend(records),
                Message::Output { lines } => outcome.output.extend(lines),
                Message::Stop { exit_code, code } => match code {
                    RemoteError::NoError | RemoteError::Process => {
                        outcome.exit_code = exit_code;
                        break;
                    }
                    code => bail!("remote task failed: {code}"),
                },
                Message::Goodbye => bail!("tunnel closed before task stop"),
                other => bail!("unexpected message: {}", other.kind()),
            }
        }

        tunnel.goodbye().await.ok();
        Ok(PeerReply::Done(outcome))
    }
}

enum PeerReply {
    Done(ProcessOutcome),
    Refused,
}
