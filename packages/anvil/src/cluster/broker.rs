//! File-brokerage peer discovery.
//!
//! Workers rendezvous through a shared directory: each writes its JSON
//! descriptor under a folder named for the protocol version, so
//! incompatible peers silently never see each other. Discovery is a
//! directory scan with mtime-based liveness; there is no coordination and
//! no consensus.

use std::{collections::HashMap, time::Duration};

use color_eyre::{Result, eyre::Context};
use jiff::Timestamp;
use mesh::peer::{CURRENT_PEERVERSION, PeerDescriptor};
use rand::seq::{IteratorRandom, SliceRandom};
use tracing::{debug, instrument, trace, warn};

use crate::{fs::Ufs, path::AbsPath};

/// Peers whose descriptor mtime is older than this are considered gone.
pub const DEFAULT_PEER_TIMEOUT: Duration = Duration::from_secs(3);

/// How often a worker re-advertises itself.
pub const DEFAULT_BROADCAST_TICK: Duration = Duration::from_secs(2);

/// Upper bound on the adopted roster.
pub const MAX_PEERS: usize = 32;

/// Attempts [`Roster::random_peer`] makes before giving up.
const RANDOM_PEER_RETRIES: usize = 10;

/// The shared rendezvous directory.
#[derive(Clone, Debug)]
pub struct Brokerage {
    root: AbsPath,
    timeout: Duration,
    max_peers: usize,
}

impl Brokerage {
    pub fn new(root: AbsPath, timeout: Duration) -> Self {
        Self {
            root,
            timeout,
            max_peers: MAX_PEERS,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Clients rescan at a third of the liveness timeout.
    pub fn discovery_interval(&self) -> Duration {
        self.timeout / 3
    }

    /// The folder this protocol version rendezvouses in.
    pub fn versioned_dir(&self) -> AbsPath {
        self.root.join(format!("v{CURRENT_PEERVERSION}"))
    }

    fn descriptor_path(&self, fqdn: &str) -> AbsPath {
        self.versioned_dir().join(fqdn)
    }

    /// Advertise a worker. Called on start and on every broadcast tick so
    /// the descriptor mtime doubles as a liveness signal.
    #[instrument(skip(self, ufs, descriptor), fields(fqdn = descriptor.fqdn))]
    pub async fn publish(&self, ufs: &Ufs, descriptor: &PeerDescriptor) -> Result<()> {
        let json = serde_json::to_vec_pretty(descriptor).context("serialize descriptor")?;
        ufs.safe_create(&self.descriptor_path(&descriptor.fqdn), &json)
            .await
    }

    /// Remove a worker's advertisement on orderly shutdown.
    #[instrument(skip(self, ufs))]
    pub async fn withdraw(&self, ufs: &Ufs, fqdn: &str) -> Result<()> {
        ufs.remove(&self.descriptor_path(fqdn)).await
    }

    /// Scan the brokerage and adopt up to `max_peers` live descriptors.
    ///
    /// Returns the number of peers adopted this revision.
    #[instrument(skip(self, ufs, roster))]
    pub async fn discover(&self, ufs: &Ufs, roster: &Roster) -> Result<usize> {
        let dir = self.versioned_dir();
        ufs.invalidate(&dir);

        let mut found = Vec::new();
        if ufs.exists(&dir).await {
            for name in ufs.list_dir(&dir).await? {
                let path = dir.join(&name);
                ufs.invalidate(&path);
                let Ok(meta) = ufs.info(&path).await else {
                    continue;
                };
                if age_of(meta.mtime) > self.timeout {
                    trace!(%path, "descriptor too old, skipping");
                    continue;
                }
                let bytes = match ufs.read(&path).await {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        trace!(%path, ?err, "descriptor unreadable, skipping");
                        continue;
                    }
                };
                match serde_json::from_slice::<PeerDescriptor>(&bytes) {
                    Ok(descriptor) if descriptor.is_compatible() => found.push(descriptor),
                    Ok(descriptor) => {
                        trace!(version = descriptor.version, "incompatible peer, skipping");
                    }
                    Err(err) => {
                        warn!(%path, ?err, "malformed descriptor, skipping");
                    }
                }
            }
        }

        found.shuffle(&mut rand::thread_rng());
        found.truncate(self.max_peers);
        let adopted = found.len();
        roster.update(found);
        debug!(adopted, "discovery pass complete");
        Ok(adopted)
    }
}

/// One adopted peer.
#[derive(Clone, Debug)]
pub struct PeerEntry {
    pub descriptor: PeerDescriptor,
    pub last_seen: Timestamp,
    revision: u64,
}

struct RosterState {
    revision: u64,
    peers: HashMap<String, PeerEntry>,
}

/// The current set of known-live peers.
///
/// Scans bump an internal revision; entries not re-seen in the latest
/// revision are evicted. Reads vastly outnumber updates, so a
/// reader-preferring lock guards the map.
pub struct Roster {
    timeout: Duration,
    state: std::sync::RwLock<RosterState>,
}

impl Roster {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            state: std::sync::RwLock::new(RosterState {
                revision: 0,
                peers: HashMap::new(),
            }),
        }
    }

    fn update(&self, found: Vec<PeerDescriptor>) {
        let mut state = self.state.write().expect("roster lock");
        state.revision += 1;
        let revision = state.revision;
        let now = Timestamp::now();
        for descriptor in found {
            state.peers.insert(
                descriptor.fqdn.clone(),
                PeerEntry {
                    descriptor,
                    last_seen: now,
                    revision,
                },
            );
        }
        state.peers.retain(|_, entry| entry.revision == revision);
    }

    /// Pick a random live peer.
    ///
    /// Retries a bounded number of times, rejecting entries that timed out
    /// or belong to a previous revision; `None` sends the caller to local
    /// execution.
    pub fn random_peer(&self) -> Option<PeerDescriptor> {
        let state = self.state.read().expect("roster lock");
        let mut rng = rand::thread_rng();
        for _ in 0..RANDOM_PEER_RETRIES {
            let Some(entry) = state.peers.values().choose(&mut rng) else {
                return None;
            };
            if entry.revision != state.revision {
                continue;
            }
            if age_of(entry.last_seen) > self.timeout {
                continue;
            }
            return Some(entry.descriptor.clone());
        }
        None
    }

    pub fn snapshot(&self) -> Vec<PeerEntry> {
        let state = self.state.read().expect("roster lock");
        state.peers.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().expect("roster lock").peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn age_of(then: Timestamp) -> Duration {
    Timestamp::now()
        .since(then)
        .ok()
        .and_then(|span| span.total(jiff::Unit::Second).ok())
        .filter(|seconds| *seconds >= 0.0)
        .map(Duration::from_secs_f64)
        .unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use pretty_assertions::assert_eq;

    use super::*;

    fn temp_root() -> (tempfile::TempDir, AbsPath) {
        let dir = tempfile::TempDir::new().expect("create temp dir");
        let path = AbsPath::try_from(dir.path()).expect("temp dir is absolute");
        (dir, path)
    }

    fn descriptor(fqdn: &str) -> PeerDescriptor {
        PeerDescriptor {
            fqdn: fqdn.to_string(),
            addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            tunnel_port: 7117,
            ..PeerDescriptor::default()
        }
    }

    #[test_log::test(tokio::test)]
    async fn publish_then_discover_adopts_peer() -> Result<()> {
        let (_guard, root) = temp_root();
        let ufs = Ufs::new();
        let brokerage = Brokerage::new(root, DEFAULT_PEER_TIMEOUT);
        let roster = Roster::new(brokerage.timeout());

        brokerage.publish(&ufs, &descriptor("builder-01")).await?;
        let adopted = brokerage.discover(&ufs, &roster).await?;
        assert_eq!(adopted, 1);

        // Freshness: everything in the roster was seen just now.
        for entry in roster.snapshot() {
            assert!(age_of(entry.last_seen) < brokerage.timeout());
        }
        let peer = roster.random_peer().expect("one live peer");
        assert_eq!(peer.fqdn, "builder-01");
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn unseen_peers_are_evicted_on_the_next_revision() -> Result<()> {
        let (_guard, root) = temp_root();
        let ufs = Ufs::new();
        let brokerage = Brokerage::new(root, DEFAULT_PEER_TIMEOUT);
        let roster = Roster::new(brokerage.timeout());

        brokerage.publish(&ufs, &descriptor("builder-01")).await?;
        brokerage.discover(&ufs, &roster).await?;
        assert_eq!(roster.len(), 1);

        brokerage.withdraw(&ufs, "builder-01").await?;
        brokerage.discover(&ufs, &roster).await?;
        assert_eq!(roster.len(), 0);
        assert!(roster.random_peer().is_none());
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn incompatible_versions_are_ignored() -> Result<()> {
        let (_guard, root) = temp_root();
        let ufs = Ufs::new();
        let brokerage = Brokerage::new(root, DEFAULT_PEER_TIMEOUT);
        let roster = Roster::new(brokerage.timeout());

        let mut stale = descriptor("builder-old");
        stale.version = CURRENT_PEERVERSION + 1;
        brokerage.publish(&ufs, &stale).await?;
        let adopted = brokerage.discover(&ufs, &roster).await?;
        assert_eq!(adopted, 0);
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn missing_brokerage_dir_is_an_empty_roster() -> Result<()> {
        let (_guard, root) = temp_root();
        let ufs = Ufs::new();
        let brokerage = Brokerage::new(root.join("never-created"), DEFAULT_PEER_TIMEOUT);
        let roster = Roster::new(brokerage.timeout());
        assert_eq!(brokerage.discover(&ufs, &roster).await?, 0);
        Ok(())
    }
}
