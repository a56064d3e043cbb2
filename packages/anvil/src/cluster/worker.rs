//! The worker service: admission, resource tracking, and task execution.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use mesh::{
    message::{FileAccess, Message, RemoteError, TaskDispatch},
    peer::PeerDescriptor,
    tunnel::{Tunnel, TunnelConfig},
};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::{
    action::runner::{CommandRules, ProcessRunner},
    cluster::broker::{Brokerage, DEFAULT_BROADCAST_TICK},
    fs::Ufs,
    path::AbsPath,
};

/// Free memory a worker must keep before accepting any task.
pub const MIN_FREE_MEMORY: u64 = 4 << 30;

/// How a worker decides whether to accept remote tasks.
#[derive(
    Copy, Clone, Default, Eq, PartialEq, Hash, Debug, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PeerMode {
    /// Refuse always.
    #[default]
    Disabled,
    /// Accept up to `threads - jobs_in_flight`.
    Dedicated,
    /// Accept `cores * (1 - cpu%) - jobs_in_flight`.
    Proportional,
    /// As proportional, but only after the CPU has stayed below the idle
    /// threshold for the cooldown.
    Idle,
}

/// Worker behavior knobs.
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub mode: PeerMode,
    pub min_free_memory: u64,
    pub max_threads: Option<u32>,
    pub idle_threshold: f32,
    pub idle_cooldown: Duration,
    pub broadcast_tick: Duration,
    pub tunnel: TunnelConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            mode: PeerMode::Disabled,
            min_free_memory: MIN_FREE_MEMORY,
            max_threads: None,
            idle_threshold: 0.25,
            idle_cooldown: Duration::from_secs(30),
            broadcast_tick: DEFAULT_BROADCAST_TICK,
            tunnel: TunnelConfig::default(),
        }
    }
}

/// Sliding view of CPU and memory so short spikes do not flip
/// availability.
pub struct ResourceMonitor {
    system: Mutex<sysinfo::System>,
    /// Moving average of CPU usage, stored as f32 bits in [0, 1].
    cpu_avg: AtomicU32,
    free_memory: AtomicU64,
    idle_since: Mutex<Option<Instant>>,
    idle_threshold: f32,
}

impl ResourceMonitor {
    pub fn new(idle_threshold: f32) -> Self {
        Self {
            system: Mutex::new(sysinfo::System::new_all()),
            cpu_avg: AtomicU32::new(0f32.to_bits()),
            free_memory: AtomicU64::new(u64::MAX),
            idle_since: Mutex::new(None),
            idle_threshold,
        }
    }

    /// Take one sample and fold it into the moving average.
    pub fn sample(&self) {
        let (cpu, free) = {
            let mut system = self.system.lock().expect("monitor lock");
            system.refresh_cpu_usage();
            system.refresh_memory();
            (
                system.global_cpu_usage() / 100.0,
                system.available_memory(),
            )
        };
        let previous = f32::from_bits(self.cpu_avg.load(Ordering::Relaxed));
        let average = previous * 0.8 + cpu * 0.2;
        self.cpu_avg.store(average.to_bits(), Ordering::Relaxed);
        self.free_memory.store(free, Ordering::Relaxed);

        let mut idle_since = self.idle_since.lock().expect("monitor lock");
        if average < self.idle_threshold {
            idle_since.get_or_insert_with(Instant::now);
        } else {
            *idle_since = None;
        }
    }

    /// CPU usage in [0, 1], smoothed.
    pub fn cpu_fraction(&self) -> f32 {
        f32::from_bits(self.cpu_avg.load(Ordering::Relaxed))
    }

    pub fn free_memory(&self) -> u64 {
        self.free_memory.load(Ordering::Relaxed)
    }

    /// How long the CPU has continuously been below the idle threshold.
    pub fn idle_for(&self) -> Option<Duration> {
        self.idle_since
            .lock()
            .expect("monitor lock")
            .map(|since| since.elapsed())
    }
}

/// Decides whether this worker takes another task.
pub struct Admission {
    mode: PeerMode,
    min_free_memory: u64,
    max_threads: Option<u32>,
    idle_cooldown: Duration,
    threads: u32,
    cores: u32,
    monitor: ResourceMonitor,
    jobs: AtomicU32,
}

impl Admission {
    pub fn new(config: &WorkerConfig) -> Self {
        Self {
            mode: config.mode,
            min_free_memory: config.min_free_memory,
            max_threads: config.max_threads,
            idle_cooldown: config.idle_cooldown,
            threads: u32::try_from(num_cpus::get()).unwrap_or(1),
            cores: u32::try_from(num_cpus::get_physical()).unwrap_or(1),
            monitor: ResourceMonitor::new(config.idle_threshold),
            jobs: AtomicU32::new(0),
        }
    }

    pub fn monitor(&self) -> &ResourceMonitor {
        &self.monitor
    }

    pub fn jobs_in_flight(&self) -> u32 {
        self.jobs.load(Ordering::Relaxed)
    }

    /// Slots this worker would accept right now.
    pub fn available(&self) -> u32 {
        if self.monitor.free_memory() < self.min_free_memory {
            return 0;
        }
        let jobs = self.jobs_in_flight();
        let base = match self.mode {
            PeerMode::Disabled => 0,
            PeerMode::Dedicated => self.threads.saturating_sub(jobs),
            PeerMode::Proportional => self.proportional(jobs),
            PeerMode::Idle => {
                let cooled = self
                    .monitor
                    .idle_for()
                    .is_some_and(|idle| idle >= self.idle_cooldown);
                if cooled { self.proportional(jobs) } else { 0 }
            }
        };
        match self.max_threads {
            Some(cap) => base.min(cap.saturating_sub(jobs)),
            None => base,
        }
    }

    fn proportional(&self, jobs: u32) -> u32 {
        let idle_share = (1.0 - self.monitor.cpu_fraction()).max(0.0);
        let slots = (self.cores as f32 * idle_share) as i64 - i64::from(jobs);
        u32::try_from(slots.max(0)).unwrap_or(0)
    }

    /// Claim a slot if one is available.
    pub fn try_admit(self: &Arc<Self>) -> Option<AdmissionGuard> {
        if self.available() == 0 {
            return None;
        }
        self.jobs.fetch_add(1, Ordering::Relaxed);
        Some(AdmissionGuard {
            admission: Arc::clone(self),
        })
    }
}

/// Releases the claimed slot on drop.
pub struct AdmissionGuard {
    admission: Arc<Admission>,
}

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        self.admission.jobs.fetch_sub(1, Ordering::Relaxed);
    }
}

/// The worker service: accepts tunnels, runs admitted tasks, and keeps
/// its brokerage advertisement fresh.
pub struct Worker {
    endpoint: quinn::Endpoint,
    brokerage: Brokerage,
    descriptor: PeerDescriptor,
    admission: Arc<Admission>,
    runner: Arc<dyn ProcessRunner>,
    ufs: Arc<Ufs>,
    config: WorkerConfig,
}

impl Worker {
    /// Bind the tunnel endpoint and assemble the worker.
    pub fn bind(
        bind: std::net::SocketAddr,
        mut descriptor: PeerDescriptor,
        brokerage: Brokerage,
        config: WorkerConfig,
        ufs: Arc<Ufs>,
        runner: Arc<dyn ProcessRunner>,
    ) -> Result<Self> {
        let endpoint = mesh::tunnel::server_endpoint(bind)?;
        let local = endpoint.local_addr().context("read endpoint addr")?;
        descriptor.tunnel_port = local.port();
        Ok(Self {
            endpoint,
            brokerage,
            descriptor,
            admission: Arc::new(Admission::new(&config)),
            runner,
            ufs,
            config,
        })
    }

    pub fn descriptor(&self) -> &PeerDescriptor {
        &self.descriptor
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        self.endpoint.local_addr().context("read endpoint addr")
    }

    /// Serve until cancelled.
    #[instrument(skip_all, fields(fqdn = self.descriptor.fqdn))]
    pub async fn serve(&self, cancel: CancellationToken) -> Result<()> {
        let broadcaster = self.spawn_broadcaster(cancel.clone());
        info!(addr = %self.local_addr()?, mode = %self.config.mode, "worker serving");

        loop {
            let tunnel = tokio::select! {
                () = cancel.cancelled() => break,
                tunnel = Tunnel::accept(&self.endpoint, self.config.tunnel.clone()) => tunnel,
            };
            let tunnel = match tunnel {
                Ok(tunnel) => tunnel,
                Err(err) => {
                    warn!(?err, "failed to accept tunnel");
                    continue;
                }
            };

            let admission = Arc::clone(&self.admission);
            let runner = Arc::clone(&self.runner);
            let ufs = Arc::clone(&self.ufs);
            let task_cancel = cancel.clone();
            tokio::spawn(async move {
                // Recover-and-log boundary: one broken tunnel must not
                // take the accept loop down.
                if let Err(err) = handle_tunnel(tunnel, admission, runner, ufs, task_cancel).await
                {
                    warn!(?err, "tunnel handler failed");
                }
            });
        }

        self.brokerage
            .withdraw(&self.ufs, &self.descriptor.fqdn)
            .await
            .ok();
        broadcaster.abort();
        Ok(())
    }

    fn spawn_broadcaster(&self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let brokerage = self.brokerage.clone();
        let descriptor = self.descriptor.clone();
        let admission = Arc::clone(&self.admission);
        let ufs = Arc::clone(&self.ufs);
        let tick = self.config.broadcast_tick;
        tokio::spawn(async move {
            let was_available = AtomicBool::new(false);
            let mut interval = tokio::time::interval(tick);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                admission.monitor().sample();
                let available = admission.available() > 0;
                if available != was_available.swap(available, Ordering::Relaxed) {
                    debug!(available, "availability crossed zero");
                }
                if let Err(err) = brokerage.publish(&ufs, &descriptor).await {
                    warn!(?err, "failed to publish descriptor");
                }
            }
        })
    }
}

#[instrument(skip_all, fields(remote = %tunnel.remote_addr()))]
async fn handle_tunnel(
    mut tunnel: Tunnel,
    admission: Arc<Admission>,
    runner: Arc<dyn ProcessRunner>,
    ufs: Arc<Ufs>,
    cancel: CancellationToken,
) -> Result<()> {
    let dispatch = match tunnel.next_message().await? {
        Message::Dispatch(dispatch) => dispatch,
        Message::Goodbye => return Ok(()),
        other => bail!("expected dispatch, got {}", other.kind()),
    };

    let Some(_slot) = admission.try_admit() else {
        debug!("no capacity, refusing task");
        tunnel
            .send(Message::Start {
                code: RemoteError::Refused,
            })
            .await?;
        tunnel.goodbye().await.ok();
        return Ok(());
    };

    tunnel
        .send(Message::Start {
            code: RemoteError::NoError,
        })
        .await?;

    let staged = match stage_task(&ufs, &dispatch).await {
        Ok(staged) => staged,
        Err(err) => {
            warn!(?err, "failed to stage task inputs");
            tunnel
                .send(Message::Stop {
                    exit_code: -1,
                    code: RemoteError::Internal,
                })
                .await?;
            tunnel.goodbye().await.ok();
            return Ok(());
        }
    };

    let outcome = match runner.run(&staged.rules, &cancel).await {
        Ok(outcome) => outcome,
        Err(err) => {
            warn!(?err, "task execution failed internally");
            tunnel
                .send(Message::Stop {
                    exit_code: -1,
                    code: RemoteError::Internal,
                })
                .await?;
            tunnel.goodbye().await.ok();
            return Ok(());
        }
    };

    // Every staged input was read by definition; hosts with IO detouring
    // would stream records from the detour layer instead.
    for path in staged.read_files {
        tunnel
            .push_file_access(FileAccess {
                path,
                write: false,
            })
            .await?;
    }
    for line in outcome.output.iter().cloned() {
        tunnel.push_output(line).await?;
    }
    tunnel.flush().await?;

    let code = if outcome.exit_code == 0 {
        RemoteError::NoError
    } else {
        RemoteError::Process
    };
    tunnel
        .send(Message::Stop {
            exit_code: outcome.exit_code,
            code,
        })
        .await?;
    tunnel.goodbye().await.ok();
    Ok(())
}

/// A task made runnable on this machine.
struct StagedTask {
    rules: CommandRules,
    /// Input files the task read (original client paths).
    read_files: Vec<std::path::PathBuf>,
    /// Keeps the staging directory alive for the run.
    _staging: Option<tempfile::TempDir>,
}

/// Stage the minimum input set before spawning.
///
/// Inputs already present locally (shared filesystem, loopback) are used
/// in place. Anything else is fetched through the dispatch message's
/// mount map into a staging directory, and every path in the command is
/// rewritten from the mount prefix to the staged location.
async fn stage_task(ufs: &Ufs, dispatch: &TaskDispatch) -> Result<StagedTask> {
    let mut missing = Vec::new();
    for input in dispatch.inputs.iter() {
        let path = AbsPath::new(input.clone())?;
        ufs.invalidate(&path);
        if !ufs.exists(&path).await {
            missing.push(path);
        }
    }

    let mut rules = CommandRules {
        executable: AbsPath::new(dispatch.executable.clone())?,
        arguments: dispatch.arguments.clone(),
        working_dir: AbsPath::new(dispatch.working_dir.clone())?,
        environment: dispatch.environment.clone(),
    };
    let read_files = dispatch.inputs.clone();

    if missing.is_empty() {
        return Ok(StagedTask {
            rules,
            read_files,
            _staging: None,
        });
    }

    if dispatch.mounts.is_empty() {
        bail!("{} inputs missing and no mounts provided", missing.len());
    }

    let staging = tempfile::TempDir::new().context("create staging dir")?;
    let staging_root = AbsPath::try_from(staging.path())?;
    let client = reqwest::Client::new();

    // Each mount maps a client path prefix onto a fetch URL and a local
    // staging subtree.
    let mut translations = Vec::new();
    for (index, mount) in dispatch.mounts.iter().enumerate() {
        let mount_path = AbsPath::new(mount.path.clone())?;
        let staged_prefix = staging_root.join(format!("m{index}"));
        translations.push((mount_path, mount.url_prefix.clone(), staged_prefix));
    }

    for input in missing {
        let Some((mount_path, url_prefix, staged_prefix)) = translations
            .iter()
            .find(|(mount_path, _, _)| input.starts_with(mount_path))
        else {
            bail!("input {input} not covered by any mount");
        };
        let rel = input.relative_to(mount_path)?;
        let rel_url = rel.as_std_path().to_string_lossy().replace('\\', "/");
        let url = format!("{}/{}", url_prefix.trim_end_matches('/'), rel_url);
        let response = client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("fetch {url}"))?;
        if !response.status().is_success() {
            bail!("fetch {url} returned {}", response.status());
        }
        let bytes = response.bytes().await.context("read fetched input")?;
        ufs.create_buffered(&staged_prefix.join(&rel), &bytes).await?;
        debug!(%input, %url, "staged input");
    }

    // Rewrite command paths from mount prefixes to staged locations.
    let translate = |value: &str| -> String {
        for (mount_path, _, staged_prefix) in translations.iter() {
            let prefix = mount_path.to_string();
            if let Some(rest) = value.strip_prefix(&prefix) {
                return format!("{staged_prefix}{rest}");
            }
        }
        value.to_string()
    };
    rules.arguments = rules.arguments.iter().map(|arg| translate(arg)).collect();
    if let Ok(executable) = AbsPath::try_from(translate(&rules.executable.to_string()).as_str()) {
        rules.executable = executable;
    }
    if let Ok(workdir) = AbsPath::try_from(translate(&rules.working_dir.to_string()).as_str()) {
        ufs.create_dir_all(&workdir).await?;
        rules.working_dir = workdir;
    }

    Ok(StagedTask {
        rules,
        read_files,
        _staging: Some(staging),
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn config(mode: PeerMode) -> WorkerConfig {
        WorkerConfig {
            mode,
            // Keep admission deterministic under test load.
            min_free_memory: 0,
            ..WorkerConfig::default()
        }
    }

    #[test]
    fn disabled_mode_never_admits() {
        let admission = Arc::new(Admission::new(&config(PeerMode::Disabled)));
        assert_eq!(admission.available(), 0);
        assert!(admission.try_admit().is_none());
    }

    #[test]
    fn dedicated_mode_counts_down_with_jobs() {
        let admission = Arc::new(Admission::new(&config(PeerMode::Dedicated)));
        let before = admission.available();
        assert!(before > 0);
        let guard = admission.try_admit().expect("slot available");
        assert_eq!(admission.available(), before - 1);
        drop(guard);
        assert_eq!(admission.available(), before);
    }

    #[test]
    fn memory_floor_gates_every_mode() {
        let mut config = config(PeerMode::Dedicated);
        config.min_free_memory = u64::MAX;
        let admission = Arc::new(Admission::new(&config));
        admission.monitor().sample();
        assert_eq!(admission.available(), 0);
    }

    #[test]
    fn max_threads_caps_dedicated_slots() {
        let mut config = config(PeerMode::Dedicated);
        config.max_threads = Some(1);
        let admission = Arc::new(Admission::new(&config));
        let _guard = admission.try_admit().expect("first slot");
        assert_eq!(admission.available(), 0);
    }

    #[test]
    fn idle_mode_requires_cooldown() {
        let mut config = config(PeerMode::Idle);
        config.idle_cooldown = Duration::from_secs(3600);
        let admission = Arc::new(Admission::new(&config));
        // Fresh monitor: no idle history yet, so no capacity.
        assert_eq!(admission.available(), 0);
    }
}
