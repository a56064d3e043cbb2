//! The process-wide priority thread pool.
//!
//! Long-running CPU-bound work (file hashing, archive replay, bulk
//! deflate/inflate) goes through this pool rather than the async runtime.
//! The queue is priority-ordered: [`Priority::HIGH`] is reserved for the
//! cache-probe path so latency-critical work preempts builds.
//!
//! Tasks are never cancelled directly; cancellation is modelled by a shared
//! token whose closure makes in-flight jobs return early on their own.

use std::{
    cmp::Ordering,
    collections::BinaryHeap,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, Condvar, Mutex,
        atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering},
    },
    thread::JoinHandle,
};

use color_eyre::{Result, eyre::Context};
use derive_more::Display;
use tracing::{error, trace};

/// Task priority; higher runs first, FIFO within a priority.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display)]
pub struct Priority(pub i32);

impl Priority {
    /// Reserved for the cache-check path.
    pub const HIGH: Priority = Priority(100);
    pub const NORMAL: Priority = Priority(0);
    pub const LOW: Priority = Priority(-100);
}

type Work = Box<dyn FnOnce() + Send + 'static>;

struct Job {
    priority: Priority,
    seq: u64,
    work: Work,
}

impl Eq for Job {}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Ord for Job {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority first; earlier submission first within one.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Job {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct State {
    queue: BinaryHeap<Job>,
    active: usize,
    shutdown: bool,
}

struct Inner {
    state: Mutex<State>,
    work_ready: Condvar,
    idle: Condvar,
    workload: AtomicUsize,
    seq: AtomicU64,
}

/// Priority work pool backed by OS threads.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<Inner>,
    threads: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("workload", &self.workload())
            .finish_non_exhaustive()
    }
}

impl Pool {
    /// Pool sized from the logical CPU count minus one.
    pub fn with_default_size() -> Self {
        Self::new(num_cpus::get().saturating_sub(1).max(1))
    }

    pub fn new(workers: usize) -> Self {
        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                queue: BinaryHeap::new(),
                active: 0,
                shutdown: false,
            }),
            work_ready: Condvar::new(),
            idle: Condvar::new(),
            workload: AtomicUsize::new(0),
            seq: AtomicU64::new(0),
        });
        let threads = (0..workers)
            .map(|index| {
                let inner = Arc::clone(&inner);
                std::thread::Builder::new()
                    .name(format!("anvil-pool-{index}"))
                    .spawn(move || worker_loop(&inner))
                    .expect("spawn pool worker")
            })
            .collect();
        Self {
            inner,
            threads: Arc::new(Mutex::new(threads)),
        }
    }

    /// Enqueue a job. Never blocks.
    pub fn queue(&self, priority: Priority, work: impl FnOnce() + Send + 'static) {
        let seq = self.inner.seq.fetch_add(1, AtomicOrdering::Relaxed);
        let mut state = self.inner.state.lock().expect("pool lock");
        state.queue.push(Job {
            priority,
            seq,
            work: Box::new(work),
        });
        self.inner.workload.fetch_add(1, AtomicOrdering::Relaxed);
        self.inner.work_ready.notify_one();
    }

    /// Run a job on the pool and await its result.
    pub async fn run<T, F>(&self, priority: Priority, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.queue(priority, move || {
            tx.send(work()).ok();
        });
        rx.await.context("pool job dropped")
    }

    /// Pending plus running job count.
    pub fn workload(&self) -> usize {
        self.inner.workload.load(AtomicOrdering::Relaxed)
    }

    /// Block until all queued work has completed.
    pub fn join(&self) {
        let mut state = self.inner.state.lock().expect("pool lock");
        while !state.queue.is_empty() || state.active > 0 {
            state = self.inner.idle.wait(state).expect("pool lock");
        }
    }

    /// Async wrapper over [`Pool::join`].
    pub async fn join_async(&self) -> Result<()> {
        let pool = self.clone();
        tokio::task::spawn_blocking(move || pool.join())
            .await
            .context("join task")
    }

    fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock().expect("pool lock");
            state.shutdown = true;
        }
        self.inner.work_ready.notify_all();
        let mut threads = self.threads.lock().expect("threads lock");
        for handle in threads.drain(..) {
            handle.join().ok();
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        // Workers each hold an `Arc<Inner>`; when only they and this
        // handle remain, this is the last user clone and it tears the
        // workers down.
        let workers = self.threads.lock().map(|t| t.len()).unwrap_or(0);
        if Arc::strong_count(&self.inner) == workers + 1 {
            self.shutdown();
        }
    }
}

fn worker_loop(inner: &Inner) {
    loop {
        let job = {
            let mut state = inner.state.lock().expect("pool lock");
            loop {
                if let Some(job) = state.queue.pop() {
                    state.active += 1;
                    break job;
                }
                if state.shutdown {
                    return;
                }
                state = inner.work_ready.wait(state).expect("pool lock");
            }
        };

        trace!(priority = %job.priority, seq = job.seq, "pool job start");
        // Recover-and-log boundary: a panicking job must not take the
        // worker thread (and every queued job behind it) down with it.
        if let Err(panic) = catch_unwind(AssertUnwindSafe(job.work)) {
            error!(?panic, "pool job panicked");
        }
        inner.workload.fetch_sub(1, AtomicOrdering::Relaxed);

        let mut state = inner.state.lock().expect("pool lock");
        state.active -= 1;
        if state.queue.is_empty() && state.active == 0 {
            inner.idle.notify_all();
        }
    }
}
