//! The content-addressed action cache.
//!
//! Layout on disk:
//!
//! ```text
//! <cache-root>/
//!   <fp[0:2]>/<fp[2:4]>/<fp>.entry       # metadata
//!   <fp[0:2]>/<fp[2:4]>/<fp>.<bulk>.blk  # compressed bulk
//! ```
//!
//! An entry carries zero or more bulks. Multiple bulks per key exist
//! because environment-varying but cache-equivalent runs may legitimately
//! produce different byte-identical outputs; on a hit any bulk that
//! inflates cleanly is acceptable. Writers of one key serialize on a
//! per-entry advisory lock; readers never block.

pub mod bulk;

use std::time::Duration;

use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use jiff::Timestamp;
use mesh::{
    Digest,
    archive::{self, Archivable, Archive},
};
use tracing::{debug, instrument, warn};
use walkdir::WalkDir;

use crate::{
    fs::{LockFile, Ufs},
    path::AbsPath,
    pool::{Pool, Priority},
};

/// Entry schema version; a mismatch deletes the entry (treated as a miss).
pub const CACHE_STORE_VERSION: u32 = 1;

/// Bulks older than this are reaped by [`ActionCache::check`].
pub const DEFAULT_MAX_BULK_AGE: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Metadata for one stored bulk.
#[derive(Clone, Default, Eq, PartialEq, Debug)]
pub struct BulkRecord {
    /// File name of the bulk next to the entry.
    pub path: String,
    /// Digest of the bulk archive bytes.
    pub fingerprint: Digest,
    /// Digest over the input-file fingerprints at store time.
    pub inputs_stamp: Digest,
    pub created: Timestamp,
}

impl Archivable for BulkRecord {
    fn archive(&mut self, ar: &mut dyn Archive) -> Result<()> {
        self.path.archive(ar)?;
        self.fingerprint.archive(ar)?;
        self.inputs_stamp.archive(ar)?;
        self.created.archive(ar)
    }
}

/// The on-disk entry metadata.
#[derive(Clone, Default, Eq, PartialEq, Debug)]
pub struct CacheEntry {
    pub key: Digest,
    pub bulks: Vec<BulkRecord>,
}

impl Archivable for CacheEntry {
    fn archive(&mut self, ar: &mut dyn Archive) -> Result<()> {
        archive::version_tag(ar, CACHE_STORE_VERSION)?;
        self.key.archive(ar)?;
        self.bulks.archive(ar)
    }
}

/// A successful lookup.
#[derive(Clone, Debug)]
pub struct CacheHit {
    /// Relative path and digest of every inflated output.
    pub files: Vec<(String, Digest)>,
    /// Which bulk satisfied the hit.
    pub bulk: String,
}

/// Summary of a [`ActionCache::check`] pass.
#[derive(Clone, Copy, Default, Debug)]
pub struct CheckReport {
    pub entries: usize,
    pub bulks_kept: usize,
    pub bulks_deleted: usize,
}

/// Size and population counters for reporting.
#[derive(Clone, Copy, Default, Debug)]
pub struct CacheStats {
    pub entries: usize,
    pub bulks: usize,
    pub bytes: u64,
}

/// The content-addressed store of action outputs.
#[derive(Clone, Debug)]
pub struct ActionCache {
    root: AbsPath,
}

impl ActionCache {
    /// Open (creating if needed) a cache at the given root.
    #[instrument(skip(ufs))]
    pub async fn open(ufs: &Ufs, root: AbsPath) -> Result<Self> {
        ufs.create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &AbsPath {
        &self.root
    }

    /// Compute the cache key and inputs stamp for an action.
    ///
    /// The key is the action fingerprint combined with the fingerprint of
    /// every input file, resolved now. Input hashing runs at high priority
    /// so cache probes preempt queued build work.
    #[instrument(skip_all, fields(%action_fingerprint, inputs = inputs.len()))]
    pub async fn cache_key(
        ufs: &Ufs,
        pool: &Pool,
        action_fingerprint: Digest,
        inputs: &[AbsPath],
    ) -> Result<(Digest, Digest)> {
        let mut input_digests = Vec::with_capacity(inputs.len());
        for input in inputs {
            let content = ufs.read(input).await?;
            let digest = pool
                .run(Priority::HIGH, move || Digest::from_buffer(content))
                .await?;
            input_digests.push(digest);
        }
        let inputs_stamp = Digest::combine(input_digests);
        let key = Digest::combine([action_fingerprint, inputs_stamp]);
        Ok((key, inputs_stamp))
    }

    fn shard_dir(&self, key: &Digest) -> AbsPath {
        let hex = key.to_hex();
        self.root.join(&hex[0..2]).join(&hex[2..4])
    }

    fn entry_path(&self, key: &Digest) -> AbsPath {
        self.shard_dir(key).join(format!("{}.entry", key.to_hex()))
    }

    fn bulk_path(&self, key: &Digest, bulk: &str) -> AbsPath {
        self.shard_dir(key).join(bulk)
    }

    fn lock_path(&self, key: &Digest) -> AbsPath {
        self.shard_dir(key).join(format!("{}.lock", key.to_hex()))
    }

    async fn read_entry(&self, ufs: &Ufs, key: &Digest) -> Result<Option<CacheEntry>> {
        let path = self.entry_path(key);
        ufs.invalidate(&path);
        if !ufs.exists(&path).await {
            return Ok(None);
        }
        let bytes = ufs.read(&path).await?;
        match archive::from_bytes::<CacheEntry>(&bytes) {
            Ok(entry) => Ok(Some(entry)),
            Err(err) => {
                // Corrupt metadata: delete the offender, treat as a miss.
                warn!(%path, ?err, "deleting unreadable cache entry");
                ufs.remove(&path).await?;
                Ok(None)
            }
        }
    }

    async fn write_entry(&self, ufs: &Ufs, entry: &CacheEntry) -> Result<()> {
        let mut entry = entry.clone();
        let bytes = archive::to_bytes(&mut entry)?;
        ufs.safe_create(&self.entry_path(&entry.key), &bytes).await
    }

    /// Try to satisfy an action from the cache.
    ///
    /// Bulks are consulted newest-first; the first one whose inputs stamp
    /// matches and which inflates cleanly wins. A bulk that fails to
    /// inflate is deleted and the next candidate is tried.
    #[instrument(skip(self, ufs), fields(%key))]
    pub async fn lookup(
        &self,
        ufs: &Ufs,
        key: &Digest,
        inputs_stamp: &Digest,
        output_root: &AbsPath,
    ) -> Result<Option<CacheHit>> {
        let Some(mut entry) = self.read_entry(ufs, key).await? else {
            return Ok(None);
        };

        let mut pruned = false;
        let mut hit = None;
        let records = entry.bulks.clone();
        for record in records.iter().rev() {
            if record.inputs_stamp != *inputs_stamp {
                continue;
            }
            let bulk_path = self.bulk_path(key, &record.path);
            let bytes = match ufs.read(&bulk_path).await {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(%bulk_path, ?err, "bulk unreadable, dropping");
                    entry.bulks.retain(|candidate| candidate.path != record.path);
                    pruned = true;
                    continue;
                }
            };
            match bulk::inflate(ufs, &bytes, output_root).await {
                Ok(files) => {
                    debug!(bulk = record.path, "cache hit");
                    hit = Some(CacheHit {
                        files,
                        bulk: record.path.clone(),
                    });
                    break;
                }
                Err(err) => {
                    warn!(bulk = record.path, ?err, "bulk corrupt, deleting");
                    ufs.remove(&bulk_path).await.ok();
                    entry.bulks.retain(|candidate| candidate.path != record.path);
                    pruned = true;
                }
            }
        }

        if pruned {
            self.write_entry(ufs, &entry).await?;
        }
        Ok(hit)
    }

    /// Store a fresh output set as a new bulk under the key.
    #[instrument(skip(self, ufs, outputs), fields(%key, outputs = outputs.len()))]
    pub async fn store(
        &self,
        ufs: &Ufs,
        key: &Digest,
        inputs_stamp: &Digest,
        output_root: &AbsPath,
        outputs: &[AbsPath],
    ) -> Result<()> {
        ufs.create_dir_all(&self.shard_dir(key)).await?;

        let bytes = bulk::deflate(ufs, output_root, outputs).await?;
        let fingerprint = Digest::from_buffer(&bytes);
        let bulk_name = format!("{}.{}.blk", key.to_hex(), &fingerprint.to_hex()[0..8]);

        // Writers of the same key serialize on the entry lock; the lock is
        // fd-tied so a crashed writer releases it with its process.
        let lock = LockFile::open(self.lock_path(key)).await?.lock().await?;

        ufs.safe_create(&self.bulk_path(key, &bulk_name), &bytes)
            .await?;

        let mut entry = self
            .read_entry(ufs, key)
            .await?
            .unwrap_or_else(|| CacheEntry {
                key: *key,
                bulks: Vec::new(),
            });
        if !entry.bulks.iter().any(|record| record.fingerprint == fingerprint
            && record.inputs_stamp == *inputs_stamp)
        {
            entry.bulks.push(BulkRecord {
                path: bulk_name,
                fingerprint,
                inputs_stamp: *inputs_stamp,
                created: Timestamp::now(),
            });
            self.write_entry(ufs, &entry).await?;
        }

        lock.unlock().await?;
        Ok(())
    }

    /// Validate the whole cache: inflate every bulk into a scratch
    /// directory, deleting bulks that are too old or fail to inflate.
    #[instrument(skip(self, ufs))]
    pub async fn check(&self, ufs: &Ufs, max_age: Duration) -> Result<CheckReport> {
        let mut report = CheckReport::default();
        let now = Timestamp::now();

        for entry_path in self.walk_entries()? {
            let key = key_of_entry_path(&entry_path)?;
            let Some(mut entry) = self.read_entry(ufs, &key).await? else {
                continue;
            };
            report.entries += 1;

            let lock = LockFile::open(self.lock_path(&key)).await?.lock().await?;
            let mut kept = Vec::new();
            for record in entry.bulks.drain(..) {
                let age = now
                    .since(record.created)
                    .ok()
                    .and_then(|span| span.total(jiff::Unit::Second).ok())
                    .filter(|seconds| *seconds >= 0.0)
                    .map(Duration::from_secs_f64)
                    .unwrap_or(Duration::MAX);
                let bulk_path = self.bulk_path(&key, &record.path);
                let valid = if age > max_age {
                    false
                } else {
                    match ufs.read(&bulk_path).await {
                        Ok(bytes) => {
                            let scratch = tempfile::TempDir::new().context("create scratch")?;
                            let scratch_root = AbsPath::try_from(scratch.path())?;
                            bulk::inflate(ufs, &bytes, &scratch_root).await.is_ok()
                        }
                        Err(_) => false,
                    }
                };
                if valid {
                    report.bulks_kept += 1;
                    kept.push(record);
                } else {
                    debug!(bulk = record.path, "reaping bulk");
                    ufs.remove(&bulk_path).await.ok();
                    report.bulks_deleted += 1;
                }
            }
            entry.bulks = kept;
            if entry.bulks.is_empty() {
                ufs.remove(&self.entry_path(&key)).await?;
            } else {
                self.write_entry(ufs, &entry).await?;
            }
            lock.unlock().await?;
        }

        Ok(report)
    }

    /// Walk the cache and total up its population.
    #[instrument(skip(self))]
    pub async fn stats(&self) -> Result<CacheStats> {
        let mut stats = CacheStats::default();
        for entry in WalkDir::new(self.root.as_std_path()) {
            let entry = entry.context("walk cache")?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if name.ends_with(".entry") {
                stats.entries += 1;
            } else if name.ends_with(".blk") {
                stats.bulks += 1;
            } else {
                continue;
            }
            stats.bytes += entry.metadata().map(|meta| meta.len()).unwrap_or(0);
        }
        Ok(stats)
    }

    /// Delete everything under the cache root.
    #[instrument(skip(self))]
    pub async fn reset(&self) -> Result<()> {
        tokio::fs::remove_dir_all(self.root.as_std_path())
            .await
            .with_context(|| format!("remove {}", self.root))?;
        tokio::fs::create_dir_all(self.root.as_std_path())
            .await
            .with_context(|| format!("recreate {}", self.root))
    }

    fn walk_entries(&self) -> Result<Vec<AbsPath>> {
        let mut entries = Vec::new();
        for entry in WalkDir::new(self.root.as_std_path()) {
            let entry = entry.context("walk cache")?;
            if entry.file_type().is_file()
                && entry.file_name().to_string_lossy().ends_with(".entry")
            {
                entries.push(AbsPath::try_from(entry.path())?);
            }
        }
        Ok(entries)
    }
}

fn key_of_entry_path(path: &AbsPath) -> Result<Digest> {
    let name = path
        .file_name()
        .ok_or_else(|| eyre!("entry path has no name: {path}"))?;
    let hex = name
        .strip_suffix(".entry")
        .ok_or_else(|| eyre!("not an entry path: {path}"))?;
    Digest::from_hex(hex)
}
