//! Filesystem operations tailored to `anvil`.
//!
//! Inside this module, we refer to `std::fs` or `tokio::fs` by its fully
//! qualified path to make it maximally clear what we are using.
//!
//! All other modules go through the [`Ufs`] façade so stat results can be
//! cached and invalidated centrally; a build touches the same headers tens
//! of thousands of times, and the kernel is not the cheap place to ask.

use std::{
    io::{BufRead, Write as StdWrite},
    marker::PhantomData,
    sync::{Arc, Mutex},
};

use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use dashmap::DashMap;
use derive_more::{Debug, Display};
use fslock::LockFile as FsLockFile;
use jiff::Timestamp;
use lazy_regex::regex::Regex;
use mesh::Digest;
use tap::TapFallible;
use tokio::task::spawn_blocking;
use tracing::{instrument, trace};
use walkdir::WalkDir;

use crate::path::AbsPath;

/// Buffer capacity handed out by the recycler; sized for typical sources.
const BUFFER_CAPACITY: usize = 256 * 1024;

/// Maximum buffers the recycler retains.
const BUFFER_POOL_LIMIT: usize = 32;

/// Stat record for one path.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct Metadata {
    pub len: u64,
    pub mtime: Timestamp,
    pub is_dir: bool,
}

impl Metadata {
    fn from_std(meta: &std::fs::Metadata) -> Result<Self> {
        let modified = meta.modified().context("read mtime")?;
        let mtime = Timestamp::try_from(modified).context("convert mtime")?;
        Ok(Self {
            len: meta.len(),
            mtime,
            is_dir: meta.is_dir(),
        })
    }
}

/// The process-wide file-system façade.
///
/// Stat records are cached per path in a sharded concurrent map. The cache
/// never distinguishes "absent" from "permission denied": both are the
/// underlying error, and callers that care inspect the `io::ErrorKind` in
/// the chain.
#[derive(Debug, Default)]
pub struct Ufs {
    #[debug(skip)]
    stats: DashMap<AbsPath, Arc<Metadata>>,
    #[debug(skip)]
    buffers: BufferPool,
}

impl Ufs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stat a path, consulting the cache first.
    #[instrument(skip(self))]
    pub async fn info(&self, path: &AbsPath) -> Result<Arc<Metadata>> {
        if let Some(cached) = self.stats.get(path) {
            return Ok(Arc::clone(&cached));
        }
        let meta = tokio::fs::metadata(path.as_std_path())
            .await
            .with_context(|| format!("stat {path}"))?;
        let meta = Arc::new(Metadata::from_std(&meta)?);
        self.stats.insert(path.clone(), Arc::clone(&meta));
        Ok(meta)
    }

    /// Whether the path currently exists.
    pub async fn exists(&self, path: &AbsPath) -> bool {
        self.info(path).await.is_ok()
    }

    /// Purge one cached stat record.
    pub fn invalidate(&self, path: &AbsPath) {
        self.stats.remove(path);
    }

    /// Purge every cached stat record.
    pub fn invalidate_all(&self) {
        self.stats.clear();
    }

    /// Create a directory and any missing parents.
    #[instrument(skip(self))]
    pub async fn create_dir_all(&self, path: &AbsPath) -> Result<()> {
        tokio::fs::create_dir_all(path.as_std_path())
            .await
            .with_context(|| format!("create {path}"))
    }

    /// Remove a file if present.
    #[instrument(skip(self))]
    pub async fn remove(&self, path: &AbsPath) -> Result<()> {
        match tokio::fs::remove_file(path.as_std_path()).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err).with_context(|| format!("remove {path}")),
        }
        self.invalidate(path);
        Ok(())
    }

    /// Read a whole file.
    #[instrument(skip(self))]
    pub async fn read(&self, path: &AbsPath) -> Result<Vec<u8>> {
        tokio::fs::read(path.as_std_path())
            .await
            .with_context(|| format!("read {path}"))
    }

    /// Read a whole file as UTF-8.
    pub async fn read_utf8(&self, path: &AbsPath) -> Result<String> {
        let bytes = self.read(path).await?;
        String::from_utf8(bytes).with_context(|| format!("decode {path}"))
    }

    /// Content digest of a file.
    pub async fn digest(&self, path: &AbsPath) -> Result<Digest> {
        let bytes = self.read(path).await?;
        Ok(Digest::from_buffer(bytes))
    }

    /// Write a file through a buffered writer, creating parent directories,
    /// then flush.
    #[instrument(skip(self, content))]
    pub async fn create_buffered(&self, path: &AbsPath, content: impl AsRef<[u8]>) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent.as_std_path())
                .await
                .with_context(|| format!("create {parent}"))?;
        }
        let path_owned = path.clone();
        let content = content.as_ref().to_vec();
        spawn_blocking(move || -> Result<()> {
            let file = std::fs::File::create(path_owned.as_std_path())
                .with_context(|| format!("create {path_owned}"))?;
            let mut writer = std::io::BufWriter::new(file);
            writer.write_all(&content).context("write content")?;
            writer.flush().context("flush")?;
            Ok(())
        })
        .await
        .context("join task")??;
        self.invalidate(path);
        Ok(())
    }

    /// Write a file atomically: a sibling temp file is written and renamed
    /// over the destination.
    ///
    /// Off by default elsewhere because rename is costly on some hosts;
    /// stores that must never be observed half-written opt in.
    #[instrument(skip(self, content))]
    pub async fn safe_create(&self, path: &AbsPath, content: impl AsRef<[u8]>) -> Result<()> {
        let parent = match path.parent() {
            Some(parent) => parent,
            None => bail!("cannot atomically create a filesystem root"),
        };
        tokio::fs::create_dir_all(parent.as_std_path())
            .await
            .with_context(|| format!("create {parent}"))?;
        let path_owned = path.clone();
        let content = content.as_ref().to_vec();
        spawn_blocking(move || -> Result<()> {
            let mut temp = tempfile::NamedTempFile::new_in(
                path_owned.parent().expect("checked above").as_std_path(),
            )
            .context("create temp file")?;
            temp.write_all(&content).context("write temp file")?;
            temp.flush().context("flush temp file")?;
            temp.persist(path_owned.as_std_path())
                .with_context(|| format!("rename into {path_owned}"))?;
            Ok(())
        })
        .await
        .context("join task")??;
        self.invalidate(path);
        Ok(())
    }

    /// Update a file's mtime to now, creating it empty if absent.
    #[instrument(skip(self))]
    pub async fn touch(&self, path: &AbsPath) -> Result<()> {
        if !self.exists(path).await {
            self.create_buffered(path, b"").await?;
            return Ok(());
        }
        let path_owned = path.clone();
        spawn_blocking(move || {
            filetime::set_file_mtime(path_owned.as_std_path(), filetime::FileTime::now())
                .with_context(|| format!("touch {path_owned}"))
        })
        .await
        .context("join task")??;
        self.invalidate(path);
        Ok(())
    }

    /// Read a file as lines, through a recycled buffer.
    #[instrument(skip(self))]
    pub async fn read_lines(&self, path: &AbsPath) -> Result<Vec<String>> {
        let mut buffer = self.buffers.checkout();
        buffer.extend_from_slice(&self.read(path).await?);
        let lines = buffer
            .as_slice()
            .lines()
            .collect::<std::io::Result<Vec<_>>>()
            .with_context(|| format!("read lines of {path}"))?;
        self.buffers.checkin(buffer);
        Ok(lines)
    }

    /// Scan a file for lines matching a pattern.
    #[instrument(skip(self, pattern), fields(pattern = pattern.as_str()))]
    pub async fn scan(&self, path: &AbsPath, pattern: &Regex) -> Result<Vec<String>> {
        let lines = self.read_lines(path).await?;
        Ok(lines
            .into_iter()
            .filter(|line| pattern.is_match(line))
            .collect())
    }

    /// Recursively enumerate files under `root` whose relative path matches
    /// the glob pattern (`*`, `?`, and `**` are supported).
    #[instrument(skip(self))]
    pub async fn glob(&self, root: &AbsPath, pattern: &str) -> Result<Vec<AbsPath>> {
        let regex = glob_to_regex(pattern)?;
        let root_owned = root.clone();
        spawn_blocking(move || -> Result<Vec<AbsPath>> {
            let mut matches = Vec::new();
            for entry in WalkDir::new(root_owned.as_std_path()).sort_by_file_name() {
                let entry = entry.context("walk directory")?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let path = AbsPath::try_from(entry.path())?;
                let rel = path.relative_to(&root_owned)?;
                let candidate = rel.as_std_path().to_string_lossy().replace('\\', "/");
                if regex.is_match(&candidate) {
                    matches.push(path);
                }
            }
            Ok(matches)
        })
        .await
        .context("join task")?
    }

    /// List the immediate entries of a directory, sorted by name.
    #[instrument(skip(self))]
    pub async fn list_dir(&self, path: &AbsPath) -> Result<Vec<String>> {
        let mut dir = tokio::fs::read_dir(path.as_std_path())
            .await
            .with_context(|| format!("open {path}"))?;
        let mut entries = Vec::new();
        while let Some(entry) = dir.next_entry().await.context("read dir entry")? {
            entries.push(entry.file_name().to_string_lossy().into_owned());
        }
        entries.sort();
        Ok(entries)
    }
}

/// Translate a glob into an anchored regex over slash-separated relative
/// paths.
fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let mut regex = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    // `**/` also swallows the separator so `**/foo.c`
                    // matches at the root.
                    if chars.peek() == Some(&'/') {
                        chars.next();
                        regex.push_str("(?:.*/)?");
                    } else {
                        regex.push_str(".*");
                    }
                } else {
                    regex.push_str("[^/]*");
                }
            }
            '?' => regex.push_str("[^/]"),
            c => regex.push_str(&lazy_regex::regex::escape(&c.to_string())),
        }
    }
    regex.push('$');
    Regex::new(&regex).with_context(|| format!("compile glob {pattern:?}"))
}

/// A small freelist of byte buffers sized for typical source files.
#[derive(Debug, Default)]
struct BufferPool {
    slots: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    fn checkout(&self) -> Vec<u8> {
        self.slots
            .lock()
            .ok()
            .and_then(|mut slots| slots.pop())
            .unwrap_or_else(|| Vec::with_capacity(BUFFER_CAPACITY))
    }

    fn checkin(&self, mut buffer: Vec<u8>) {
        buffer.clear();
        if let Ok(mut slots) = self.slots.lock() {
            if slots.len() < BUFFER_POOL_LIMIT {
                slots.push(buffer);
            }
        }
    }
}

/// Shared lock file on the file system.
///
/// Lock the file with [`LockFile::lock`]. Unlock it with
/// [`LockFile::unlock`], or by dropping the locked instance; the lock is
/// fd-tied, so the kernel also releases it if the process dies.
#[derive(Debug, Clone, Display)]
#[display("{path}")]
pub struct LockFile<State> {
    state: PhantomData<State>,
    path: AbsPath,
    inner: Arc<tokio::sync::Mutex<FsLockFile>>,
}

/// The associated type's state is unlocked. Used for the typestate pattern.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, Default)]
pub struct Unlocked;

/// The associated type's state is locked. Used for the typestate pattern.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, Default)]
pub struct Locked;

impl LockFile<Unlocked> {
    /// Create a new instance at the provided path.
    pub async fn open(path: AbsPath) -> Result<Self> {
        let (file, path) =
            spawn_blocking(move || FsLockFile::open(path.as_std_path()).map(|file| (file, path)))
                .await
                .context("join task")?
                .context("open lock file")?;
        Ok(Self {
            state: PhantomData,
            inner: Arc::new(tokio::sync::Mutex::new(file)),
            path,
        })
    }

    /// Lock the lockfile.
    #[instrument(skip_all, fields(%self))]
    pub async fn lock(self) -> Result<LockFile<Locked>> {
        spawn_blocking(move || {
            {
                // fslock::LockFile can panic if the handle is already
                // locked, but the typestate makes that unrepresentable.
                let mut inner = self.inner.blocking_lock();
                inner.lock().context("lock file")?;
            }
            Ok(LockFile {
                state: PhantomData,
                inner: self.inner,
                path: self.path,
            })
        })
        .await
        .context("join task")?
        .tap_ok(|f: &LockFile<Locked>| trace!(path = %f.path, "locked file"))
    }
}

impl LockFile<Locked> {
    /// Unlock the lockfile.
    #[instrument(skip_all, fields(%self))]
    pub async fn unlock(self) -> Result<LockFile<Unlocked>> {
        spawn_blocking(move || -> Result<_> {
            {
                let mut inner = self.inner.blocking_lock();
                inner.unlock().context("unlock file")?;
            }
            Ok(LockFile {
                state: PhantomData,
                inner: self.inner,
                path: self.path,
            })
        })
        .await
        .context("join task")?
        .tap_ok(|f: &LockFile<Unlocked>| trace!(path = %f.path, "unlocked file"))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn temp_root() -> (tempfile::TempDir, AbsPath) {
        let dir = tempfile::TempDir::new().expect("create temp dir");
        let path = AbsPath::try_from(dir.path()).expect("temp dir is absolute");
        (dir, path)
    }

    #[test_log::test(tokio::test)]
    async fn info_caches_until_invalidated() -> Result<()> {
        let (_guard, root) = temp_root();
        let ufs = Ufs::new();
        let file = root.join("a.txt");
        ufs.create_buffered(&file, b"one").await?;
        let before = ufs.info(&file).await?;

        // Bypass the façade so the cache goes stale.
        std::fs::write(file.as_std_path(), b"longer content").context("rewrite")?;
        let cached = ufs.info(&file).await?;
        assert_eq!(before.len, cached.len, "stale entry served from cache");

        ufs.invalidate(&file);
        let fresh = ufs.info(&file).await?;
        assert_eq!(fresh.len, 14);
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn safe_create_replaces_atomically() -> Result<()> {
        let (_guard, root) = temp_root();
        let ufs = Ufs::new();
        let file = root.join("store.bin");
        ufs.safe_create(&file, b"v1").await?;
        ufs.safe_create(&file, b"v2").await?;
        assert_eq!(ufs.read(&file).await?, b"v2");
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn glob_matches_relative_paths() -> Result<()> {
        let (_guard, root) = temp_root();
        let ufs = Ufs::new();
        ufs.create_buffered(&root.join("src/main.c"), b"").await?;
        ufs.create_buffered(&root.join("src/util/helper.c"), b"").await?;
        ufs.create_buffered(&root.join("src/util/helper.h"), b"").await?;
        ufs.create_buffered(&root.join("README.md"), b"").await?;

        let matches = ufs.glob(&root, "**/*.c").await?;
        let names = matches
            .iter()
            .map(|path| path.relative_to(&root).expect("under root").to_string())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["src/main.c", "src/util/helper.c"]);
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn scan_filters_lines() -> Result<()> {
        let (_guard, root) = temp_root();
        let ufs = Ufs::new();
        let file = root.join("log.txt");
        ufs.create_buffered(&file, b"error: one\ninfo: two\nerror: three\n")
            .await?;
        let pattern = Regex::new("^error:").context("compile")?;
        let hits = ufs.scan(&file, &pattern).await?;
        assert_eq!(hits, vec!["error: one", "error: three"]);
        Ok(())
    }

    #[test]
    fn glob_translation() -> Result<()> {
        let regex = glob_to_regex("src/**/*.o")?;
        assert!(regex.is_match("src/a.o"));
        assert!(regex.is_match("src/deep/tree/b.o"));
        assert!(!regex.is_match("other/a.o"));
        assert!(!regex.is_match("src/a.c"));
        Ok(())
    }
}
