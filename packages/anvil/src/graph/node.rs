//! Buildable nodes and their registry.
//!
//! Polymorphism over graph nodes is a small capability set: an alias, a
//! single archive traversal, and a `build` step. Variants are tagged by a
//! registered type index written at the head of each serialized node; the
//! tag replaces any need for runtime type introspection.

use async_trait::async_trait;
use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use derive_more::Display;
use jiff::Timestamp;
use mesh::{Archivable, Archive, Digest};
use tracing::instrument;

use crate::{fs::Ufs, graph::build::BuildContext, path::AbsPath};

/// The canonical string identity of a buildable.
///
/// Aliases are derived from the entity a node names: a file's absolute
/// path, a directory path with a listing marker, or an action's export
/// basename. Two buildables with equal aliases are the same node.
#[derive(
    Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display,
)]
pub struct Alias(String);

impl Alias {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Alias {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for Alias {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl Archivable for Alias {
    fn archive(&mut self, ar: &mut dyn Archive) -> Result<()> {
        self.0.archive(ar)
    }
}

/// The record left behind by a successful build.
///
/// A node is up-to-date when a fresh replay of its serializer yields the
/// stored fingerprint and none of its dependencies' stamps have changed.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct Stamp {
    pub fingerprint: Digest,
    pub mtime: Timestamp,
}

impl Default for Stamp {
    fn default() -> Self {
        Self {
            fingerprint: Digest::ZERO,
            mtime: Timestamp::default(),
        }
    }
}

impl Archivable for Stamp {
    fn archive(&mut self, ar: &mut dyn Archive) -> Result<()> {
        self.fingerprint.archive(ar)?;
        self.mtime.archive(ar)
    }
}

/// Any value that can live in the graph.
#[async_trait]
pub trait Buildable: Send + Sync + Archivable {
    /// The node's canonical identity.
    fn alias(&self) -> Alias;

    /// The registered type index for serialization.
    fn type_tag(&self) -> u32;

    /// Bring the node up to date, reporting discovered inputs and produced
    /// outputs through the context.
    async fn build(&mut self, ctx: &mut BuildContext) -> Result<()>;

    /// Cheap dirtiness probe against the file system.
    ///
    /// Derived nodes rely on fingerprint replay and dependency diffs; nodes
    /// backed by a file override this to compare the stat record against
    /// the stored stamp.
    async fn probe_dirty(&self, _ufs: &Ufs, _stamp: &Stamp) -> Result<bool> {
        Ok(false)
    }

    /// The mtime recorded in this node's stamp; `None` means "now".
    fn stamp_mtime(&self) -> Option<Timestamp> {
        None
    }

    /// The export basename, for nodes that publish one (actions).
    fn export_basename(&self) -> Option<String> {
        None
    }
}

pub const TAG_SOURCE_FILE: u32 = 1;
pub const TAG_GENERATED_FILE: u32 = 2;
pub const TAG_FILE_EXISTS: u32 = 3;
pub const TAG_DIRECTORY_LIST: u32 = 4;
pub const TAG_ACTION: u32 = 5;

/// Construct an empty node of the given registered type, ready to be
/// decoded from a store.
pub fn instantiate(tag: u32) -> Result<Box<dyn Buildable>> {
    Ok(match tag {
        TAG_SOURCE_FILE => Box::new(SourceFile::default()),
        TAG_GENERATED_FILE => Box::new(GeneratedFile::default()),
        TAG_FILE_EXISTS => Box::new(FileExists::default()),
        TAG_DIRECTORY_LIST => Box::new(DirectoryList::default()),
        TAG_ACTION => Box::new(crate::action::Action::default()),
        other => bail!("unknown node type tag: {other}"),
    })
}

/// A reference to a source file the project depends on.
///
/// Building the node refreshes its stat record and, when the mtime moved,
/// rehashes the content. The content digest is part of the archived form,
/// so a content change ripples into the fingerprint while a pure mtime
/// touch does not disturb downstream nodes.
#[derive(Clone, Default, Eq, PartialEq, Debug, Display)]
#[display("{path}")]
pub struct SourceFile {
    pub path: AbsPath,
    digest: Digest,
    mtime: Timestamp,
}

impl SourceFile {
    pub fn new(path: AbsPath) -> Self {
        Self {
            path,
            digest: Digest::ZERO,
            mtime: Timestamp::default(),
        }
    }

    pub fn content_digest(&self) -> Digest {
        self.digest
    }

    /// Refresh stat + content digest through the façade.
    #[instrument(skip(ufs))]
    async fn refresh(&mut self, ufs: &Ufs) -> Result<()> {
        ufs.invalidate(&self.path);
        let meta = ufs
            .info(&self.path)
            .await
            .with_context(|| format!("stat input {}", self.path))?;
        if self.digest.is_zero() || meta.mtime != self.mtime {
            self.digest = ufs.digest(&self.path).await?;
        }
        self.mtime = meta.mtime;
        Ok(())
    }
}

impl Archivable for SourceFile {
    fn archive(&mut self, ar: &mut dyn Archive) -> Result<()> {
        self.path.archive(ar)?;
        self.digest.archive(ar)?;
        self.mtime.archive(ar)
    }
}

#[async_trait]
impl Buildable for SourceFile {
    fn alias(&self) -> Alias {
        Alias::new(self.path.to_string())
    }

    fn type_tag(&self) -> u32 {
        TAG_SOURCE_FILE
    }

    async fn build(&mut self, ctx: &mut BuildContext) -> Result<()> {
        self.refresh(&ctx.services.ufs).await
    }

    async fn probe_dirty(&self, ufs: &Ufs, stamp: &Stamp) -> Result<bool> {
        ufs.invalidate(&self.path);
        match ufs.info(&self.path).await {
            Ok(meta) => Ok(meta.mtime != stamp.mtime),
            // Missing input: dirty so the build surfaces the real error.
            Err(_) => Ok(true),
        }
    }

    fn stamp_mtime(&self) -> Option<Timestamp> {
        Some(self.mtime)
    }
}

/// A reference to a file produced by an action.
///
/// Identical probing behavior to [`SourceFile`], but the node statically
/// depends on its producing action, which is how action outputs stitch
/// into downstream inputs.
#[derive(Clone, Default, Eq, PartialEq, Debug, Display)]
#[display("{path}")]
pub struct GeneratedFile {
    pub path: AbsPath,
    digest: Digest,
    mtime: Timestamp,
}

impl GeneratedFile {
    pub fn new(path: AbsPath) -> Self {
        Self {
            path,
            digest: Digest::ZERO,
            mtime: Timestamp::default(),
        }
    }
}

impl Archivable for GeneratedFile {
    fn archive(&mut self, ar: &mut dyn Archive) -> Result<()> {
        self.path.archive(ar)?;
        self.digest.archive(ar)?;
        self.mtime.archive(ar)
    }
}

#[async_trait]
impl Buildable for GeneratedFile {
    fn alias(&self) -> Alias {
        Alias::new(self.path.to_string())
    }

    fn type_tag(&self) -> u32 {
        TAG_GENERATED_FILE
    }

    async fn build(&mut self, ctx: &mut BuildContext) -> Result<()> {
        let ufs = &ctx.services.ufs;
        ufs.invalidate(&self.path);
        let meta = ufs
            .info(&self.path)
            .await
            .with_context(|| format!("stat output {}", self.path))?;
        if self.digest.is_zero() || meta.mtime != self.mtime {
            self.digest = ufs.digest(&self.path).await?;
        }
        self.mtime = meta.mtime;
        Ok(())
    }

    async fn probe_dirty(&self, ufs: &Ufs, stamp: &Stamp) -> Result<bool> {
        ufs.invalidate(&self.path);
        match ufs.info(&self.path).await {
            Ok(meta) => Ok(meta.mtime != stamp.mtime),
            Err(_) => Ok(true),
        }
    }

    fn stamp_mtime(&self) -> Option<Timestamp> {
        Some(self.mtime)
    }
}

/// Probe for the existence of a path.
#[derive(Clone, Default, Eq, PartialEq, Debug, Display)]
#[display("exists:{path}")]
pub struct FileExists {
    pub path: AbsPath,
    pub exists: bool,
}

impl FileExists {
    pub fn new(path: AbsPath) -> Self {
        Self {
            path,
            exists: false,
        }
    }
}

impl Archivable for FileExists {
    fn archive(&mut self, ar: &mut dyn Archive) -> Result<()> {
        self.path.archive(ar)?;
        ar.bool(&mut self.exists)
    }
}

#[async_trait]
impl Buildable for FileExists {
    fn alias(&self) -> Alias {
        Alias::new(format!("exists:{}", self.path))
    }

    fn type_tag(&self) -> u32 {
        TAG_FILE_EXISTS
    }

    async fn build(&mut self, ctx: &mut BuildContext) -> Result<()> {
        let ufs = &ctx.services.ufs;
        ufs.invalidate(&self.path);
        self.exists = ufs.exists(&self.path).await;
        Ok(())
    }

    async fn probe_dirty(&self, ufs: &Ufs, _stamp: &Stamp) -> Result<bool> {
        ufs.invalidate(&self.path);
        Ok(ufs.exists(&self.path).await != self.exists)
    }
}

/// A directory listing.
#[derive(Clone, Default, Eq, PartialEq, Debug, Display)]
#[display("dir:{path}")]
pub struct DirectoryList {
    pub path: AbsPath,
    pub entries: Vec<String>,
    mtime: Timestamp,
}

impl DirectoryList {
    pub fn new(path: AbsPath) -> Self {
        Self {
            path,
            entries: Vec::new(),
            mtime: Timestamp::default(),
        }
    }
}

impl Archivable for DirectoryList {
    fn archive(&mut self, ar: &mut dyn Archive) -> Result<()> {
        self.path.archive(ar)?;
        self.entries.archive(ar)?;
        self.mtime.archive(ar)
    }
}

#[async_trait]
impl Buildable for DirectoryList {
    fn alias(&self) -> Alias {
        Alias::new(format!("dir:{}", self.path))
    }

    fn type_tag(&self) -> u32 {
        TAG_DIRECTORY_LIST
    }

    async fn build(&mut self, ctx: &mut BuildContext) -> Result<()> {
        let ufs = &ctx.services.ufs;
        ufs.invalidate(&self.path);
        self.entries = ufs.list_dir(&self.path).await?;
        self.mtime = ufs.info(&self.path).await?.mtime;
        Ok(())
    }

    async fn probe_dirty(&self, ufs: &Ufs, stamp: &Stamp) -> Result<bool> {
        ufs.invalidate(&self.path);
        match ufs.info(&self.path).await {
            Ok(meta) => Ok(meta.mtime != stamp.mtime),
            Err(_) => Ok(true),
        }
    }

    fn stamp_mtime(&self) -> Option<Timestamp> {
        Some(self.mtime)
    }
}
