//! Path types tailored to `anvil`.
//!
//! The graph keys nodes by absolute path, the cache stores relative paths
//! inside bulks, and mixing the two up silently produces aliases that
//! differ across machines. Two wrappers keep the distinction in the type
//! system:
//!
//! - [`AbsPath`]: an absolute path; the only kind the fs façade accepts.
//! - [`RelPath`]: a path relative to some root (workspace, cache bulk).
//!
//! Paths are stored as-is, without normalization beyond rejecting the
//! wrong base kind at construction.

use std::path::{Path, PathBuf};

use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use derive_more::Display;
use mesh::{Archivable, Archive};
use serde::{Deserialize, Serialize};

/// An absolute path.
#[derive(
    Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Serialize, Deserialize,
)]
#[display("{}", self.0.display())]
#[serde(transparent)]
pub struct AbsPath(PathBuf);

impl AbsPath {
    /// Wrap a path, requiring it to be absolute.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.is_absolute() {
            bail!("path is not absolute: {path:?}");
        }
        Ok(Self(path))
    }

    /// The current working directory.
    pub fn current_dir() -> Result<Self> {
        std::env::current_dir()
            .context("read current directory")
            .and_then(Self::new)
    }

    /// Append a relative path.
    pub fn join(&self, rel: impl AsRef<Path>) -> Self {
        Self(self.0.join(rel.as_ref()))
    }

    /// The parent directory, if any.
    pub fn parent(&self) -> Option<AbsPath> {
        self.0.parent().map(|parent| Self(parent.to_path_buf()))
    }

    /// The final path component.
    pub fn file_name(&self) -> Option<&str> {
        self.0.file_name().and_then(|name| name.to_str())
    }

    /// Express this path relative to a base.
    pub fn relative_to(&self, base: &AbsPath) -> Result<RelPath> {
        self.0
            .strip_prefix(&base.0)
            .with_context(|| format!("{self} is not under {base}"))
            .map(|rel| RelPath(rel.to_path_buf()))
    }

    /// Whether `base` is a prefix of this path.
    pub fn starts_with(&self, base: &AbsPath) -> bool {
        self.0.starts_with(&base.0)
    }

    pub fn as_std_path(&self) -> &Path {
        &self.0
    }

    pub fn into_std_path(self) -> PathBuf {
        self.0
    }
}

impl TryFrom<&Path> for AbsPath {
    type Error = color_eyre::Report;

    fn try_from(path: &Path) -> Result<Self> {
        Self::new(path.to_path_buf())
    }
}

impl TryFrom<PathBuf> for AbsPath {
    type Error = color_eyre::Report;

    fn try_from(path: PathBuf) -> Result<Self> {
        Self::new(path)
    }
}

impl TryFrom<&str> for AbsPath {
    type Error = color_eyre::Report;

    fn try_from(path: &str) -> Result<Self> {
        Self::new(PathBuf::from(path))
    }
}

impl AsRef<Path> for AbsPath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

impl Archivable for AbsPath {
    fn archive(&mut self, ar: &mut dyn Archive) -> Result<()> {
        self.0.archive(ar)
    }
}

/// A path relative to some root.
#[derive(
    Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Serialize, Deserialize,
)]
#[display("{}", self.0.display())]
#[serde(transparent)]
pub struct RelPath(PathBuf);

impl RelPath {
    /// Wrap a path, requiring it to be relative.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if path.is_absolute() {
            bail!("path is not relative: {path:?}");
        }
        Ok(Self(path))
    }

    pub fn as_std_path(&self) -> &Path {
        &self.0
    }
}

impl TryFrom<&str> for RelPath {
    type Error = color_eyre::Report;

    fn try_from(path: &str) -> Result<Self> {
        Self::new(PathBuf::from(path))
    }
}

impl AsRef<Path> for RelPath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

impl Archivable for RelPath {
    fn archive(&mut self, ar: &mut dyn Archive) -> Result<()> {
        self.0.archive(ar)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn abs_rejects_relative() {
        assert!(AbsPath::try_from("src/main.c").is_err());
        assert!(AbsPath::try_from("/src/main.c").is_ok());
    }

    #[test]
    fn rel_rejects_absolute() {
        assert!(RelPath::try_from("/src/main.c").is_err());
        assert!(RelPath::try_from("src/main.c").is_ok());
    }

    #[test]
    fn relative_to_round_trips_join() -> Result<()> {
        let base = AbsPath::try_from("/work")?;
        let file = base.join("src/main.c");
        let rel = file.relative_to(&base)?;
        assert_eq!(base.join(&rel), file);
        Ok(())
    }

    #[test]
    fn relative_to_outside_base_is_error() -> Result<()> {
        let base = AbsPath::try_from("/work")?;
        let other = AbsPath::try_from("/elsewhere/main.c")?;
        assert!(other.relative_to(&base).is_err());
        Ok(())
    }
}
