//! The keyed config store.
//!
//! A map of `object → {key → string-value}` with parent-chain inheritance,
//! persisted as JSON. All configuration flows through this store or
//! explicit CLI flags; the core reads no environment variables.

use std::collections::BTreeMap;

use color_eyre::{Result, eyre::Context};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::{fs::Ufs, path::AbsPath};

/// Settings for one named object.
#[derive(Clone, Default, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct ConfigObject {
    /// Object this one inherits unset keys from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default)]
    pub values: BTreeMap<String, String>,
}

/// The whole store.
#[derive(Clone, Default, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct ConfigStore {
    #[serde(default)]
    objects: BTreeMap<String, ConfigObject>,
}

impl ConfigStore {
    /// Load from disk; a missing file is an empty store.
    #[instrument(skip(ufs))]
    pub async fn load(ufs: &Ufs, path: &AbsPath) -> Result<Self> {
        ufs.invalidate(path);
        if !ufs.exists(path).await {
            return Ok(Self::default());
        }
        let bytes = ufs.read(path).await?;
        serde_json::from_slice(&bytes).with_context(|| format!("parse config store {path}"))
    }

    /// Persist to disk atomically.
    #[instrument(skip(self, ufs))]
    pub async fn save(&self, ufs: &Ufs, path: &AbsPath) -> Result<()> {
        let json = serde_json::to_vec_pretty(self).context("serialize config store")?;
        ufs.safe_create(path, &json).await
    }

    /// Read a key, walking the parent chain until a value is found.
    pub fn get(&self, object: &str, key: &str) -> Option<&str> {
        let mut cursor = Some(object);
        // A malformed store could chain parents in a loop; bound the walk.
        for _ in 0..self.objects.len().max(1) {
            let name = cursor?;
            let entry = self.objects.get(name)?;
            if let Some(value) = entry.values.get(key) {
                return Some(value.as_str());
            }
            cursor = entry.parent.as_deref();
        }
        None
    }

    /// Set a key on an object, creating the object if needed.
    pub fn set(
        &mut self,
        object: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) {
        self.objects
            .entry(object.into())
            .or_default()
            .values
            .insert(key.into(), value.into());
    }

    /// Declare an object's parent.
    pub fn set_parent(&mut self, object: impl Into<String>, parent: impl Into<String>) {
        self.objects.entry(object.into()).or_default().parent = Some(parent.into());
    }

    pub fn objects(&self) -> impl Iterator<Item = (&String, &ConfigObject)> {
        self.objects.iter()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn inheritance_walks_the_parent_chain() {
        let mut store = ConfigStore::default();
        store.set("defaults", "cache", "on");
        store.set("defaults", "jobs", "8");
        store.set_parent("linux", "defaults");
        store.set("linux", "jobs", "16");

        assert_eq!(store.get("linux", "jobs"), Some("16"));
        assert_eq!(store.get("linux", "cache"), Some("on"));
        assert_eq!(store.get("linux", "unknown"), None);
        assert_eq!(store.get("unknown-object", "jobs"), None);
    }

    #[test]
    fn parent_loops_terminate() {
        let mut store = ConfigStore::default();
        store.set_parent("a", "b");
        store.set_parent("b", "a");
        assert_eq!(store.get("a", "missing"), None);
    }

    #[test_log::test(tokio::test)]
    async fn save_load_round_trip() -> Result<()> {
        let dir = tempfile::TempDir::new().expect("create temp dir");
        let root = AbsPath::try_from(dir.path())?;
        let ufs = Ufs::new();

        let mut store = ConfigStore::default();
        store.set("defaults", "mode", "proportional");
        let path = root.join("config.json");
        store.save(&ufs, &path).await?;

        let loaded = ConfigStore::load(&ufs, &path).await?;
        assert_eq!(store, loaded);
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn missing_store_is_empty() -> Result<()> {
        let dir = tempfile::TempDir::new().expect("create temp dir");
        let root = AbsPath::try_from(dir.path())?;
        let ufs = Ufs::new();
        let store = ConfigStore::load(&ufs, &root.join("absent.json")).await?;
        assert_eq!(store, ConfigStore::default());
        Ok(())
    }
}
