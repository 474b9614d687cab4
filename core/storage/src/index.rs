//! Versionable index from repo file paths to storage handles.
//!
//! Blobs live in storage; only this small index is committed. It
//! serializes as sorted, pretty-printed JSON so diffs stay readable.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::provider::Storage;
use rpmstore_common::{Result, StorageHandle};

/// Map of repo file path to the handle of its blob.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StorageIndex {
    entries: BTreeMap<String, StorageHandle>,
}

impl StorageIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `handle` for `path`, returning the previous handle.
    pub fn insert(&mut self, path: impl Into<String>, handle: StorageHandle) -> Option<StorageHandle> {
        self.entries.insert(path.into(), handle)
    }

    pub fn get(&self, path: &str) -> Option<&StorageHandle> {
        self.entries.get(path)
    }

    pub fn remove(&mut self, path: &str) -> Option<StorageHandle> {
        self.entries.remove(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in path order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &StorageHandle)> {
        self.entries.iter().map(|(p, h)| (p.as_str(), h))
    }

    /// Serialize as sorted JSON with a trailing newline.
    pub fn to_json(&self) -> Result<String> {
        let mut json = serde_json::to_string_pretty(self)?;
        json.push('\n');
        Ok(json)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Paths whose blob is no longer present in `storage`.
    pub async fn missing(&self, storage: &dyn Storage) -> Result<Vec<String>> {
        let mut missing = Vec::new();
        for (path, handle) in &self.entries {
            if !storage.exists(handle).await? {
                missing.push(path.clone());
            }
        }
        Ok(missing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStorage;
    use rpmstore_common::{Error, StorageKey};

    fn handle(s: &str) -> StorageHandle {
        StorageHandle::parse(s).unwrap()
    }

    #[test]
    fn test_json_is_sorted() {
        let mut index = StorageIndex::new();
        index.insert("zsh-5.8.rpm", handle("aaa/bbb/ccc/1"));
        index.insert("bash-5.1.rpm", handle("ddd/eee/fff/2"));

        let json = index.to_json().unwrap();
        assert_eq!(
            json,
            "{\n  \"bash-5.1.rpm\": \"ddd/eee/fff/2\",\n  \"zsh-5.8.rpm\": \"aaa/bbb/ccc/1\"\n}\n"
        );
        assert_eq!(StorageIndex::from_json(&json).unwrap(), index);
    }

    #[test]
    fn test_from_json_rejects_bad_handles() {
        let result = StorageIndex::from_json(r#"{"x.rpm": "../escape"}"#);
        assert!(matches!(result, Err(Error::Serialization(_))));
    }

    #[test]
    fn test_insert_replaces() {
        let mut index = StorageIndex::new();
        assert!(index.insert("a.rpm", handle("1")).is_none());
        assert_eq!(index.insert("a.rpm", handle("2")), Some(handle("1")));
        assert_eq!(index.get("a.rpm"), Some(&handle("2")));
        assert_eq!(index.len(), 1);
        assert_eq!(index.remove("a.rpm"), Some(handle("2")));
        assert!(index.is_empty());
    }

    #[tokio::test]
    async fn test_missing() {
        let storage = MemoryStorage::new();
        let present = storage
            .put(&StorageKey::generate(), b"rpm".to_vec())
            .await
            .unwrap();

        let mut index = StorageIndex::new();
        index.insert("present.rpm", present);
        index.insert("gone.rpm", handle("no/such/blob"));

        assert_eq!(index.missing(&storage).await.unwrap(), vec!["gone.rpm"]);
        assert_eq!(index.iter().count(), 2);
    }
}
