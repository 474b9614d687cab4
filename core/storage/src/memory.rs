//! In-memory storage backend for testing.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use serde_json::Value;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::provider::{BlobSink, ByteStream, HandleStream, Storage};
use rpmstore_common::{Error, Result, StorageHandle, StorageKey};

type Blobs = Arc<RwLock<BTreeMap<String, Vec<u8>>>>;

/// In-memory storage backend.
///
/// Useful for testing and dry runs. All data is stored in memory
/// and lost on drop.
pub struct MemoryStorage {
    blobs: Blobs,
}

impl MemoryStorage {
    /// Create a new empty memory backend.
    pub fn new() -> Self {
        Self {
            blobs: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    /// Build from registry config. The memory backend takes no options.
    pub fn from_config(config: Value) -> Result<Self> {
        match config {
            Value::Null => Ok(Self::new()),
            Value::Object(map) if map.is_empty() => Ok(Self::new()),
            Value::Object(map) => Err(Error::InvalidConfig(format!(
                "memory backend takes no options, got: {}",
                map.keys().cloned().collect::<Vec<_>>().join(", ")
            ))),
            other => Err(Error::InvalidConfig(format!(
                "memory backend expects an object, got: {}",
                other
            ))),
        }
    }

    /// Number of blobs currently stored.
    ///
    /// # Errors
    /// - `Storage` if the lock was poisoned by a panicking writer
    pub fn len(&self) -> Result<usize> {
        Ok(read(&self.blobs)?.len())
    }

    /// Check if no blobs are stored.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(read(&self.blobs)?.is_empty())
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

fn read(blobs: &Blobs) -> Result<RwLockReadGuard<'_, BTreeMap<String, Vec<u8>>>> {
    blobs
        .read()
        .map_err(|_| Error::Storage("memory backend lock poisoned".to_string()))
}

fn write(blobs: &Blobs) -> Result<RwLockWriteGuard<'_, BTreeMap<String, Vec<u8>>>> {
    blobs
        .write()
        .map_err(|_| Error::Storage("memory backend lock poisoned".to_string()))
}

fn not_found(handle: &StorageHandle) -> Error {
    Error::NotFound(format!("Blob not found: {}", handle))
}

/// Insert under `key`, enforcing the blob/ancestor exclusion.
fn insert(blobs: &Blobs, key: &StorageKey, data: Vec<u8>) -> Result<()> {
    let mut blobs = write(blobs)?;

    if let Some(ancestor) = key.ancestors().find(|a| blobs.contains_key(*a)) {
        return Err(Error::InvalidKey(format!(
            "{} is stored below existing blob {}",
            key, ancestor
        )));
    }

    let dir_prefix = format!("{}/", key);
    let has_descendant = blobs
        .range::<str, _>((Bound::Included(dir_prefix.as_str()), Bound::Unbounded))
        .next()
        .is_some_and(|(k, _)| k.starts_with(&dir_prefix));
    if has_descendant {
        return Err(Error::InvalidKey(format!(
            "{} is a directory of existing blobs",
            key
        )));
    }

    blobs.insert(key.as_str().to_string(), data);
    Ok(())
}

/// Smallest key after `cursor` that starts with `prefix`.
fn next_key(blobs: &Blobs, prefix: &str, cursor: Option<&str>) -> Result<Option<String>> {
    let blobs = read(blobs)?;
    let lower = match cursor {
        Some(last) => Bound::Excluded(last),
        None => Bound::Included(prefix),
    };
    Ok(blobs
        .range::<str, _>((lower, Bound::Unbounded))
        .next()
        .map(|(k, _)| k.clone())
        .filter(|k| k.starts_with(prefix)))
}

/// Buffers a streaming write until commit.
struct MemorySink {
    blobs: Blobs,
    key: StorageKey,
    buf: Vec<u8>,
}

#[async_trait]
impl BlobSink for MemorySink {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(data);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemorySink { blobs, key, buf } = *self;
        insert(&blobs, &key, buf)
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    fn name(&self) -> &str {
        "memory"
    }

    async fn put(&self, key: &StorageKey, data: Vec<u8>) -> Result<StorageHandle> {
        tracing::debug!("memory: put {} ({} bytes)", key, data.len());
        insert(&self.blobs, key, data)?;
        Ok(StorageHandle::from(key.clone()))
    }

    async fn get(&self, handle: &StorageHandle) -> Result<Vec<u8>> {
        read(&self.blobs)?
            .get(handle.as_str())
            .cloned()
            .ok_or_else(|| not_found(handle))
    }

    async fn get_stream(&self, handle: &StorageHandle) -> Result<ByteStream> {
        let data = self.get(handle).await?;
        let stream = stream::once(async move { Ok(Bytes::from(data)) });
        Ok(Box::pin(stream))
    }

    async fn exists(&self, handle: &StorageHandle) -> Result<bool> {
        Ok(read(&self.blobs)?.contains_key(handle.as_str()))
    }

    async fn delete(&self, handle: &StorageHandle) -> Result<()> {
        tracing::debug!("memory: delete {}", handle);
        write(&self.blobs)?
            .remove(handle.as_str())
            .map(|_| ())
            .ok_or_else(|| not_found(handle))
    }

    fn list(&self, prefix: &str) -> HandleStream {
        let blobs = Arc::clone(&self.blobs);
        let prefix = prefix.to_string();

        // Each step resumes the range scan after the last key returned, so
        // blobs inserted or removed mid-listing are tolerated.
        let state = (blobs, prefix, None::<String>, false);
        Box::pin(stream::unfold(
            state,
            |(blobs, prefix, cursor, done)| async move {
                if done {
                    return None;
                }
                match next_key(&blobs, &prefix, cursor.as_deref()) {
                    Ok(Some(key)) => {
                        let item = StorageHandle::parse(&key);
                        Some((item, (blobs, prefix, Some(key), false)))
                    }
                    Ok(None) => None,
                    Err(e) => Some((Err(e), (blobs, prefix, cursor, true))),
                }
            },
        ))
    }

    async fn open_sink(&self, key: &StorageKey) -> Result<Box<dyn BlobSink>> {
        Ok(Box::new(MemorySink {
            blobs: Arc::clone(&self.blobs),
            key: key.clone(),
            buf: Vec::new(),
        }))
    }
}
