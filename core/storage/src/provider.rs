//! Storage trait definition.

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;

use crate::writer::StorageWriter;
use rpmstore_common::{Error, Result, StorageHandle, StorageKey};

/// Byte stream type for chunked reads.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Lazy stream of handles produced by [`Storage::list`].
pub type HandleStream = Pin<Box<dyn Stream<Item = Result<StorageHandle>> + Send>>;

/// Destination of a streaming write, provided by each backend.
///
/// Nothing written to a sink may become visible under its key before
/// [`BlobSink::commit`] returns successfully. Dropping a sink without
/// committing discards the data.
#[async_trait]
pub trait BlobSink: Send {
    /// Append data to the pending blob.
    async fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Publish the pending blob under its key.
    async fn commit(self: Box<Self>) -> Result<()>;
}

/// Storage backend trait.
///
/// A backend maps validated keys to opaque blobs. Writes are
/// last-writer-wins; a key may not be both a blob and a directory-like
/// ancestor of another blob (`a` and `a/b` cannot coexist).
#[async_trait]
pub trait Storage: Send + Sync {
    /// Get the backend name (e.g., "filesystem", "memory").
    fn name(&self) -> &str;

    /// Store `data` under `key`, replacing any previous blob.
    ///
    /// # Postconditions
    /// - `get` on the returned handle yields exactly `data`
    ///
    /// # Errors
    /// - `InvalidKey` if the key conflicts with an existing blob
    /// - I/O errors
    async fn put(&self, key: &StorageKey, data: Vec<u8>) -> Result<StorageHandle>;

    /// Read a whole blob.
    ///
    /// # Errors
    /// - `NotFound` if the handle does not refer to a blob
    async fn get(&self, handle: &StorageHandle) -> Result<Vec<u8>>;

    /// Read a blob as a stream of chunks.
    async fn get_stream(&self, handle: &StorageHandle) -> Result<ByteStream>;

    /// Check if a blob exists.
    async fn exists(&self, handle: &StorageHandle) -> Result<bool>;

    /// Delete a blob.
    ///
    /// # Errors
    /// - `NotFound` if the blob does not exist, including when it was
    ///   already deleted
    async fn delete(&self, handle: &StorageHandle) -> Result<()>;

    /// List handles whose key starts with `prefix`.
    ///
    /// The stream is lazy and finite; calling `list` again starts over.
    /// `prefix` is matched as a plain string, so `"a"` matches both
    /// `a/x` and `ab`.
    fn list(&self, prefix: &str) -> HandleStream;

    /// Open a sink for a streaming write to `key`.
    async fn open_sink(&self, key: &StorageKey) -> Result<Box<dyn BlobSink>>;

    /// Start a streaming write to `key`.
    async fn writer(&self, key: &StorageKey) -> Result<StorageWriter> {
        let sink = self.open_sink(key).await?;
        Ok(StorageWriter::new(key.clone(), sink))
    }

    /// Delete a blob, returning whether it existed.
    async fn delete_if_exists(&self, handle: &StorageHandle) -> Result<bool> {
        match self.delete(handle).await {
            Ok(()) => Ok(true),
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
