//! Streaming writes.

use rpmstore_common::{Result, StorageHandle, StorageKey};

use crate::provider::BlobSink;

/// A blob being written in pieces.
///
/// Created by [`Storage::writer`](crate::Storage::writer). Call
/// [`write`](Self::write) any number of times, then [`commit`](Self::commit)
/// to publish the blob and obtain its handle. A writer dropped before
/// commit leaves nothing behind under its key.
pub struct StorageWriter {
    key: StorageKey,
    sink: Box<dyn BlobSink>,
    written: u64,
}

impl StorageWriter {
    pub(crate) fn new(key: StorageKey, sink: Box<dyn BlobSink>) -> Self {
        Self {
            key,
            sink,
            written: 0,
        }
    }

    /// Key the blob will be published under.
    pub fn key(&self) -> &StorageKey {
        &self.key
    }

    /// Number of bytes written so far.
    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Append data to the blob.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.sink.write(data).await?;
        self.written += data.len() as u64;
        Ok(())
    }

    /// Publish the blob and return its handle.
    ///
    /// Consumes the writer, so a blob can be committed at most once.
    pub async fn commit(self) -> Result<StorageHandle> {
        tracing::debug!("Committing {} bytes to {}", self.written, self.key);
        self.sink.commit().await?;
        Ok(StorageHandle::from(self.key))
    }
}

impl std::fmt::Debug for StorageWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageWriter")
            .field("key", &self.key)
            .field("written", &self.written)
            .finish()
    }
}
