//! Local filesystem storage backend.
//!
//! Each key maps to a file below the configured base directory, using the
//! key's `/`-separated components as the relative path. Writes go to a
//! uniquely named file in `<base_dir>/.tmp/`, are fsynced and made
//! read-only, then renamed into place, so readers never observe a partial
//! blob. Concurrent writers to the same key are last-writer-wins; there is
//! no cross-process locking.

use async_trait::async_trait;
use futures::{stream, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use crate::provider::{BlobSink, ByteStream, HandleStream, Storage};
use rpmstore_common::{Error, Result, StorageHandle, StorageKey, TEMP_DIR_NAME};

const MAX_RENAME_ATTEMPTS: usize = 16;

/// Options accepted by the `filesystem` registry entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilesystemConfig {
    /// Directory holding all blobs. Created if missing.
    pub base_dir: PathBuf,
}

/// Filesystem storage backend.
///
/// Great for committing RPMs to a local checkout at first; once there are
/// too many, register a backend for a distributed blob store and migrate.
pub struct FilesystemStorage {
    root: PathBuf,
}

impl FilesystemStorage {
    /// Create a backend rooted at `base_dir`.
    ///
    /// # Postconditions
    /// - `base_dir` and its temp directory exist
    ///
    /// # Errors
    /// - Permission denied or other I/O errors creating the directories
    pub fn new(base_dir: impl AsRef<Path>) -> Result<Self> {
        let root = base_dir.as_ref().to_path_buf();

        // Sync on purpose: constructors run outside any runtime.
        std::fs::create_dir_all(root.join(TEMP_DIR_NAME))?;

        Ok(Self { root })
    }

    /// Build from registry config: `{"base_dir": "<path>"}`.
    pub fn from_config(config: Value) -> Result<Self> {
        let config: FilesystemConfig = serde_json::from_value(config)
            .map_err(|e| Error::InvalidConfig(format!("filesystem backend: {}", e)))?;
        Self::new(config.base_dir)
    }

    /// Root directory of this backend.
    pub fn base_dir(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, key: &StorageKey) -> PathBuf {
        let mut path = self.root.clone();
        for component in key.components() {
            path.push(component);
        }
        path
    }

    fn temp_path(&self) -> PathBuf {
        self.root
            .join(TEMP_DIR_NAME)
            .join(Uuid::new_v4().simple().to_string())
    }

    /// Path of an existing regular file for `handle`, or `NotFound`.
    async fn existing_blob(&self, handle: &StorageHandle) -> Result<PathBuf> {
        let path = self.blob_path(handle.key());
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(path),
            Ok(_) => Err(not_found(handle)),
            Err(e) if is_missing(&e) => Err(not_found(handle)),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_empty_parents(&self, key: &StorageKey) {
        for ancestor in key.ancestors() {
            if fs::remove_dir(self.root.join(ancestor)).await.is_err() {
                break;
            }
        }
    }
}

fn not_found(handle: &StorageHandle) -> Error {
    Error::NotFound(format!("Blob not found: {}", handle))
}

fn is_missing(err: &std::io::Error) -> bool {
    // A file where a directory was expected also means the blob is absent.
    matches!(err.kind(), ErrorKind::NotFound | ErrorKind::NotADirectory)
}

/// Reject keys that would shadow, or be shadowed by, an existing blob.
async fn check_conflicts(root: &Path, key: &StorageKey) -> Result<()> {
    for ancestor in key.ancestors() {
        match fs::metadata(root.join(ancestor)).await {
            Ok(meta) if meta.is_file() => {
                return Err(Error::InvalidKey(format!(
                    "{} is stored below existing blob {}",
                    key, ancestor
                )));
            }
            // Nearest existing directory found; everything above is fine.
            Ok(_) => break,
            Err(e) if is_missing(&e) => continue,
            Err(e) => return Err(e.into()),
        }
    }

    let path = root.join(key.as_str());
    match fs::metadata(&path).await {
        Ok(meta) if meta.is_dir() => {
            if remove_if_blobless(&path).await? {
                Ok(())
            } else {
                Err(Error::InvalidKey(format!(
                    "{} is a directory of existing blobs",
                    key
                )))
            }
        }
        Ok(_) => Ok(()),
        Err(e) if is_missing(&e) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Remove `dir` and its subdirectories if none of them hold a file.
///
/// Only empty directories are ever removed, so a file written concurrently
/// makes this return `false` rather than lose data.
async fn remove_if_blobless(dir: &Path) -> Result<bool> {
    let mut pending = vec![dir.to_path_buf()];
    let mut found = Vec::new();
    while let Some(current) = pending.pop() {
        let mut entries = match fs::read_dir(&current).await {
            Ok(entries) => entries,
            Err(e) if is_missing(&e) => continue,
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                return Ok(false);
            }
            pending.push(entry.path());
        }
        found.push(current);
    }

    // Parents were found before their children.
    for path in found.iter().rev() {
        match fs::remove_dir(path).await {
            Ok(()) => {}
            Err(e) if is_missing(&e) => {}
            Err(_) => return Ok(false),
        }
    }
    Ok(true)
}

/// Temp file that is renamed over the final path on commit.
struct FilesystemSink {
    root: PathBuf,
    key: StorageKey,
    final_path: PathBuf,
    temp_path: PathBuf,
    file: Option<fs::File>,
}

impl FilesystemSink {
    /// Rename the temp file over the final path.
    ///
    /// A concurrent delete of a sibling may prune the parent directory
    /// between creating it and the rename, so both steps are retried.
    async fn move_into_place(&self) -> Result<()> {
        let mut attempt = 1;
        loop {
            let result = match self.final_path.parent() {
                Some(parent) => fs::create_dir_all(parent).await,
                None => Ok(()),
            };
            let result = match result {
                Ok(()) => fs::rename(&self.temp_path, &self.final_path).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound && attempt < MAX_RENAME_ATTEMPTS => {
                    tracing::debug!("filesystem: parent of {} vanished, retrying", self.key);
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[async_trait]
impl BlobSink for FilesystemSink {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| Error::Storage("write after commit".to_string()))?;
        file.write_all(data).await?;
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        let mut file = self
            .file
            .take()
            .ok_or_else(|| Error::Storage("blob already committed".to_string()))?;
        file.flush().await?;
        file.sync_all().await?;

        let mut perms = file.metadata().await?.permissions();
        perms.set_readonly(true);
        file.set_permissions(perms).await?;
        drop(file);

        check_conflicts(&self.root, &self.key).await?;
        self.move_into_place().await?;

        // Renamed away, nothing for Drop to clean up.
        self.temp_path = PathBuf::new();
        Ok(())
    }
}

impl Drop for FilesystemSink {
    fn drop(&mut self) {
        if self.temp_path.as_os_str().is_empty() {
            return;
        }
        // Uncommitted or failed write.
        self.file.take();
        if let Err(e) = std::fs::remove_file(&self.temp_path) {
            if e.kind() != ErrorKind::NotFound {
                tracing::warn!(
                    "Failed to remove temp file {}: {}",
                    self.temp_path.display(),
                    e
                );
            }
        }
    }
}

/// Depth-first, name-sorted directory walk driving `list`.
struct Walk {
    root: PathBuf,
    prefix: String,
    stack: Vec<Node>,
}

enum Node {
    /// Relative directory path; empty for the root.
    Dir(String),
    /// Key of a regular file.
    File(String),
}

impl Walk {
    /// Whether any key below `dir` can start with the prefix.
    fn may_match(&self, dir: &str) -> bool {
        let dir = format!("{}/", dir);
        dir.starts_with(&self.prefix) || self.prefix.starts_with(&dir)
    }

    async fn expand(&mut self, rel: &str) -> Result<()> {
        let dir = if rel.is_empty() {
            self.root.clone()
        } else {
            self.root.join(rel)
        };

        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            // Pruned by a concurrent delete.
            Err(e) if is_missing(&e) => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let mut children = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Ok(name) = entry.file_name().into_string() else {
                tracing::warn!("Skipping non UTF-8 entry in {}", dir.display());
                continue;
            };
            if rel.is_empty() && name == TEMP_DIR_NAME {
                continue;
            }
            let child = if rel.is_empty() {
                name
            } else {
                format!("{}/{}", rel, name)
            };
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                if self.may_match(&child) {
                    children.push(Node::Dir(child));
                }
            } else if file_type.is_file() {
                children.push(Node::File(child));
            }
        }

        children.sort_by(|a, b| node_name(b).cmp(node_name(a)));
        self.stack.extend(children);
        Ok(())
    }
}

fn node_name(node: &Node) -> &str {
    match node {
        Node::Dir(name) | Node::File(name) => name,
    }
}

#[async_trait]
impl Storage for FilesystemStorage {
    fn name(&self) -> &str {
        "filesystem"
    }

    async fn put(&self, key: &StorageKey, data: Vec<u8>) -> Result<StorageHandle> {
        tracing::debug!("filesystem: put {} ({} bytes)", key, data.len());
        let mut writer = self.writer(key).await?;
        writer.write(&data).await?;
        writer.commit().await
    }

    async fn get(&self, handle: &StorageHandle) -> Result<Vec<u8>> {
        let path = self.existing_blob(handle).await?;
        match fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if is_missing(&e) => Err(not_found(handle)),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_stream(&self, handle: &StorageHandle) -> Result<ByteStream> {
        let path = self.existing_blob(handle).await?;
        let file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if is_missing(&e) => return Err(not_found(handle)),
            Err(e) => return Err(e.into()),
        };
        let stream = ReaderStream::new(file).map(|chunk| chunk.map_err(Error::from));
        Ok(Box::pin(stream))
    }

    async fn exists(&self, handle: &StorageHandle) -> Result<bool> {
        match self.existing_blob(handle).await {
            Ok(_) => Ok(true),
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn delete(&self, handle: &StorageHandle) -> Result<()> {
        tracing::debug!("filesystem: delete {}", handle);
        let path = self.existing_blob(handle).await?;
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if is_missing(&e) => return Err(not_found(handle)),
            Err(e) => return Err(e.into()),
        }
        self.remove_empty_parents(handle.key()).await;
        Ok(())
    }

    fn list(&self, prefix: &str) -> HandleStream {
        let walk = Walk {
            root: self.root.clone(),
            prefix: prefix.to_string(),
            stack: vec![Node::Dir(String::new())],
        };

        Box::pin(stream::unfold(walk, |mut walk| async move {
            loop {
                match walk.stack.pop()? {
                    Node::File(key) => {
                        if key.starts_with(&walk.prefix) {
                            let item = StorageHandle::parse(&key);
                            return Some((item, walk));
                        }
                    }
                    Node::Dir(rel) => {
                        if let Err(e) = walk.expand(&rel).await {
                            return Some((Err(e), walk));
                        }
                    }
                }
            }
        }))
    }

    async fn open_sink(&self, key: &StorageKey) -> Result<Box<dyn BlobSink>> {
        check_conflicts(&self.root, key).await?;

        let temp_path = self.temp_path();
        let file = match fs::File::create(&temp_path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                // Temp directory removed from under us.
                fs::create_dir_all(self.root.join(TEMP_DIR_NAME)).await?;
                fs::File::create(&temp_path).await?
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Box::new(FilesystemSink {
            root: self.root.clone(),
            key: key.clone(),
            final_path: self.blob_path(key),
            temp_path,
            file: Some(file),
        }))
    }
}
