//! Pluggable blob storage for RPM artifacts.
//!
//! RPMs are large binary files that most version control systems handle
//! poorly. This crate stores them in a pluggable backend and hands back a
//! [`StorageHandle`] for each blob; only a small [`StorageIndex`] of
//! "repo file -> handle" needs to be versioned.
//!
//! This crate is the single import surface: backends are selected through
//! the [`StorageRegistry`] by name and configuration, and used through the
//! [`Storage`] trait.
//!
//! ```no_run
//! # async fn demo() -> rpmstore_storage::Result<()> {
//! use rpmstore_storage::{default_registry, Storage, StorageKey};
//!
//! let storage = default_registry()
//!     .from_json(r#"{"name": "filesystem", "base_dir": "/var/rpms"}"#)?;
//! let handle = storage.put(&StorageKey::parse("a/b.rpm")?, b"...".to_vec()).await?;
//! assert_eq!(storage.get(&handle).await?, b"...");
//! # Ok(())
//! # }
//! ```

mod batch;
mod filesystem;
mod index;
mod memory;
mod provider;
mod registry;
mod writer;

#[cfg(test)]
mod conformance;

pub use batch::put_all;
pub use filesystem::{FilesystemConfig, FilesystemStorage};
pub use index::StorageIndex;
pub use memory::MemoryStorage;
pub use provider::{BlobSink, ByteStream, HandleStream, Storage};
pub use registry::{default_registry, storage_factory, StorageConfig, StorageFactory, StorageRegistry};
pub use writer::StorageWriter;

pub use rpmstore_common::{Error, Result, StorageHandle, StorageKey};

/// Open the default filesystem backend rooted at `base_dir`.
pub fn open_filesystem(base_dir: impl AsRef<std::path::Path>) -> Result<std::sync::Arc<dyn Storage>> {
    Ok(std::sync::Arc::new(FilesystemStorage::new(base_dir)?))
}
