//! All-or-nothing multi-blob writes.

use rpmstore_common::{Result, StorageHandle, StorageKey};

use crate::provider::Storage;

/// Store several blobs, removing the ones already written if any fails.
///
/// Not transactional: other readers may briefly see the early blobs, and
/// a rolled-back key that previously held data ends up absent rather than
/// restored. Cleanup failures are logged and the original error returned.
pub async fn put_all<I>(storage: &dyn Storage, items: I) -> Result<Vec<StorageHandle>>
where
    I: IntoIterator<Item = (StorageKey, Vec<u8>)>,
{
    let mut written = Vec::new();

    for (key, data) in items {
        match storage.put(&key, data).await {
            Ok(handle) => written.push(handle),
            Err(e) => {
                tracing::debug!(
                    "put_all: {} failed ({}), rolling back {} blobs",
                    key,
                    e,
                    written.len()
                );
                for handle in &written {
                    if let Err(cleanup) = storage.delete_if_exists(handle).await {
                        tracing::warn!("Failed to roll back {}: {}", handle, cleanup);
                    }
                }
                return Err(e);
            }
        }
    }

    Ok(written)
}
