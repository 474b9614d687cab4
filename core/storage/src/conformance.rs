//! Behavior every [`Storage`] backend must share.
//!
//! Backend test modules call [`run_all`] on a fresh, empty instance.

use futures::{StreamExt, TryStreamExt};
use std::collections::BTreeSet;

use crate::provider::Storage;
use rpmstore_common::{Error, StorageHandle, StorageKey};

fn key(s: &str) -> StorageKey {
    StorageKey::parse(s).unwrap()
}

async fn listed(storage: &dyn Storage, prefix: &str) -> BTreeSet<String> {
    storage
        .list(prefix)
        .map_ok(|h| h.to_string())
        .try_collect()
        .await
        .unwrap()
}

pub async fn run_all(storage: &dyn Storage) {
    check_round_trip(storage).await;
    check_delete(storage).await;
    check_list_prefix(storage).await;
    check_key_conflicts(storage).await;
    check_writer(storage).await;
    check_get_stream(storage).await;
}

pub async fn check_round_trip(storage: &dyn Storage) {
    let handle = storage.put(&key("a/b.txt"), b"hello".to_vec()).await.unwrap();
    assert_eq!(handle.as_str(), "a/b.txt");
    assert_eq!(storage.get(&handle).await.unwrap(), b"hello");
    assert!(storage.exists(&handle).await.unwrap());
    assert_eq!(listed(storage, "a/").await.len(), 1);

    // Handles survive a trip through their string form.
    let reparsed = StorageHandle::parse(&handle.to_string()).unwrap();
    assert_eq!(storage.get(&reparsed).await.unwrap(), b"hello");

    let empty = storage.put(&key("empty"), Vec::new()).await.unwrap();
    assert!(storage.get(&empty).await.unwrap().is_empty());

    // Last writer wins.
    storage.put(&key("a/b.txt"), b"bye".to_vec()).await.unwrap();
    assert_eq!(storage.get(&handle).await.unwrap(), b"bye");

    storage.delete(&handle).await.unwrap();
    storage.delete(&empty).await.unwrap();
}

pub async fn check_delete(storage: &dyn Storage) {
    let handle = storage.put(&key("gone"), vec![1, 2, 3]).await.unwrap();
    storage.delete(&handle).await.unwrap();

    assert!(matches!(storage.get(&handle).await, Err(Error::NotFound(_))));
    assert!(matches!(storage.get_stream(&handle).await, Err(Error::NotFound(_))));
    assert!(!storage.exists(&handle).await.unwrap());
    assert!(matches!(storage.delete(&handle).await, Err(Error::NotFound(_))));
    assert!(!storage.delete_if_exists(&handle).await.unwrap());

    let handle = storage.put(&key("gone"), vec![4]).await.unwrap();
    assert!(storage.delete_if_exists(&handle).await.unwrap());

    let never = StorageHandle::parse("never/stored").unwrap();
    assert!(matches!(storage.get(&never).await, Err(Error::NotFound(_))));
}

pub async fn check_list_prefix(storage: &dyn Storage) {
    let keys = ["p/a", "p/b/c", "p/b/d", "pa", "q/p/a", "p.txt"];
    let mut handles = Vec::new();
    for k in keys {
        handles.push(storage.put(&key(k), k.as_bytes().to_vec()).await.unwrap());
    }

    for prefix in ["", "p", "p/", "p/b", "p/b/", "q", "x", "p/a"] {
        let expected: BTreeSet<String> = keys
            .iter()
            .filter(|k| k.starts_with(prefix))
            .map(|k| k.to_string())
            .collect();
        assert_eq!(listed(storage, prefix).await, expected, "prefix {prefix:?}");
    }

    // Restartable: a second listing yields the same handles again.
    assert_eq!(listed(storage, "p/").await, listed(storage, "p/").await);

    // Lazy: taking one item does not require walking everything.
    let first = storage.list("").next().await;
    assert!(matches!(first, Some(Ok(_))));

    for handle in &handles {
        storage.delete(handle).await.unwrap();
    }
    assert!(listed(storage, "").await.is_empty());
}

pub async fn check_key_conflicts(storage: &dyn Storage) {
    let file = storage.put(&key("c/file"), vec![1]).await.unwrap();

    let below = storage.put(&key("c/file/inner"), vec![2]).await;
    assert!(matches!(below, Err(Error::InvalidKey(_))));

    let over_dir = storage.put(&key("c"), vec![3]).await;
    assert!(matches!(over_dir, Err(Error::InvalidKey(_))));

    // Failed puts leave the existing blob alone.
    assert_eq!(storage.get(&file).await.unwrap(), vec![1]);
    assert_eq!(listed(storage, "c").await.len(), 1);

    storage.delete(&file).await.unwrap();
    let now_free = storage.put(&key("c"), vec![4]).await.unwrap();
    storage.delete(&now_free).await.unwrap();
}

pub async fn check_writer(storage: &dyn Storage) {
    let target = key("w/blob");
    let mut writer = storage.writer(&target).await.unwrap();
    writer.write(b"abc").await.unwrap();
    writer.write(b"").await.unwrap();
    writer.write(b"def").await.unwrap();
    assert_eq!(writer.bytes_written(), 6);
    assert_eq!(writer.key(), &target);

    // Not visible before commit.
    assert!(!storage.exists(&StorageHandle::from(target.clone())).await.unwrap());

    let handle = writer.commit().await.unwrap();
    assert_eq!(storage.get(&handle).await.unwrap(), b"abcdef");

    let dropped = key("w/dropped");
    let mut writer = storage.writer(&dropped).await.unwrap();
    writer.write(b"never").await.unwrap();
    drop(writer);
    assert!(!storage.exists(&StorageHandle::from(dropped)).await.unwrap());
    assert_eq!(listed(storage, "w/").await.len(), 1);

    let generated = StorageKey::generate();
    let mut writer = storage.writer(&generated).await.unwrap();
    writer.write(b"anonymous").await.unwrap();
    let anon = writer.commit().await.unwrap();
    assert_eq!(anon.key(), &generated);
    assert_eq!(storage.get(&anon).await.unwrap(), b"anonymous");

    storage.delete(&handle).await.unwrap();
    storage.delete(&anon).await.unwrap();
}

pub async fn check_get_stream(storage: &dyn Storage) {
    let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let handle = storage.put(&key("streamed"), data.clone()).await.unwrap();

    let chunks: Vec<_> = storage
        .get_stream(&handle)
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    let joined: Vec<u8> = chunks.iter().flat_map(|c| c.iter().copied()).collect();
    assert_eq!(joined, data);

    storage.delete(&handle).await.unwrap();
}

/// Write many chunk layouts, including empty chunks and empty blobs, and
/// read each back. Returns the number of blobs left in storage.
///
/// `mul` scales the large chunks so that they overflow write buffers.
pub async fn check_write_grid(storage: &dyn Storage, mul: usize) -> usize {
    let layouts: Vec<Vec<Vec<u8>>> = vec![
        vec![b"abcd".repeat(mul), b"efgh".repeat(mul)],
        vec![b"abc".repeat(mul), b"defg".repeat(mul)],
        vec![b"abc".repeat(mul), b"def".repeat(mul), b"g".repeat(mul)],
        vec![b"abcd".repeat(mul)],
        vec![b"abc".repeat(mul), b"d".repeat(mul)],
        vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()],
        vec![b"ab".to_vec()],
        vec![b"a".to_vec(), b"b".to_vec()],
        vec![Vec::new()],
        vec![],
    ];

    let mut written = 0;
    for writes in &layouts {
        // As given, then with a blank chunk inserted at each position.
        let variants = std::iter::once(writes.clone()).chain((0..=writes.len()).map(|i| {
            let mut v = writes.clone();
            v.insert(i, Vec::new());
            v
        }));

        for variant in variants {
            let mut writer = storage.writer(&StorageKey::generate()).await.unwrap();
            for piece in &variant {
                writer.write(piece).await.unwrap();
            }
            let handle = writer.commit().await.unwrap();
            assert_eq!(storage.get(&handle).await.unwrap(), variant.concat());
            written += 1;
        }
    }
    written
}
