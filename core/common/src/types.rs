//! Keys and handles used throughout rpmstore.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Longest accepted key, in bytes.
pub const MAX_KEY_LEN: usize = 1024;

/// Directory name reserved by backends for in-flight writes.
pub const TEMP_DIR_NAME: &str = ".tmp";

/// A validated, `/`-separated key naming a blob within a backend.
///
/// Keys are relative: they never start or end with `/`, never contain
/// empty, `.` or `..` components, and never contain `\` or NUL. This makes
/// it impossible for a key to escape a backend's root directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorageKey(String);

impl StorageKey {
    /// Parse and validate a key.
    ///
    /// # Errors
    /// - `InvalidKey` if any of the rules above is violated
    pub fn parse(key: &str) -> crate::Result<Self> {
        validate(key)?;
        Ok(Self(key.to_string()))
    }

    /// Generate a fresh random key.
    ///
    /// The key is a UUIDv4 in hex, sharded as `xxx/xxx/xxx/rest`: four
    /// levels with at most 4096 entries per intermediate directory.
    pub fn generate() -> Self {
        let id = Uuid::new_v4().simple().to_string();
        Self(format!("{}/{}/{}/{}", &id[..3], &id[3..6], &id[6..9], &id[9..]))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Iterate over the `/`-separated components.
    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }

    /// Keys of every strict ancestor directory, nearest first.
    ///
    /// For `a/b/c` this yields `a/b` then `a`.
    pub fn ancestors(&self) -> impl Iterator<Item = &str> {
        let key = self.0.as_str();
        key.char_indices()
            .rev()
            .filter(|(_, c)| *c == '/')
            .map(move |(i, _)| &key[..i])
    }

    /// Check whether `self` names a directory that contains `other`.
    pub fn is_ancestor_of(&self, other: &StorageKey) -> bool {
        other.0.len() > self.0.len()
            && other.0.starts_with(&self.0)
            && other.0.as_bytes()[self.0.len()] == b'/'
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn validate(key: &str) -> crate::Result<()> {
    let invalid = |reason: &str| {
        Err(crate::Error::InvalidKey(format!("{:?}: {}", key, reason)))
    };

    if key.is_empty() {
        return invalid("key cannot be empty");
    }
    if key.len() > MAX_KEY_LEN {
        return invalid("key is too long");
    }
    if key.starts_with('/') {
        return invalid("absolute keys are not allowed");
    }
    if key.contains('\\') || key.contains('\0') {
        return invalid("key contains a forbidden character");
    }
    for (i, comp) in key.split('/').enumerate() {
        match comp {
            "" => return invalid("key contains an empty component"),
            "." | ".." => return invalid("relative path components are not allowed"),
            TEMP_DIR_NAME if i == 0 => return invalid("key uses a reserved name"),
            _ => {}
        }
    }
    Ok(())
}

/// Opaque reference to a stored blob, returned by a store operation.
///
/// A handle stays valid until the blob is deleted. Its string form is
/// stable, so handles can be persisted (e.g. in an index) and parsed back.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StorageHandle(StorageKey);

impl StorageHandle {
    /// Parse a handle from its string form.
    pub fn parse(handle: &str) -> crate::Result<Self> {
        StorageKey::parse(handle).map(Self)
    }

    /// The key this handle refers to.
    pub fn key(&self) -> &StorageKey {
        &self.0
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<StorageKey> for StorageHandle {
    fn from(key: StorageKey) -> Self {
        Self(key)
    }
}

impl TryFrom<String> for StorageHandle {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        validate(&value)?;
        Ok(Self(StorageKey(value)))
    }
}

impl From<StorageHandle> for String {
    fn from(handle: StorageHandle) -> Self {
        (handle.0).0
    }
}

impl fmt::Display for StorageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use proptest::prelude::*;

    #[test]
    fn test_key_parse_valid() {
        let key = StorageKey::parse("a/b.txt").unwrap();
        assert_eq!(key.as_str(), "a/b.txt");
        assert_eq!(key.components().collect::<Vec<_>>(), vec!["a", "b.txt"]);
    }

    #[test]
    fn test_key_rejects_traversal() {
        for bad in ["../etc/passwd", "a/../b", "a/./b", "..", "."] {
            assert!(
                matches!(StorageKey::parse(bad), Err(Error::InvalidKey(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_key_rejects_malformed() {
        let too_long = "x".repeat(MAX_KEY_LEN + 1);
        for bad in ["", "/etc/passwd", "a//b", "a/", "a\\b", "a\0b", ".tmp/x", too_long.as_str()] {
            assert!(
                matches!(StorageKey::parse(bad), Err(Error::InvalidKey(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_reserved_name_only_at_top_level() {
        assert!(StorageKey::parse("a/.tmp").is_ok());
        assert!(StorageKey::parse(".tmpfile").is_ok());
    }

    #[test]
    fn test_generated_key_shape() {
        let key = StorageKey::generate();
        let parts: Vec<_> = key.components().collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0].len(), 3);
        assert_eq!(parts[1].len(), 3);
        assert_eq!(parts[2].len(), 3);
        assert_eq!(parts[3].len(), 23);
        assert!(StorageKey::parse(key.as_str()).is_ok());
        assert_ne!(key, StorageKey::generate());
    }

    #[test]
    fn test_ancestors() {
        let key = StorageKey::parse("a/b/c").unwrap();
        assert_eq!(key.ancestors().collect::<Vec<_>>(), vec!["a/b", "a"]);
        let flat = StorageKey::parse("a").unwrap();
        assert_eq!(flat.ancestors().count(), 0);
    }

    #[test]
    fn test_is_ancestor_of() {
        let a = StorageKey::parse("a").unwrap();
        let ab = StorageKey::parse("a/b").unwrap();
        let abc = StorageKey::parse("abc").unwrap();
        assert!(a.is_ancestor_of(&ab));
        assert!(!a.is_ancestor_of(&abc));
        assert!(!a.is_ancestor_of(&a));
        assert!(!ab.is_ancestor_of(&a));
    }

    #[test]
    fn test_handle_serde() {
        let handle = StorageHandle::parse("rpms/foo-1.0.rpm").unwrap();
        let json = serde_json::to_string(&handle).unwrap();
        assert_eq!(json, "\"rpms/foo-1.0.rpm\"");
        let back: StorageHandle = serde_json::from_str(&json).unwrap();
        assert_eq!(back, handle);

        assert!(serde_json::from_str::<StorageHandle>("\"../x\"").is_err());
    }

    proptest! {
        #[test]
        fn prop_valid_keys_roundtrip(parts in proptest::collection::vec("[a-zA-Z0-9_-][a-zA-Z0-9_.-]{0,8}", 1..5)) {
            let raw = parts.join("/");
            let key = StorageKey::parse(&raw).unwrap();
            prop_assert_eq!(key.as_str(), raw.as_str());
            let handle = StorageHandle::parse(&raw).unwrap();
            prop_assert_eq!(handle.key(), &key);
        }

        #[test]
        fn prop_parent_components_rejected(prefix in "[a-z]{1,5}", suffix in "[a-z]{1,5}") {
            let raw = format!("{prefix}/../{suffix}");
            prop_assert!(StorageKey::parse(&raw).is_err());
        }
    }
}
