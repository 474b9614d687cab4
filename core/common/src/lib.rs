//! Common types shared by the rpmstore crates.
//!
//! Keys, handles and the error taxonomy live here so that every storage
//! backend reports failures the same way.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{StorageHandle, StorageKey, MAX_KEY_LEN, TEMP_DIR_NAME};
