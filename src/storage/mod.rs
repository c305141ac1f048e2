//! Object storage for snapshot archives.
//!
//! Objects are write-once: putting to an existing key fails with
//! [`crate::errors::EngineError::Conflict`], so readers never need to
//! lock.

use std::sync::Arc;

use async_trait::async_trait;
use sha2::Digest;
use sha2::Sha256;

use crate::errors::Result;
use crate::model::StorageLocation;

mod fs;

pub use fs::FsObjectStore;

#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    async fn put(&self, location: &StorageLocation, data: Vec<u8>) -> Result<()>;

    async fn get(&self, location: &StorageLocation) -> Result<Vec<u8>>;

    /// Provider-reported hex sha256 of the stored object, if the
    /// backend keeps one.
    async fn checksum(&self, location: &StorageLocation) -> Result<Option<String>>;
}

pub type SharedObjectStore = Arc<dyn ObjectStore>;

/// Lowercase hex sha256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[test]
fn sha256_of_known_input() {
    assert_eq!(
        sha256_hex(b"test"),
        "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08"
    );
}
