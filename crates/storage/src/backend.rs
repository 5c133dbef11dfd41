//! Storage backend trait definition

use async_trait::async_trait;
use bytes::Bytes;
use std::time::SystemTime;
use train_core::Result;

/// Size and modification time of a stored object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectMeta {
    pub size: u64,
    pub modified: SystemTime,
}

/// Async storage for run artifacts (snapshots, manifests, summaries).
///
/// Paths are relative to the backend root. `write` must be atomic: readers
/// observe either the previous content or the complete new content, never a
/// partial file.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Read the whole object at `path`
    async fn read(&self, path: &str) -> Result<Bytes>;

    /// Atomically replace the object at `path`, returning the bytes written
    async fn write(&self, path: &str, data: Bytes) -> Result<u64>;

    /// Append to the object at `path`, creating it if needed
    async fn append(&self, path: &str, data: Bytes) -> Result<u64>;

    /// Delete the object at `path`
    async fn delete(&self, path: &str) -> Result<()>;

    /// Check if a path exists
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Size and modification time of the object at `path`
    async fn stat(&self, path: &str) -> Result<ObjectMeta>;

    /// Names of the objects directly under the root whose name starts with
    /// `prefix`, sorted. In-flight temporary files are never listed.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}
