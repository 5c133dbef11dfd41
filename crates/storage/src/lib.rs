//! Storage - backends for training run artifacts
//!
//! Provides async storage operations with atomic replacement, used for
//! checkpoint snapshots, manifests and summary streams.
//!
//! # Example
//!
//! ```no_run
//! use storage::{StorageBackend, LocalStorage};
//! use bytes::Bytes;
//!
//! # async fn example() -> train_core::Result<()> {
//! let storage = LocalStorage::new("./logdir/train/run-1");
//! storage.write("checkpoint", Bytes::from_static(b"{}")).await?;
//! let data = storage.read("checkpoint").await?;
//! # Ok(())
//! # }
//! ```

mod backend;
mod local;

pub use backend::{ObjectMeta, StorageBackend};
pub use local::LocalStorage;
