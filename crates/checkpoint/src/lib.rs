//! Checkpoint management for the training loop
//!
//! Provides the snapshot file format and a manager that saves, restores and
//! retains snapshots of persisted state.

pub mod manager;
pub mod writer;

pub use manager::{
    parse_step, CheckpointManager, CheckpointManagerConfig, CheckpointManifest, MANIFEST_FILE,
    SAVED_VARS_FILE,
};
pub use writer::{decode_snapshot, encode_snapshot, CheckpointHeader, Snapshot};
