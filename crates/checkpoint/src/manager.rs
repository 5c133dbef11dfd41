//! Checkpoint manager: snapshot save/restore, manifest and retention

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use storage::{LocalStorage, StorageBackend};
use tracing::{debug, info, instrument, warn};
use train_core::{CheckpointId, CheckpointMetadata, Error, NamedTensor, Result, StateDict, Step};

use crate::writer::{decode_snapshot, encode_snapshot};

/// Name of the manifest file inside a checkpoint directory
pub const MANIFEST_FILE: &str = "checkpoint";

/// Name of the persisted-state listing written after initialization
pub const SAVED_VARS_FILE: &str = "saved_vars.txt";

/// Checkpoint manager configuration
#[derive(Debug, Clone)]
pub struct CheckpointManagerConfig {
    /// Directory holding snapshots and the manifest
    pub directory: PathBuf,

    /// Number of snapshots to keep
    pub max_checkpoints: usize,

    /// Snapshot name prefix; snapshots are `<model_name>-<step>`
    pub model_name: String,
}

impl CheckpointManagerConfig {
    pub fn new(directory: impl Into<PathBuf>, max_checkpoints: usize) -> Self {
        Self {
            directory: directory.into(),
            max_checkpoints,
            ..Default::default()
        }
    }
}

impl Default for CheckpointManagerConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./logdir"),
            max_checkpoints: 5,
            model_name: "model.ckpt".to_string(),
        }
    }
}

/// On-disk manifest naming the latest snapshot and every retained one
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub model_checkpoint_path: String,
    pub all_model_checkpoint_paths: Vec<String>,
}

/// Owns save and restore of persisted state for one directory.
///
/// Saves follow write-new-then-register: the snapshot is written atomically
/// first, the manifest is replaced second, and files that the manifest no
/// longer references are deleted last. A crash at any point leaves the
/// manifest pointing at a complete snapshot.
pub struct CheckpointManager {
    config: CheckpointManagerConfig,
    storage: Arc<dyn StorageBackend>,

    /// Registered snapshots indexed by step
    checkpoints: RwLock<BTreeMap<Step, CheckpointMetadata>>,
}

impl CheckpointManager {
    /// Open a manager on a local directory. The directory is not created
    /// until the first save.
    pub async fn open(config: CheckpointManagerConfig) -> Result<Self> {
        let storage = Arc::new(LocalStorage::new(&config.directory));
        Self::with_storage(config, storage).await
    }

    /// Open a manager on an arbitrary storage backend
    pub async fn with_storage(
        config: CheckpointManagerConfig,
        storage: Arc<dyn StorageBackend>,
    ) -> Result<Self> {
        let manager = Self {
            config,
            storage,
            checkpoints: RwLock::new(BTreeMap::new()),
        };

        if let Some(manifest) = manager.read_manifest().await? {
            let mut recovered = BTreeMap::new();
            for entry in &manifest.all_model_checkpoint_paths {
                let id = snapshot_name(entry);
                let step = parse_step(&id)?;
                match manager.storage.stat(&id).await {
                    Ok(meta) => {
                        recovered.insert(
                            step,
                            CheckpointMetadata {
                                path: manager.path_of(&id).display().to_string(),
                                id,
                                step,
                                size_bytes: meta.size,
                                created_at: DateTime::<Utc>::from(meta.modified),
                            },
                        );
                    }
                    Err(Error::StoragePathNotFound { .. }) => {
                        warn!(checkpoint_id = %id, "Manifest lists a missing snapshot");
                    }
                    Err(e) => return Err(e),
                }
            }

            info!(
                directory = %manager.config.directory.display(),
                checkpoints = recovered.len(),
                "Loaded checkpoint manifest"
            );
            *manager.checkpoints.write() = recovered;
        }

        Ok(manager)
    }

    /// Checkpoint directory
    pub fn directory(&self) -> &Path {
        &self.config.directory
    }

    /// Identifier of the snapshot for `step`
    pub fn checkpoint_id(&self, step: Step) -> CheckpointId {
        format!("{}-{}", self.config.model_name, step)
    }

    /// Location of the snapshot for `step`
    pub fn checkpoint_path(&self, step: Step) -> PathBuf {
        self.path_of(&self.checkpoint_id(step))
    }

    /// Save all persisted state tagged with `step`
    #[instrument(skip(self, tensors), fields(directory = %self.config.directory.display()))]
    pub async fn save(&self, tensors: Vec<NamedTensor>, step: Step) -> Result<CheckpointMetadata> {
        let start = Instant::now();
        let id = self.checkpoint_id(step);
        info!(step, checkpoint_id = %id, "Storing checkpoint");

        let data = encode_snapshot(step, &tensors)?;
        let size_bytes = self
            .storage
            .write(&id, data)
            .await
            .map_err(|e| Error::CheckpointWriteFailed {
                message: format!("{}: {}", id, e),
            })?;

        let metadata = CheckpointMetadata {
            id: id.clone(),
            step,
            path: self.path_of(&id).display().to_string(),
            size_bytes,
            created_at: Utc::now(),
        };

        // Register only after the snapshot is durable
        let mut next = self.checkpoints.read().clone();
        let superseded = next.split_off(&step);
        next.insert(step, metadata.clone());
        let mut evicted: Vec<CheckpointId> = superseded
            .into_values()
            .map(|m| m.id)
            .filter(|old| old != &id)
            .collect();
        while next.len() > self.config.max_checkpoints.max(1) {
            if let Some((_, old)) = next.pop_first() {
                evicted.push(old.id);
            }
        }

        self.write_manifest(&next, &id).await?;
        *self.checkpoints.write() = next;

        self.remove_unregistered(&evicted).await?;

        info!(
            step,
            checkpoint_id = %id,
            size_bytes,
            evicted = evicted.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Checkpoint stored"
        );
        Ok(metadata)
    }

    /// Restore the latest snapshot into `state`.
    ///
    /// Returns `None` when the directory holds no manifest. Any failure past
    /// that point is reported as [`Error::Restore`].
    #[instrument(skip(self, state), fields(directory = %self.config.directory.display()))]
    pub async fn load_into(&self, state: &mut dyn StateDict) -> Result<Option<Step>> {
        info!("Trying to restore saved checkpoints");

        let manifest = match self.read_manifest().await {
            Ok(Some(manifest)) => manifest,
            Ok(None) => {
                info!("No checkpoint found");
                return Ok(None);
            }
            Err(e) => return Err(e.into_restore(self.path_of(MANIFEST_FILE).display().to_string())),
        };

        let id = snapshot_name(&manifest.model_checkpoint_path);
        info!(checkpoint = %self.path_of(&id).display(), "Checkpoint found");

        self.restore(&id, state)
            .await
            .map(Some)
            .map_err(|e| e.into_restore(self.path_of(&id).display().to_string()))
    }

    async fn restore(&self, id: &str, state: &mut dyn StateDict) -> Result<Step> {
        let step = parse_step(id)?;
        let data = self.storage.read(id).await?;
        let snapshot = decode_snapshot(id, &data)?;

        if snapshot.header.step != step {
            return Err(Error::CheckpointCorrupted {
                checkpoint_id: id.to_string(),
                reason: format!(
                    "header records step {} but the name says {}",
                    snapshot.header.step, step
                ),
            });
        }

        state.import_state(snapshot.tensors)?;
        info!(step, "Restored model");
        Ok(step)
    }

    /// Write the names of all persisted tensors as a JSON array
    pub async fn write_saved_vars(&self, names: &[String]) -> Result<()> {
        let data = serde_json::to_vec_pretty(names)?;
        self.storage.write(SAVED_VARS_FILE, data.into()).await?;
        debug!(count = names.len(), "Wrote saved variable names");
        Ok(())
    }

    /// Get the latest checkpoint
    pub fn latest(&self) -> Option<CheckpointMetadata> {
        self.checkpoints.read().values().last().cloned()
    }

    /// Get checkpoint by step
    pub fn get_by_step(&self, step: Step) -> Option<CheckpointMetadata> {
        self.checkpoints.read().get(&step).cloned()
    }

    /// Get all checkpoints, oldest first
    pub fn all_checkpoints(&self) -> Vec<CheckpointMetadata> {
        self.checkpoints.read().values().cloned().collect()
    }

    fn path_of(&self, name: &str) -> PathBuf {
        self.config.directory.join(name)
    }

    async fn read_manifest(&self) -> Result<Option<CheckpointManifest>> {
        if !self.storage.exists(MANIFEST_FILE).await? {
            return Ok(None);
        }

        let data = self.storage.read(MANIFEST_FILE).await?;
        let manifest = serde_json::from_slice(&data).map_err(|e| Error::CheckpointCorrupted {
            checkpoint_id: MANIFEST_FILE.to_string(),
            reason: format!("invalid manifest: {}", e),
        })?;
        Ok(Some(manifest))
    }

    async fn write_manifest(
        &self,
        checkpoints: &BTreeMap<Step, CheckpointMetadata>,
        latest: &str,
    ) -> Result<()> {
        let manifest = CheckpointManifest {
            model_checkpoint_path: latest.to_string(),
            all_model_checkpoint_paths: checkpoints.values().map(|m| m.id.clone()).collect(),
        };
        let data = serde_json::to_vec_pretty(&manifest)?;

        self.storage
            .write(MANIFEST_FILE, data.into())
            .await
            .map_err(|e| Error::CheckpointWriteFailed {
                message: format!("manifest: {}", e),
            })?;
        Ok(())
    }

    /// Delete snapshot files the manifest does not reference
    async fn remove_unregistered(&self, evicted: &[CheckpointId]) -> Result<()> {
        let registered: HashSet<CheckpointId> =
            self.checkpoints.read().values().map(|m| m.id.clone()).collect();
        let prefix = format!("{}-", self.config.model_name);

        for name in self.storage.list(&prefix).await? {
            if registered.contains(&name) || parse_step(&name).is_err() {
                continue;
            }

            if evicted.contains(&name) {
                debug!(checkpoint_id = %name, "Evicting old checkpoint");
            } else {
                warn!(checkpoint_id = %name, "Removing unregistered snapshot");
            }

            if let Err(e) = self.storage.delete(&name).await {
                warn!(checkpoint_id = %name, error = %e, "Failed to delete old checkpoint");
            }
        }
        Ok(())
    }
}

/// File name component of a manifest entry
fn snapshot_name(entry: &str) -> String {
    Path::new(entry)
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| entry.to_string())
}

/// Global step encoded after the last `-` of a snapshot name
pub fn parse_step(checkpoint_id: &str) -> Result<Step> {
    checkpoint_id
        .rsplit_once('-')
        .and_then(|(_, step)| step.parse::<Step>().ok())
        .ok_or_else(|| Error::CheckpointCorrupted {
            checkpoint_id: checkpoint_id.to_string(),
            reason: "cannot parse the global step from the checkpoint name".to_string(),
        })
}
