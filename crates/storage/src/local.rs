//! Local filesystem storage backend

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};
use train_core::{Error, Result};
use uuid::Uuid;

use crate::{ObjectMeta, StorageBackend};

/// Suffix of in-flight temporary files
const TEMP_SUFFIX: &str = ".tmp";

/// Local filesystem storage rooted at a run directory.
///
/// The root is created lazily by the first write, so opening a storage on a
/// directory that does not exist yet has no side effect.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute location of `path`
    pub fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    fn temp_path(&self, path: &str) -> PathBuf {
        let full_path = self.resolve(path);
        let temp_name = format!(
            ".{}.{}{}",
            full_path.file_name().unwrap_or_default().to_string_lossy(),
            Uuid::new_v4(),
            TEMP_SUFFIX
        );
        full_path.with_file_name(temp_name)
    }

    async fn ensure_parent(&self, full_path: &Path) -> Result<()> {
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Storage {
                    message: format!("Failed to create directory {}: {}", parent.display(), e),
                })?;
        }
        Ok(())
    }
}

/// Flush the directory entry so a completed rename survives a crash
#[cfg(unix)]
async fn sync_parent(full_path: &Path) -> Result<()> {
    if let Some(parent) = full_path.parent() {
        let dir = fs::File::open(parent).await.map_err(|e| Error::Storage {
            message: format!("Failed to open directory {}: {}", parent.display(), e),
        })?;
        dir.sync_all().await.map_err(|e| Error::Storage {
            message: format!("Failed to sync directory {}: {}", parent.display(), e),
        })?;
    }
    Ok(())
}

#[cfg(not(unix))]
async fn sync_parent(_full_path: &Path) -> Result<()> {
    Ok(())
}

#[async_trait]
impl StorageBackend for LocalStorage {
    #[instrument(skip(self), fields(backend = "local"))]
    async fn read(&self, path: &str) -> Result<Bytes> {
        let full_path = self.resolve(path);

        match fs::read(&full_path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::StoragePathNotFound {
                path: full_path.display().to_string(),
            }),
            Err(e) => Err(Error::Storage {
                message: format!("Failed to read {}: {}", full_path.display(), e),
            }),
        }
    }

    #[instrument(skip(self, data), fields(backend = "local", size = data.len()))]
    async fn write(&self, path: &str, data: Bytes) -> Result<u64> {
        let full_path = self.resolve(path);
        let temp_path = self.temp_path(path);
        self.ensure_parent(&full_path).await?;

        let result = async {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
            fs::rename(&temp_path, &full_path).await
        }
        .await;

        if let Err(e) = result {
            // Never leave a half-written temp file behind
            let _ = fs::remove_file(&temp_path).await;
            return Err(Error::Storage {
                message: format!("Failed to write {}: {}", full_path.display(), e),
            });
        }

        sync_parent(&full_path).await?;
        debug!(path = %full_path.display(), size = data.len(), "Wrote file atomically");
        Ok(data.len() as u64)
    }

    #[instrument(skip(self, data), fields(backend = "local", size = data.len()))]
    async fn append(&self, path: &str, data: Bytes) -> Result<u64> {
        let full_path = self.resolve(path);
        self.ensure_parent(&full_path).await?;

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&full_path)
            .await
            .map_err(|e| Error::Storage {
                message: format!("Failed to open {} for append: {}", full_path.display(), e),
            })?;
        file.write_all(&data).await.map_err(|e| Error::Storage {
            message: format!("Failed to append to {}: {}", full_path.display(), e),
        })?;
        file.flush().await?;
        Ok(data.len() as u64)
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn delete(&self, path: &str) -> Result<()> {
        let full_path = self.resolve(path);

        match fs::remove_file(&full_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::StoragePathNotFound {
                path: full_path.display().to_string(),
            }),
            Err(e) => Err(Error::Storage {
                message: format!("Failed to delete {}: {}", full_path.display(), e),
            }),
        }
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(fs::metadata(self.resolve(path)).await.is_ok())
    }

    async fn stat(&self, path: &str) -> Result<ObjectMeta> {
        let full_path = self.resolve(path);

        match fs::metadata(&full_path).await {
            Ok(meta) => Ok(ObjectMeta {
                size: meta.len(),
                modified: meta.modified()?,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::StoragePathNotFound {
                path: full_path.display().to_string(),
            }),
            Err(e) => Err(Error::Storage {
                message: format!("Failed to stat {}: {}", full_path.display(), e),
            }),
        }
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(Error::Storage {
                    message: format!("Failed to list {}: {}", self.root.display(), e),
                })
            }
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(prefix) && !name.ends_with(TEMP_SUFFIX) {
                names.push(name);
            }
        }

        names.sort();
        Ok(names)
    }
}
