use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use ringlog_common::LogError;
use tracing::info;

use crate::file::FileDevice;
use crate::BlockDevice;

/// File extension used by the default backend for log files.
pub const LOG_FILE_EXTENSION: &str = "rlog";

/// Capability for creating, opening and enumerating log files.
///
/// The engine itself is path-agnostic; everything filename-shaped lives
/// behind this trait so tests can interpose (for example to wrap every
/// opened device in a fault injector).
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Create a new fixed-size log file. Fails if the path already exists.
    async fn create(
        &self,
        path: &Path,
        len: u64,
        sparse: bool,
    ) -> Result<Arc<dyn BlockDevice>, LogError>;

    /// Open an existing log file.
    async fn open(&self, path: &Path) -> Result<Arc<dyn BlockDevice>, LogError>;

    /// Remove a log file.
    async fn delete(&self, path: &Path) -> Result<(), LogError>;

    /// List log files under `dir`.
    async fn enumerate(&self, dir: &Path) -> Result<Vec<PathBuf>, LogError>;
}

/// Default backend over the local filesystem.
#[derive(Default)]
pub struct FileBackend;

#[async_trait]
impl StorageBackend for FileBackend {
    async fn create(
        &self,
        path: &Path,
        len: u64,
        sparse: bool,
    ) -> Result<Arc<dyn BlockDevice>, LogError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let device = FileDevice::create(path, len, sparse)?;
        info!(path = %path.display(), len, "created log file");
        Ok(Arc::new(device))
    }

    async fn open(&self, path: &Path) -> Result<Arc<dyn BlockDevice>, LogError> {
        if !path.exists() {
            return Err(LogError::NotFound);
        }
        Ok(Arc::new(FileDevice::open(path)?))
    }

    async fn delete(&self, path: &Path) -> Result<(), LogError> {
        if !path.exists() {
            return Err(LogError::NotFound);
        }
        std::fs::remove_file(path)?;
        info!(path = %path.display(), "deleted log file");
        Ok(())
    }

    async fn enumerate(&self, dir: &Path) -> Result<Vec<PathBuf>, LogError> {
        let mut out = Vec::new();
        if !dir.exists() {
            return Ok(out);
        }
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some(LOG_FILE_EXTENSION) {
                out.push(path);
            }
        }
        out.sort();
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ringlog_common::BLOCK_SIZE;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_create_open_delete_enumerate() {
        let dir = TempDir::new().unwrap();
        let backend = FileBackend;
        let path = dir.path().join("a.rlog");

        backend
            .create(&path, 16 * BLOCK_SIZE as u64, true)
            .await
            .unwrap();
        assert!(matches!(
            backend.create(&path, 16 * BLOCK_SIZE as u64, true).await,
            Err(LogError::Io(_))
        ));

        let listed = backend.enumerate(dir.path()).await.unwrap();
        assert_eq!(listed, vec![path.clone()]);

        let dev = backend.open(&path).await.unwrap();
        assert_eq!(dev.len(), 16 * BLOCK_SIZE as u64);

        backend.delete(&path).await.unwrap();
        assert!(matches!(backend.open(&path).await, Err(LogError::NotFound)));
        assert!(backend.enumerate(dir.path()).await.unwrap().is_empty());
    }
}
