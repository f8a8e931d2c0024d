//! Local-disk backend with real directories.

use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::trace;

use super::{DirectoryLayout, ObjectBackend, ObjectReader};
use crate::error::{BackendError, BackendResult};

/// Backend storing objects as plain files under a root directory.
#[derive(Debug, Clone)]
pub struct LocalFsBackend {
    root: PathBuf,
}

impl LocalFsBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a key onto the filesystem, refusing anything that could escape
    /// the root.
    fn resolve(&self, key: &str) -> BackendResult<PathBuf> {
        let relative = Path::new(key);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(BackendError::InvalidKey {
                key: key.to_owned(),
            });
        }
        Ok(self.root.join(relative))
    }

    async fn ensure_parent(&self, key: &str, path: &Path) -> BackendResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| BackendError::from_io(key, e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectBackend for LocalFsBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    fn layout(&self) -> DirectoryLayout {
        DirectoryLayout::Native
    }

    async fn get(&self, key: &str) -> BackendResult<ObjectReader> {
        let path = self.resolve(key)?;
        let file = fs::File::open(&path)
            .await
            .map_err(|e| BackendError::from_io(key, e))?;
        Ok(Box::new(file))
    }

    async fn put(&self, key: &str, mut reader: ObjectReader) -> BackendResult<u64> {
        let path = self.resolve(key)?;
        self.ensure_parent(key, &path).await?;
        let mut file = fs::File::create(&path)
            .await
            .map_err(|e| BackendError::from_io(key, e))?;
        let written = tokio::io::copy(&mut reader, &mut file)
            .await
            .map_err(|e| BackendError::from_io(key, e))?;
        file.flush().await.map_err(|e| BackendError::from_io(key, e))?;
        trace!(key, written, "Stored local object");
        Ok(written)
    }

    async fn delete(&self, key: &str) -> BackendResult<()> {
        let path = self.resolve(key)?;
        fs::remove_file(&path)
            .await
            .map_err(|e| BackendError::from_io(key, e))
    }

    async fn exists(&self, key: &str) -> BackendResult<bool> {
        let path = self.resolve(key)?;
        fs::try_exists(&path)
            .await
            .map_err(|e| BackendError::from_io(key, e))
    }

    async fn size(&self, key: &str) -> BackendResult<u64> {
        let path = self.resolve(key)?;
        let meta = fs::metadata(&path)
            .await
            .map_err(|e| BackendError::from_io(key, e))?;
        Ok(meta.len())
    }

    async fn modified(&self, key: &str) -> BackendResult<i64> {
        let path = self.resolve(key)?;
        let meta = fs::metadata(&path)
            .await
            .map_err(|e| BackendError::from_io(key, e))?;
        let modified = meta.modified().map_err(|e| BackendError::from_io(key, e))?;
        Ok(modified
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs() as i64))
    }

    async fn mkdir(&self, key: &str) -> BackendResult<()> {
        let path = self.resolve(key)?;
        fs::create_dir_all(&path)
            .await
            .map_err(|e| BackendError::from_io(key, e))
    }

    async fn rmdir(&self, key: &str) -> BackendResult<()> {
        let path = self.resolve(key)?;
        fs::remove_dir(&path)
            .await
            .map_err(|e| BackendError::from_io(key, e))
    }

    async fn rename(&self, from: &str, to: &str) -> BackendResult<()> {
        let src = self.resolve(from)?;
        let dst = self.resolve(to)?;
        self.ensure_parent(to, &dst).await?;
        fs::rename(&src, &dst)
            .await
            .map_err(|e| BackendError::from_io(from, e))
    }
}
