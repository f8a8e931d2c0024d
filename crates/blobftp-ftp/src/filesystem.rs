//! Filesystem adapter consumed by the FTP protocol layer.
//!
//! [`StorageFs`] presents the metadata cache and the storage bridge as the
//! conventional filesystem an FTP server expects: `stat`, `listdir`,
//! `open`, `mkdir`, `rename` and friends. Every path argument is an FTP
//! path (`/a/b/c.txt`) and goes through the path resolver first.
//!
//! # Pseudo ownership
//!
//! Nodes carry no owner. `stat` reports uid/gid 1000 for everything and
//! the name lookups always answer `"owner"` and `"group"`.

use blobftp_core::{FileNode, MetaStore, NodeKind, join_path, split_path};
use blobftp_storage::{ObjectBackend, ObjectReader, StorageBridge};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::error::{FsError, FsResult};
use crate::upload::{AbortReason, UploadCoordinator};

/// Regular-file mode bits reported by [`StorageFs::stat`].
pub const FILE_MODE: u32 = 0o100_770;
/// Directory mode bits reported by [`StorageFs::stat`].
pub const DIR_MODE: u32 = 0o040_770;
/// uid and gid reported for every node.
pub const PSEUDO_ID: u32 = 1000;

/// `stat(2)`-shaped metadata synthesized from a cache node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PseudoStat {
    pub st_mode: u32,
    pub st_ino: u64,
    pub st_dev: u64,
    pub st_nlink: u32,
    pub st_uid: u32,
    pub st_gid: u32,
    pub st_size: u64,
    pub st_mtime: i64,
}

impl PseudoStat {
    pub fn is_dir(&self) -> bool {
        self.st_mode & 0o170_000 == 0o040_000
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
}

/// Deferred write into the backing store.
///
/// Opening for write registers no metadata; the upload protocol owns the
/// record, and [`StorageFs::upload`] ties the two together.
#[derive(Debug)]
pub struct FileWriter {
    bridge: Arc<StorageBridge>,
    path: String,
}

impl FileWriter {
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Stream `reader` into the object, returning the bytes written.
    pub async fn write_from(self, reader: ObjectReader) -> FsResult<u64> {
        Ok(self.bridge.write(&self.path, reader).await?)
    }
}

/// A file opened through [`StorageFs::open`].
pub enum OpenFile {
    Read(ObjectReader),
    Write(FileWriter),
}

impl std::fmt::Debug for OpenFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpenFile::Read(_) => f.write_str("OpenFile::Read(..)"),
            OpenFile::Write(w) => f.debug_tuple("OpenFile::Write").field(w).finish(),
        }
    }
}

/// FTP-facing filesystem over a metadata cache and a blob backend.
#[derive(Debug, Clone)]
pub struct StorageFs {
    bridge: Arc<StorageBridge>,
    uploads: UploadCoordinator,
    snapshot: Option<PathBuf>,
    use_gmt_times: bool,
}

impl StorageFs {
    pub fn new(bridge: StorageBridge) -> Self {
        let uploads = UploadCoordinator::new(Arc::clone(bridge.meta()));
        Self {
            bridge: Arc::new(bridge),
            uploads,
            snapshot: None,
            use_gmt_times: true,
        }
    }

    /// Build over `backend` using the layout it advertises.
    pub fn with_backend(backend: Arc<dyn ObjectBackend>, meta: Arc<MetaStore>) -> Self {
        Self::new(StorageBridge::for_backend(backend, meta))
    }

    /// Save the cache to `path` on [`persist`](Self::persist).
    #[must_use]
    pub fn with_snapshot(mut self, path: impl Into<PathBuf>) -> Self {
        self.snapshot = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_gmt_times(mut self, use_gmt_times: bool) -> Self {
        self.use_gmt_times = use_gmt_times;
        self
    }

    pub fn bridge(&self) -> &StorageBridge {
        &self.bridge
    }

    pub fn meta(&self) -> &Arc<MetaStore> {
        self.bridge.meta()
    }

    pub fn uploads(&self) -> &UploadCoordinator {
        &self.uploads
    }

    pub fn use_gmt_times(&self) -> bool {
        self.use_gmt_times
    }

    pub fn snapshot_path(&self) -> Option<&Path> {
        self.snapshot.as_deref()
    }

    fn node(&self, path: &str) -> FsResult<FileNode> {
        Ok(self.meta().resolve(&split_path(path))?)
    }

    /// Open a file for reading or writing.
    #[instrument(level = "debug", skip(self), fields(path = %path, mode = ?mode))]
    pub async fn open(&self, path: &str, mode: OpenMode) -> FsResult<OpenFile> {
        match mode {
            OpenMode::Read => Ok(OpenFile::Read(self.bridge.open_read(path).await?)),
            OpenMode::Write => {
                let segments = split_path(path);
                if segments.is_empty() {
                    return Err(FsError::InvalidPath {
                        path: "/".into(),
                        reason: "cannot write to the root directory",
                    });
                }
                if self.meta().is_directory(&segments) {
                    return Err(FsError::TypeMismatch {
                        path: join_path(&segments),
                        expected: NodeKind::File,
                    });
                }
                Ok(OpenFile::Write(FileWriter {
                    bridge: Arc::clone(&self.bridge),
                    path: join_path(&segments),
                }))
            }
        }
    }

    /// Store `reader` at `path`, running the full upload protocol around
    /// the transfer.
    #[instrument(level = "debug", skip(self, reader), fields(path = %path))]
    pub async fn upload(&self, path: &str, reader: ObjectReader) -> FsResult<FileNode> {
        let ticket = self.uploads.start(path)?;
        let written = self.bridge.write(ticket.path(), reader).await;
        match written {
            Ok(written) => self.uploads.complete(ticket, written).await,
            Err(e) => {
                self.uploads.abort(ticket, AbortReason::Failed).await;
                Err(e.into())
            }
        }
    }

    pub async fn mkdir(&self, path: &str) -> FsResult<()> {
        self.bridge.mkdir(path).await?;
        Ok(())
    }

    pub async fn rmdir(&self, path: &str) -> FsResult<()> {
        Ok(self.bridge.rmdir(path).await?)
    }

    /// Delete a file.
    pub async fn remove(&self, path: &str) -> FsResult<()> {
        Ok(self.bridge.delete(path).await?)
    }

    pub async fn rename(&self, src: &str, dst: &str) -> FsResult<()> {
        self.bridge.rename(src, dst).await?;
        Ok(())
    }

    /// Move `src` to `dst`. Same reconciliation as [`rename`](Self::rename).
    pub async fn move_path(&self, src: &str, dst: &str) -> FsResult<()> {
        self.rename(src, dst).await
    }

    /// Child nodes of a directory, ordered by name.
    pub fn list_entries(&self, path: &str) -> FsResult<Vec<FileNode>> {
        Ok(self.meta().list_children(&split_path(path))?)
    }

    /// Names of a directory's children, ordered by name.
    pub fn listdir(&self, path: &str) -> FsResult<Vec<String>> {
        Ok(self
            .list_entries(path)?
            .into_iter()
            .map(|n| n.name)
            .collect())
    }

    /// Like [`listdir`](Self::listdir), with a trailing `/` on directories.
    pub fn listdir_marked(&self, path: &str) -> FsResult<Vec<String>> {
        Ok(self
            .list_entries(path)?
            .into_iter()
            .map(|n| if n.is_dir { format!("{}/", n.name) } else { n.name })
            .collect())
    }

    #[instrument(level = "trace", skip(self), fields(path = %path))]
    pub async fn stat(&self, path: &str) -> FsResult<PseudoStat> {
        let node = self.node(path)?;
        let st_size = self.bridge.size(path).await?;
        let st_mtime = self.bridge.modified(path).await?;
        Ok(PseudoStat {
            st_mode: if node.is_dir { DIR_MODE } else { FILE_MODE },
            st_ino: 0,
            st_dev: 0,
            st_nlink: 1,
            st_uid: PSEUDO_ID,
            st_gid: PSEUDO_ID,
            st_size,
            st_mtime,
        })
    }

    /// Same as [`stat`](Self::stat); there are no symlinks.
    pub async fn lstat(&self, path: &str) -> FsResult<PseudoStat> {
        self.stat(path).await
    }

    pub fn exists(&self, path: &str) -> bool {
        self.meta().exists(&split_path(path))
    }

    pub fn lexists(&self, path: &str) -> bool {
        self.exists(path)
    }

    pub fn is_file(&self, path: &str) -> bool {
        self.node(path).is_ok_and(|n| !n.is_dir)
    }

    pub fn is_dir(&self, path: &str) -> bool {
        self.meta().is_directory(&split_path(path))
    }

    pub async fn get_size(&self, path: &str) -> FsResult<u64> {
        Ok(self.bridge.size(path).await?)
    }

    pub async fn get_mtime(&self, path: &str) -> FsResult<i64> {
        Ok(self.bridge.modified(path).await?)
    }

    pub fn realpath(&self, path: &str) -> String {
        path.to_owned()
    }

    pub fn get_user_by_uid(&self, _uid: u32) -> &'static str {
        "owner"
    }

    pub fn get_group_by_gid(&self, _gid: u32) -> &'static str {
        "group"
    }

    /// Write the metadata snapshot, if one is configured.
    pub fn persist(&self) -> FsResult<()> {
        let Some(path) = self.snapshot.as_deref() else {
            debug!("No snapshot configured");
            return Ok(());
        };
        self.meta().save_snapshot(path)?;
        info!(path = %path.display(), "Persisted metadata");
        Ok(())
    }
}
