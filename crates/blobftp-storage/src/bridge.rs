//! Reconciles metadata-cache operations with the backing store.
//!
//! The cache is the source of truth for structure; the backend holds bytes.
//! Each operation here performs the physical step (if any) and the cache
//! step in a fixed order, under row locks on the nodes it touches.
//!
//! # Layouts
//!
//! - [`DirectoryLayout::Native`]: directory operations go to the backend
//!   first and their failures propagate, leaving the cache untouched.
//! - [`DirectoryLayout::Prefix`]: directories exist only in the cache.
//!   Renames copy and delete every object individually; physical failures
//!   are logged and the cache is updated regardless, so the tree stays
//!   consistent with what clients were told.
//!
//! # Error policy
//!
//! Failures in a *primary* backend call (read, write, delete of a file,
//! native directory operations) propagate as [`BridgeError::Backend`](crate::BridgeError::Backend).
//! Failures in *secondary* reconciliation (object moves behind a prefix
//! rename, stray-object cleanup in `rmdir`, lazy size and mtime lookups)
//! are logged with `warn!` and swallowed.

use blobftp_core::{
    FileNode, MetaError, MetaStore, NodeKind, ROOT_ID, join_path, object_key, split_path,
};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::backend::{DirectoryLayout, ObjectBackend, ObjectReader};
use crate::error::BridgeResult;

pub struct StorageBridge {
    backend: Arc<dyn ObjectBackend>,
    meta: Arc<MetaStore>,
    layout: DirectoryLayout,
}

impl std::fmt::Debug for StorageBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageBridge")
            .field("backend", &self.backend.name())
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

fn split_last(segments: &[String]) -> BridgeResult<(&[String], &str)> {
    match segments.split_last() {
        Some((name, parents)) => Ok((parents, name.as_str())),
        None => Err(MetaError::InvalidPath {
            path: "/".into(),
            reason: "operation not permitted on the root directory",
        }
        .into()),
    }
}

impl StorageBridge {
    /// Create a bridge with an explicit layout strategy.
    pub fn new(backend: Arc<dyn ObjectBackend>, meta: Arc<MetaStore>, layout: DirectoryLayout) -> Self {
        info!(backend = backend.name(), layout = %layout, "Storage bridge ready");
        Self {
            backend,
            meta,
            layout,
        }
    }

    /// Create a bridge using the layout the backend advertises.
    pub fn for_backend(backend: Arc<dyn ObjectBackend>, meta: Arc<MetaStore>) -> Self {
        let layout = backend.layout();
        Self::new(backend, meta, layout)
    }

    pub fn layout(&self) -> DirectoryLayout {
        self.layout
    }

    pub fn meta(&self) -> &Arc<MetaStore> {
        &self.meta
    }

    pub fn backend(&self) -> &Arc<dyn ObjectBackend> {
        &self.backend
    }

    fn resolve(&self, path: &str) -> BridgeResult<(Vec<String>, FileNode)> {
        let segments = split_path(path);
        let node = self.meta.resolve(&segments)?;
        Ok((segments, node))
    }

    /// Create a directory and any missing ancestors. Idempotent.
    #[instrument(level = "debug", skip(self), fields(path = %path))]
    pub async fn mkdir(&self, path: &str) -> BridgeResult<FileNode> {
        let segments = split_path(path);
        if let Ok(existing) = self.meta.resolve(&segments) {
            if existing.is_dir {
                return Ok(existing);
            }
            return Err(MetaError::TypeMismatch {
                path: join_path(&segments),
                expected: NodeKind::Directory,
            }
            .into());
        }
        if self.layout == DirectoryLayout::Native {
            self.backend.mkdir(&object_key(&segments)).await?;
        }
        let node = self.meta.ensure_dir_chain(&segments)?;
        debug!(id = %node.id, "Directory ready");
        Ok(node)
    }

    /// Remove an empty directory.
    #[instrument(level = "debug", skip(self), fields(path = %path))]
    pub async fn rmdir(&self, path: &str) -> BridgeResult<()> {
        let (segments, node) = self.resolve(path)?;
        if !node.is_dir {
            return Err(MetaError::TypeMismatch {
                path: join_path(&segments),
                expected: NodeKind::Directory,
            }
            .into());
        }
        if node.id == ROOT_ID {
            split_last(&segments)?;
        }
        let _dir_guard = self.meta.lock_rows(&[node.id]).await;
        if !self.meta.list_children(&segments)?.is_empty() {
            return Err(MetaError::HasChildren {
                path: join_path(&segments),
            }
            .into());
        }

        let key = object_key(&segments);
        match self.layout {
            DirectoryLayout::Native => match self.backend.rmdir(&key).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => debug!(key, "Directory was never materialized"),
                Err(e) => return Err(e.into()),
            },
            DirectoryLayout::Prefix => self.remove_stray_objects(&key).await,
        }

        // Re-checks emptiness atomically; a child created meanwhile wins.
        self.meta.delete_node(node.id)?;
        info!(path = %join_path(&segments), "Removed directory");
        Ok(())
    }

    /// Delete objects sitting directly under a prefix directory that the
    /// cache does not know about.
    async fn remove_stray_objects(&self, key: &str) {
        let prefix = format!("{key}/");
        let keys = match self.backend.list_prefix(&prefix).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(prefix, error = %e, "Could not list directory objects");
                return;
            }
        };
        for object in keys {
            let direct = object
                .strip_prefix(prefix.as_str())
                .is_some_and(|rest| !rest.is_empty() && !rest.contains('/'));
            if !direct {
                continue;
            }
            if let Err(e) = self.backend.delete(&object).await {
                warn!(key = %object, error = %e, "Could not delete directory object");
            }
        }
    }

    /// Delete a file: the backend object first, then its record.
    #[instrument(level = "debug", skip(self), fields(path = %path))]
    pub async fn delete(&self, path: &str) -> BridgeResult<()> {
        let (segments, node) = self.resolve(path)?;
        if node.is_dir {
            return Err(MetaError::TypeMismatch {
                path: join_path(&segments),
                expected: NodeKind::File,
            }
            .into());
        }
        let _file_guard = self.meta.lock_rows(&[node.id]).await;
        match self.backend.delete(&object_key(&segments)).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => debug!("Object already absent"),
            Err(e) => return Err(e.into()),
        }
        self.meta.delete_node(node.id)?;
        info!(path = %join_path(&segments), "Deleted file");
        Ok(())
    }

    /// Rename or move `src` to `dst`, creating missing destination
    /// ancestors. An existing destination file is replaced; an existing
    /// destination directory is an error.
    #[instrument(level = "debug", skip(self), fields(src = %src, dst = %dst))]
    pub async fn rename(&self, src: &str, dst: &str) -> BridgeResult<FileNode> {
        let (src_segments, source) = self.resolve(src)?;
        split_last(&src_segments)?;
        let dst_segments = split_path(dst);
        let (dst_parents, dst_name) = split_last(&dst_segments)?;

        if src_segments == dst_segments {
            return Ok(source);
        }
        if source.is_dir && dst_segments.starts_with(&src_segments) {
            return Err(MetaError::InvalidPath {
                path: join_path(&dst_segments),
                reason: "cannot move a directory into itself",
            }
            .into());
        }

        let replaced = match self.meta.resolve(&dst_segments) {
            Ok(existing) if existing.is_dir || source.is_dir => {
                return Err(MetaError::AlreadyExists {
                    path: join_path(&dst_segments),
                }
                .into());
            }
            Ok(existing) => Some(existing),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e.into()),
        };

        let mut rows = vec![source.id];
        rows.extend(replaced.as_ref().map(|n| n.id));
        let _guard = self.meta.lock_rows(&rows).await;

        let src_key = object_key(&src_segments);
        let dst_key = object_key(&dst_segments);

        if self.layout == DirectoryLayout::Prefix && source.is_dir {
            return self.move_prefix_directory(&source, &dst_segments).await;
        }

        // A destination chain blocked by a file must fail before any object moves.
        let parent = self.meta.ensure_dir_chain(dst_parents)?;
        if self.layout == DirectoryLayout::Native {
            self.backend.rename(&src_key, &dst_key).await?;
        } else {
            self.move_object(&src_key, &dst_key).await;
        }

        if let Some(replaced) = replaced {
            self.meta.delete_node(replaced.id)?;
        }
        let moved = self.meta.reparent(source.id, parent.id, dst_name)?;
        info!(from = %join_path(&src_segments), to = %join_path(&dst_segments), "Renamed");
        Ok(moved)
    }

    /// Copy then delete one object; failures are logged, never returned.
    async fn move_object(&self, src_key: &str, dst_key: &str) {
        if let Err(e) = self.backend.copy(src_key, dst_key).await {
            warn!(src = src_key, dst = dst_key, error = %e, "Object copy failed");
            return;
        }
        if let Err(e) = self.backend.delete(src_key).await {
            warn!(key = src_key, error = %e, "Could not delete moved object");
        }
    }

    /// Move every file under a prefix directory one by one, then drop the
    /// emptied source directories bottom-up.
    async fn move_prefix_directory(
        &self,
        source: &FileNode,
        dst_segments: &[String],
    ) -> BridgeResult<FileNode> {
        let src_path = self
            .meta
            .path_of(source.id)
            .ok_or_else(|| MetaError::NotFound {
                path: format!("#{}", source.id),
            })?;
        let src_segments = split_path(&src_path);
        let target = self.meta.ensure_dir_chain(dst_segments)?;

        let entries = self.meta.descendants(source.id)?;
        let mut moved_files = 0usize;
        for (relative, node) in &entries {
            let mut dst = dst_segments.to_vec();
            dst.extend(relative.iter().cloned());
            if node.is_dir {
                self.meta.ensure_dir_chain(&dst)?;
                continue;
            }
            let mut src = src_segments.clone();
            src.extend(relative.iter().cloned());
            self.move_object(&object_key(&src), &object_key(&dst)).await;

            let (parents, name) = split_last(&dst)?;
            let parent = self.meta.ensure_dir_chain(parents)?;
            if let Ok(existing) = self.meta.resolve(&dst) {
                if existing.is_dir {
                    return Err(MetaError::AlreadyExists {
                        path: join_path(&dst),
                    }
                    .into());
                }
                self.meta.delete_node(existing.id)?;
            }
            self.meta.reparent(node.id, parent.id, name)?;
            moved_files += 1;
        }

        // Parents precede children in `entries`, so reverse order empties
        // the deepest directories first.
        for (_, node) in entries.iter().rev().filter(|(_, n)| n.is_dir) {
            self.meta.delete_node(node.id)?;
        }
        self.meta.delete_node(source.id)?;

        info!(
            from = %src_path,
            to = %join_path(dst_segments),
            files = moved_files,
            "Moved directory"
        );
        Ok(target)
    }

    /// Size in bytes, fetched from the backend the first time and cached.
    #[instrument(level = "debug", skip(self), fields(path = %path))]
    pub async fn size(&self, path: &str) -> BridgeResult<u64> {
        let (segments, node) = self.resolve(path)?;
        if node.is_dir {
            return Ok(0);
        }
        if node.size != 0 {
            return Ok(node.size);
        }
        match self.backend.size(&object_key(&segments)).await {
            Ok(size) => {
                self.meta.set_size(node.id, size)?;
                Ok(size)
            }
            Err(e) => {
                warn!(error = %e, "Size lookup failed, using cached value");
                Ok(node.size)
            }
        }
    }

    /// Modification time in seconds since the epoch.
    ///
    /// Directories on a prefix store have no timestamp and report 0.
    #[instrument(level = "debug", skip(self), fields(path = %path))]
    pub async fn modified(&self, path: &str) -> BridgeResult<i64> {
        let (segments, node) = self.resolve(path)?;
        if !node.is_dir {
            return Ok(node.mtime);
        }
        match self.layout {
            DirectoryLayout::Prefix => Ok(0),
            DirectoryLayout::Native => match self.backend.modified(&object_key(&segments)).await {
                Ok(mtime) => Ok(mtime),
                Err(e) => {
                    warn!(error = %e, "Directory mtime lookup failed, using cached value");
                    Ok(node.mtime)
                }
            },
        }
    }

    /// Open a file's content for reading.
    #[instrument(level = "debug", skip(self), fields(path = %path))]
    pub async fn open_read(&self, path: &str) -> BridgeResult<ObjectReader> {
        let (segments, node) = self.resolve(path)?;
        if node.is_dir {
            return Err(MetaError::TypeMismatch {
                path: join_path(&segments),
                expected: NodeKind::File,
            }
            .into());
        }
        Ok(self.backend.get(&object_key(&segments)).await?)
    }

    /// Stream bytes into the backend object for `path`. Metadata is left
    /// to the upload protocol.
    #[instrument(level = "debug", skip(self, reader), fields(path = %path))]
    pub async fn write(&self, path: &str, reader: ObjectReader) -> BridgeResult<u64> {
        let segments = split_path(path);
        split_last(&segments)?;
        let written = self.backend.put(&object_key(&segments), reader).await?;
        debug!(written, "Wrote object");
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::error::{BackendError, BridgeError};
    use blobftp_core::DEFAULT_PERMISSION;

    fn prefix_bridge() -> (Arc<MemoryBackend>, StorageBridge) {
        let backend = Arc::new(MemoryBackend::new());
        let meta = Arc::new(MetaStore::new());
        let bridge = StorageBridge::for_backend(backend.clone(), meta);
        (backend, bridge)
    }

    fn add_file(bridge: &StorageBridge, backend: &MemoryBackend, path: &str, data: &[u8]) {
        let segments = split_path(path);
        let (name, parents) = segments.split_last().unwrap();
        let parent = bridge.meta().ensure_dir_chain(parents).unwrap();
        bridge
            .meta()
            .create_leaf(parent.id, name, false, data.len() as u64, DEFAULT_PERMISSION)
            .unwrap();
        backend.insert(object_key(&segments), data.to_vec());
    }

    #[tokio::test]
    async fn test_prefix_mkdir_is_cache_only() {
        let (backend, bridge) = prefix_bridge();
        let first = bridge.mkdir("/a/b").await.unwrap();
        let second = bridge.mkdir("/a/b/").await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn test_rmdir_non_empty_fails() {
        let (backend, bridge) = prefix_bridge();
        add_file(&bridge, &backend, "/d/f.txt", b"x");
        let err = bridge.rmdir("/d").await.unwrap_err();
        assert!(matches!(err, BridgeError::Meta(MetaError::HasChildren { .. })));
        assert!(bridge.meta().exists(&["d"]));
    }

    #[tokio::test]
    async fn test_rmdir_removes_stray_objects() {
        let (backend, bridge) = prefix_bridge();
        bridge.mkdir("/d").await.unwrap();
        backend.insert("d/orphan", "x");
        backend.insert("d/deep/keep", "x");
        bridge.rmdir("/d").await.unwrap();
        assert!(!bridge.meta().exists(&["d"]));
        assert_eq!(backend.keys(), vec!["d/deep/keep"]);
    }

    #[tokio::test]
    async fn test_rmdir_root_refused() {
        let (_backend, bridge) = prefix_bridge();
        let err = bridge.rmdir("/").await.unwrap_err();
        assert!(matches!(err, BridgeError::Meta(MetaError::InvalidPath { .. })));
    }

    #[tokio::test]
    async fn test_delete_propagates_outage() {
        let (backend, bridge) = prefix_bridge();
        add_file(&bridge, &backend, "/f.txt", b"x");
        backend.set_available(false);
        let err = bridge.delete("/f.txt").await.unwrap_err();
        assert!(matches!(err, BridgeError::Backend(BackendError::Unavailable(_))));
        assert!(bridge.meta().exists(&["f.txt"]));

        backend.set_available(true);
        bridge.delete("/f.txt").await.unwrap();
        assert!(!bridge.meta().exists(&["f.txt"]));
        assert!(backend.keys().is_empty());
    }

    #[tokio::test]
    async fn test_delete_tolerates_missing_object() {
        let (_backend, bridge) = prefix_bridge();
        let root = bridge.meta().root();
        bridge
            .meta()
            .create_leaf(root.id, "ghost", false, 0, DEFAULT_PERMISSION)
            .unwrap();
        bridge.delete("/ghost").await.unwrap();
        assert!(!bridge.meta().exists(&["ghost"]));
    }

    #[tokio::test]
    async fn test_rename_replaces_existing_file() {
        let (backend, bridge) = prefix_bridge();
        add_file(&bridge, &backend, "/a.txt", b"new");
        add_file(&bridge, &backend, "/b.txt", b"old-content");
        let moved = bridge.rename("/a.txt", "/b.txt").await.unwrap();
        assert_eq!(moved.size, 3);
        assert_eq!(bridge.meta().list_children::<&str>(&[]).unwrap().len(), 1);
        assert_eq!(backend.contents("b.txt").unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_rename_onto_directory_fails() {
        let (backend, bridge) = prefix_bridge();
        add_file(&bridge, &backend, "/a.txt", b"x");
        bridge.mkdir("/d").await.unwrap();
        let err = bridge.rename("/a.txt", "/d").await.unwrap_err();
        assert!(matches!(err, BridgeError::Meta(MetaError::AlreadyExists { .. })));
    }

    #[tokio::test]
    async fn test_rename_root_and_into_self_refused() {
        let (_backend, bridge) = prefix_bridge();
        bridge.mkdir("/a").await.unwrap();
        assert!(matches!(
            bridge.rename("/", "/x").await,
            Err(BridgeError::Meta(MetaError::InvalidPath { .. }))
        ));
        assert!(matches!(
            bridge.rename("/a", "/a/b").await,
            Err(BridgeError::Meta(MetaError::InvalidPath { .. }))
        ));
    }

    #[tokio::test]
    async fn test_modified_on_prefix_directory_is_zero() {
        let (backend, bridge) = prefix_bridge();
        add_file(&bridge, &backend, "/d/f", b"x");
        assert_eq!(bridge.modified("/d").await.unwrap(), 0);
        assert!(bridge.modified("/d/f").await.unwrap() > 0);
    }

    #[tokio::test]
    async fn test_open_read_directory_is_mismatch() {
        let (_backend, bridge) = prefix_bridge();
        bridge.mkdir("/d").await.unwrap();
        let err = bridge.open_read("/d").await.err().unwrap();
        assert!(matches!(err, BridgeError::Meta(MetaError::TypeMismatch { .. })));
    }
}
