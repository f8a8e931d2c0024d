//! Upload completion protocol.
//!
//! An FTP `STOR` creates its metadata record before any byte arrives so
//! the file shows up in listings (as zero-length) while the transfer runs.
//! The record then either commits or disappears:
//!
//! ```text
//! start ──► Pending ──complete──► Committed   size/mtime set, parent links+1
//!              │
//!              ├──abort─────────► RolledBack  record removed
//!              └──drop──────────► RolledBack  (cancelled transfer)
//! ```
//!
//! Completion holds row locks on the file and its parent and writes both
//! through a single [`MetaTxn`](blobftp_core::MetaTxn), so a concurrent
//! reader sees either none or all of the commit.

use blobftp_core::{
    DEFAULT_PERMISSION, FileNode, MetaError, MetaStore, NodeId, NodeKind, join_path, split_path,
    unix_now,
};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::error::{FsError, FsResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Pending,
    Committed,
    RolledBack,
}

/// Why a transfer did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// The transfer raised an error.
    Failed,
    /// The client closed the data connection early.
    Incomplete,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::Failed => f.write_str("failed"),
            AbortReason::Incomplete => f.write_str("incomplete"),
        }
    }
}

/// An in-flight upload.
///
/// Dropping a ticket that is still pending rolls the upload back.
#[derive(Debug)]
#[must_use = "dropping an upload ticket rolls the upload back"]
pub struct UploadTicket {
    meta: Arc<MetaStore>,
    node: NodeId,
    parent: NodeId,
    path: String,
    state: UploadState,
}

impl UploadTicket {
    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn state(&self) -> UploadState {
        self.state
    }

    fn mark_committed(&mut self) {
        self.state = UploadState::Committed;
    }

    /// Remove the file record, reused or not.
    fn roll_back(&mut self) {
        self.state = UploadState::RolledBack;
        match self.meta.delete_node(self.node) {
            Ok(_) => debug!(path = %self.path, "Removed upload placeholder"),
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(path = %self.path, error = %e, "Could not remove upload placeholder"),
        }
    }
}

impl Drop for UploadTicket {
    fn drop(&mut self) {
        if self.state == UploadState::Pending {
            warn!(path = %self.path, "Upload ticket dropped while pending, rolling back");
            self.roll_back();
        }
    }
}

/// Runs the start / complete / abort sequence against the metadata cache.
#[derive(Debug, Clone)]
pub struct UploadCoordinator {
    meta: Arc<MetaStore>,
}

impl UploadCoordinator {
    pub fn new(meta: Arc<MetaStore>) -> Self {
        Self { meta }
    }

    /// Register the upload target: materialize its ancestors, then get or
    /// create the file record (size 0, current time).
    ///
    /// An existing file is reused so an upload can overwrite it; an
    /// existing directory is a `TypeMismatch`.
    #[instrument(level = "debug", skip(self), fields(path = %path))]
    pub fn start(&self, path: &str) -> FsResult<UploadTicket> {
        let segments = split_path(path);
        let Some((name, parents)) = segments.split_last() else {
            return Err(FsError::InvalidPath {
                path: "/".into(),
                reason: "cannot upload to the root directory",
            });
        };
        let parent = self.meta.ensure_dir_chain(parents)?;

        let (node, reused) = match self.meta.resolve(&segments) {
            Ok(existing) => (existing, true),
            Err(e) if e.is_not_found() => {
                match self
                    .meta
                    .create_leaf(parent.id, name, false, 0, DEFAULT_PERMISSION)
                {
                    Ok(created) => (created, false),
                    // Lost a race with another start on the same path.
                    Err(MetaError::AlreadyExists { .. }) => (self.meta.resolve(&segments)?, true),
                    Err(e) => return Err(e.into()),
                }
            }
            Err(e) => return Err(e.into()),
        };
        if node.is_dir {
            return Err(FsError::TypeMismatch {
                path: join_path(&segments),
                expected: NodeKind::File,
            });
        }

        debug!(id = %node.id, reused, "Upload started");
        Ok(UploadTicket {
            meta: Arc::clone(&self.meta),
            node: node.id,
            parent: parent.id,
            path: join_path(&segments),
            state: UploadState::Pending,
        })
    }

    /// Commit a finished transfer of `bytes_written` bytes.
    ///
    /// Sets the file's size and mtime and bumps the parent's link count and
    /// mtime, all or nothing. If the record vanished in the meantime this
    /// fails with `NotFound` and changes nothing.
    #[instrument(level = "debug", skip(self, ticket), fields(path = %ticket.path))]
    pub async fn complete(&self, mut ticket: UploadTicket, bytes_written: u64) -> FsResult<FileNode> {
        let _rows = self.meta.lock_rows(&[ticket.node, ticket.parent]).await;

        let committed = {
            let now = unix_now();
            let mut txn = self.meta.transaction();
            txn.set_size(ticket.node, bytes_written)?;
            txn.set_mtime(ticket.node, now)?;
            let links = txn.bump_links(ticket.parent)?;
            txn.set_mtime(ticket.parent, now)?;
            let node = txn
                .get(ticket.node)
                .cloned()
                .ok_or_else(|| FsError::NotFound(ticket.path.clone()))?;
            txn.commit();
            debug!(parent_links = links, "Committed upload metadata");
            node
        };

        ticket.mark_committed();
        info!(size = bytes_written, "Upload complete");
        Ok(committed)
    }

    /// Roll back a transfer that failed or ended early.
    #[instrument(level = "debug", skip(self, ticket), fields(path = %ticket.path, reason = %reason))]
    pub async fn abort(&self, mut ticket: UploadTicket, reason: AbortReason) {
        let _row = self.meta.lock_rows(&[ticket.node]).await;
        ticket.roll_back();
        info!("Upload aborted");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator() -> UploadCoordinator {
        UploadCoordinator::new(Arc::new(MetaStore::new()))
    }

    #[tokio::test]
    async fn test_pending_upload_is_visible_as_empty_file() {
        let uploads = coordinator();
        let ticket = uploads.start("/in/progress.bin").unwrap();
        let node = uploads.meta.resolve(&["in", "progress.bin"]).unwrap();
        assert_eq!(node.size, 0);
        assert!(!node.is_dir);
        assert_eq!(ticket.state(), UploadState::Pending);
        uploads.abort(ticket, AbortReason::Incomplete).await;
    }

    #[tokio::test]
    async fn test_dropped_ticket_rolls_back() {
        let uploads = coordinator();
        {
            let _ticket = uploads.start("/cancelled.txt").unwrap();
        }
        assert!(!uploads.meta.exists(&["cancelled.txt"]));
    }

    #[tokio::test]
    async fn test_start_on_directory_is_mismatch() {
        let uploads = coordinator();
        uploads.meta.ensure_dir_chain(&["dir"]).unwrap();
        let err = uploads.start("/dir").unwrap_err();
        assert!(matches!(err, FsError::TypeMismatch { .. }));
        assert!(uploads.meta.is_directory(&["dir"]));
    }

    #[tokio::test]
    async fn test_start_on_root_is_invalid() {
        let uploads = coordinator();
        assert!(matches!(
            uploads.start("/"),
            Err(FsError::InvalidPath { .. })
        ));
    }

    #[tokio::test]
    async fn test_abort_removes_reused_record() {
        let uploads = coordinator();
        let first = uploads.start("/f.txt").unwrap();
        let committed = uploads.complete(first, 10).await.unwrap();

        let second = uploads.start("/f.txt").unwrap();
        assert_eq!(second.node(), committed.id);
        uploads.abort(second, AbortReason::Failed).await;

        assert!(!uploads.meta.exists(&["f.txt"]));
    }

    #[tokio::test]
    async fn test_complete_after_record_vanished() {
        let uploads = coordinator();
        let ticket = uploads.start("/d/gone.txt").unwrap();
        let parent = uploads.meta.resolve(&["d"]).unwrap();
        uploads.meta.delete_node(ticket.node()).unwrap();

        let err = uploads.complete(ticket, 5).await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(uploads.meta.get(parent.id).unwrap().links, parent.links);
    }
}
