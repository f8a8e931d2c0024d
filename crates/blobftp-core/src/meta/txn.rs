//! Scoped metadata transactions.

use parking_lot::RwLockWriteGuard;
use std::collections::HashMap;
use tracing::trace;

use super::{FileNode, NodeId, Tree};
use crate::error::{MetaError, MetaResult};

/// A set of field writes that commit together or not at all.
///
/// The transaction owns the exclusive tree lock. Each write records the
/// row's prior state the first time that row is touched; dropping the
/// transaction without [`commit`](Self::commit) restores every touched
/// row, so early returns and `?` roll back automatically.
///
/// Only non-structural fields (size, mtime, links) are writable here.
/// Structural changes go through [`MetaStore`](super::MetaStore) methods.
pub struct MetaTxn<'a> {
    tree: RwLockWriteGuard<'a, Tree>,
    undo: HashMap<NodeId, FileNode>,
    committed: bool,
}

impl<'a> MetaTxn<'a> {
    pub(super) fn new(tree: RwLockWriteGuard<'a, Tree>) -> Self {
        Self {
            tree,
            undo: HashMap::new(),
            committed: false,
        }
    }

    pub fn get(&self, id: NodeId) -> Option<&FileNode> {
        self.tree.nodes.get(&id)
    }

    fn row(&mut self, id: NodeId) -> MetaResult<&mut FileNode> {
        let node = self
            .tree
            .nodes
            .get_mut(&id)
            .ok_or_else(|| MetaError::not_found(format!("#{id}")))?;
        self.undo.entry(id).or_insert_with(|| node.clone());
        Ok(node)
    }

    pub fn set_size(&mut self, id: NodeId, size: u64) -> MetaResult<()> {
        self.row(id)?.size = size;
        Ok(())
    }

    pub fn set_mtime(&mut self, id: NodeId, mtime: i64) -> MetaResult<()> {
        self.row(id)?.mtime = mtime;
        Ok(())
    }

    /// Increment a node's link count, returning the new value.
    pub fn bump_links(&mut self, id: NodeId) -> MetaResult<u32> {
        let node = self.row(id)?;
        node.links = node.links.saturating_add(1);
        Ok(node.links)
    }

    /// Keep every write made through this transaction.
    pub fn commit(mut self) {
        self.committed = true;
        trace!(rows = self.undo.len(), "Committed metadata transaction");
    }
}

impl Drop for MetaTxn<'_> {
    fn drop(&mut self) {
        if self.committed || self.undo.is_empty() {
            return;
        }
        trace!(rows = self.undo.len(), "Rolling back metadata transaction");
        for (id, original) in self.undo.drain() {
            // Rows cannot disappear while the exclusive lock is held.
            if let Some(node) = self.tree.nodes.get_mut(&id) {
                *node = original;
            }
        }
    }
}
