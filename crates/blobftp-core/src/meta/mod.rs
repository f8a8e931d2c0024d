//! The metadata arena.
//!
//! [`MetaStore`] holds every [`FileNode`] in a `HashMap` keyed by [`NodeId`]
//! plus a per-directory `BTreeMap<name, id>` child index, which gives
//! O(depth) path resolution and name-ordered listings. The whole tree sits
//! behind one `parking_lot::RwLock`, so every structural mutation is atomic
//! with respect to the checks that guard it.
//!
//! # Locking
//!
//! - Lookups take the shared tree lock for the duration of a single call.
//! - Mutations take the exclusive tree lock; get-or-create, emptiness checks
//!   and sibling-collision checks happen under the same guard as the write.
//! - Multi-step operations that await the backing store in between hold
//!   [`RowLocks`] on the affected nodes (see [`MetaStore::lock_rows`]).
//! - [`MetaStore::transaction`] hands out a [`MetaTxn`] for several field
//!   writes that must commit together.

mod locks;
mod snapshot;
mod txn;

pub use locks::{RowGuard, RowLocks};
pub use txn::MetaTxn;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, instrument, trace};

use crate::error::{MetaError, MetaResult, NodeKind};
use crate::path::{PathQuery, is_valid_name, join_path};

/// Capability letters granted to every node unless stated otherwise.
pub const DEFAULT_PERMISSION: &str = "elradfmw";

/// Identity of the implicit root directory.
pub const ROOT_ID: NodeId = NodeId(0);

/// Stable identity of a node for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Current time as seconds since the Unix epoch.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs() as i64)
}

/// One file or directory record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileNode {
    pub id: NodeId,
    pub name: String,
    pub is_dir: bool,
    pub parent: Option<NodeId>,
    /// Byte length. Zero on files means "not yet determined".
    pub size: u64,
    /// Seconds since the Unix epoch.
    pub mtime: i64,
    pub permission: String,
    pub links: u32,
}

impl FileNode {
    fn root() -> Self {
        Self {
            id: ROOT_ID,
            name: String::new(),
            is_dir: true,
            parent: None,
            size: 0,
            mtime: unix_now(),
            permission: DEFAULT_PERMISSION.to_owned(),
            links: 1,
        }
    }

    pub fn is_root(&self) -> bool {
        self.id == ROOT_ID
    }

    pub fn kind(&self) -> NodeKind {
        NodeKind::of(self.is_dir)
    }
}

/// Arena plus child index. Only ever touched through the store's lock.
#[derive(Debug)]
pub(crate) struct Tree {
    pub(crate) nodes: HashMap<NodeId, FileNode>,
    pub(crate) children: HashMap<NodeId, BTreeMap<String, NodeId>>,
    pub(crate) next_id: u64,
}

impl Tree {
    fn new() -> Self {
        let mut tree = Self {
            nodes: HashMap::new(),
            children: HashMap::new(),
            next_id: 1,
        };
        tree.nodes.insert(ROOT_ID, FileNode::root());
        tree.children.insert(ROOT_ID, BTreeMap::new());
        tree
    }

    /// Evaluate a root-anchored query. In children mode this returns the
    /// directory whose children are selected.
    fn evaluate(&self, query: &PathQuery) -> Option<NodeId> {
        let mut current = ROOT_ID;
        // Outermost filter first: it must hang directly off the root.
        for filter in query.filters().rev() {
            current = *self.children.get(&current)?.get(filter.name)?;
        }
        Some(current)
    }

    fn lookup<S: AsRef<str>>(&self, segments: &[S]) -> Option<NodeId> {
        self.evaluate(&PathQuery::node(segments))
    }

    fn path_of(&self, id: NodeId) -> String {
        let mut names = Vec::new();
        let mut current = self.nodes.get(&id);
        while let Some(node) = current {
            if node.is_root() {
                break;
            }
            names.push(node.name.as_str());
            current = node.parent.and_then(|p| self.nodes.get(&p));
        }
        names.reverse();
        join_path(&names)
    }

    fn touch(&mut self, id: NodeId, mtime: i64) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.mtime = mtime;
        }
    }

    fn insert(
        &mut self,
        parent: NodeId,
        name: &str,
        is_dir: bool,
        size: u64,
        permission: &str,
    ) -> MetaResult<FileNode> {
        let parent_path = self.path_of(parent);
        if !is_valid_name(name) {
            return Err(MetaError::invalid(
                format!("{}/{name}", parent_path.trim_end_matches('/')),
                "not a valid name",
            ));
        }
        let parent_node = self
            .nodes
            .get(&parent)
            .ok_or_else(|| MetaError::not_found(parent_path.clone()))?;
        if !parent_node.is_dir {
            return Err(MetaError::mismatch(parent_path, NodeKind::Directory));
        }
        let siblings = self.children.entry(parent).or_default();
        if siblings.contains_key(name) {
            return Err(MetaError::AlreadyExists {
                path: format!("{}/{name}", parent_path.trim_end_matches('/')),
            });
        }

        let id = NodeId(self.next_id);
        self.next_id += 1;
        let now = unix_now();
        let node = FileNode {
            id,
            name: name.to_owned(),
            is_dir,
            parent: Some(parent),
            size: if is_dir { 0 } else { size },
            mtime: now,
            permission: permission.to_owned(),
            links: 1,
        };
        siblings.insert(node.name.clone(), id);
        if is_dir {
            self.children.insert(id, BTreeMap::new());
        }
        self.nodes.insert(id, node.clone());
        self.touch(parent, now);
        trace!(id = %id, parent = %parent, name, is_dir, "Inserted node");
        Ok(node)
    }

    fn is_ancestor(&self, ancestor: NodeId, mut id: NodeId) -> bool {
        loop {
            if id == ancestor {
                return true;
            }
            match self.nodes.get(&id).and_then(|n| n.parent) {
                Some(parent) => id = parent,
                None => return false,
            }
        }
    }

    fn collect_descendants(&self, id: NodeId, prefix: &[String], out: &mut Vec<(Vec<String>, FileNode)>) {
        let Some(children) = self.children.get(&id) else {
            return;
        };
        for (name, child_id) in children {
            let Some(child) = self.nodes.get(child_id) else {
                continue;
            };
            let mut relative = prefix.to_vec();
            relative.push(name.clone());
            out.push((relative.clone(), child.clone()));
            if child.is_dir {
                self.collect_descendants(*child_id, &relative, out);
            }
        }
    }
}

/// Shared, thread-safe directory-tree metadata cache.
///
/// Wrap in `Arc` to share between the storage bridge, the filesystem
/// adapter and the upload protocol.
pub struct MetaStore {
    tree: RwLock<Tree>,
    rows: RowLocks,
}

impl Default for MetaStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MetaStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetaStore")
            .field("nodes", &self.len())
            .finish_non_exhaustive()
    }
}

impl MetaStore {
    /// Create a store containing only the root directory.
    pub fn new() -> Self {
        Self::from_tree(Tree::new())
    }

    pub(crate) fn from_tree(tree: Tree) -> Self {
        Self {
            tree: RwLock::new(tree),
            rows: RowLocks::new(),
        }
    }

    /// Number of nodes, root included.
    pub fn len(&self) -> usize {
        self.tree.read().nodes.len()
    }

    /// True when only the root exists.
    pub fn is_empty(&self) -> bool {
        self.len() <= 1
    }

    pub fn root(&self) -> FileNode {
        self.get(ROOT_ID).unwrap_or_else(FileNode::root)
    }

    pub fn get(&self, id: NodeId) -> Option<FileNode> {
        self.tree.read().nodes.get(&id).cloned()
    }

    /// Absolute path of a live node.
    pub fn path_of(&self, id: NodeId) -> Option<String> {
        let tree = self.tree.read();
        tree.nodes.contains_key(&id).then(|| tree.path_of(id))
    }

    /// Evaluate a lookup query, returning the matching node id.
    pub fn query(&self, query: &PathQuery) -> Option<NodeId> {
        self.tree.read().evaluate(query)
    }

    /// Resolve a path to its node. The empty sequence is the root.
    pub fn resolve<S: AsRef<str>>(&self, segments: &[S]) -> MetaResult<FileNode> {
        let tree = self.tree.read();
        tree.lookup(segments)
            .and_then(|id| tree.nodes.get(&id).cloned())
            .ok_or_else(|| MetaError::not_found(join_path(segments)))
    }

    pub fn exists<S: AsRef<str>>(&self, segments: &[S]) -> bool {
        self.tree.read().lookup(segments).is_some()
    }

    /// True only if the path resolves to a directory.
    pub fn is_directory<S: AsRef<str>>(&self, segments: &[S]) -> bool {
        let tree = self.tree.read();
        tree.lookup(segments)
            .and_then(|id| tree.nodes.get(&id))
            .is_some_and(|n| n.is_dir)
    }

    /// Direct children of a directory, ordered by name.
    pub fn list_children<S: AsRef<str>>(&self, segments: &[S]) -> MetaResult<Vec<FileNode>> {
        let query = PathQuery::children(segments);
        let tree = self.tree.read();
        let dir = tree
            .evaluate(&query)
            .ok_or_else(|| MetaError::not_found(join_path(segments)))?;
        let Some(children) = tree.children.get(&dir) else {
            return Err(MetaError::mismatch(join_path(segments), NodeKind::Directory));
        };
        Ok(children
            .values()
            .filter_map(|id| tree.nodes.get(id).cloned())
            .collect())
    }

    /// Make sure every directory along `segments` exists, creating missing
    /// levels root-to-leaf, and return the last one.
    ///
    /// Idempotent: calling it twice returns the same node. Each level is
    /// get-or-create under the exclusive lock, so concurrent callers never
    /// produce duplicate siblings.
    #[instrument(level = "debug", skip_all, fields(path = %join_path(segments)))]
    pub fn ensure_dir_chain<S: AsRef<str>>(&self, segments: &[S]) -> MetaResult<FileNode> {
        {
            let tree = self.tree.read();
            if let Some(node) = tree.lookup(segments).and_then(|id| tree.nodes.get(&id)) {
                if node.is_dir {
                    return Ok(node.clone());
                }
                return Err(MetaError::mismatch(join_path(segments), NodeKind::Directory));
            }
        }

        let mut tree = self.tree.write();
        let mut current = ROOT_ID;
        for (depth, segment) in segments.iter().enumerate() {
            let name = segment.as_ref();
            let existing = tree.children.get(&current).and_then(|c| c.get(name)).copied();
            current = match existing {
                Some(id) => {
                    if tree.nodes.get(&id).is_some_and(|n| !n.is_dir) {
                        return Err(MetaError::mismatch(
                            join_path(&segments[..=depth]),
                            NodeKind::Directory,
                        ));
                    }
                    id
                }
                None => {
                    let node = tree.insert(current, name, true, 0, DEFAULT_PERMISSION)?;
                    debug!(id = %node.id, path = %join_path(&segments[..=depth]), "Created directory");
                    node.id
                }
            };
        }
        tree.nodes
            .get(&current)
            .cloned()
            .ok_or_else(|| MetaError::not_found(join_path(segments)))
    }

    /// Create one node under `parent`.
    ///
    /// Fails with `AlreadyExists` on a sibling collision, `NotFound` if the
    /// parent is gone and `TypeMismatch` if the parent is a file.
    pub fn create_leaf(
        &self,
        parent: NodeId,
        name: &str,
        is_dir: bool,
        size: u64,
        permission: &str,
    ) -> MetaResult<FileNode> {
        self.tree.write().insert(parent, name, is_dir, size, permission)
    }

    /// Remove a node. Directories must be empty; the root is never removed.
    #[instrument(level = "debug", skip_all, fields(id = %id))]
    pub fn delete_node(&self, id: NodeId) -> MetaResult<FileNode> {
        let mut tree = self.tree.write();
        let path = tree.path_of(id);
        if id == ROOT_ID {
            return Err(MetaError::invalid(path, "the root directory cannot be removed"));
        }
        let Some(node) = tree.nodes.get(&id) else {
            return Err(MetaError::not_found(format!("#{id}")));
        };
        if tree.children.get(&id).is_some_and(|c| !c.is_empty()) {
            return Err(MetaError::HasChildren { path });
        }
        let parent = node.parent;
        let name = node.name.clone();
        if let Some(siblings) = parent.and_then(|p| tree.children.get_mut(&p)) {
            siblings.remove(&name);
        }
        tree.children.remove(&id);
        let removed = tree.nodes.remove(&id).ok_or_else(|| MetaError::not_found(path.clone()))?;
        drop(tree);
        self.rows.forget(id);
        debug!(path = %path, "Removed node");
        Ok(removed)
    }

    /// Persist a size learned from the backing store.
    pub fn set_size(&self, id: NodeId, size: u64) -> MetaResult<()> {
        let mut tree = self.tree.write();
        let node = tree
            .nodes
            .get_mut(&id)
            .ok_or_else(|| MetaError::not_found(format!("#{id}")))?;
        node.size = size;
        Ok(())
    }

    /// Move a node under `new_parent` with `new_name`, keeping its identity,
    /// size and mtime.
    ///
    /// Rejects moving the root, moving a directory into its own subtree and
    /// collisions with an existing sibling.
    #[instrument(level = "debug", skip_all, fields(id = %id, new_parent = %new_parent, new_name = %new_name))]
    pub fn reparent(&self, id: NodeId, new_parent: NodeId, new_name: &str) -> MetaResult<FileNode> {
        let mut tree = self.tree.write();
        let path = tree.path_of(id);
        if id == ROOT_ID {
            return Err(MetaError::invalid(path, "the root directory cannot be moved"));
        }
        let Some(node) = tree.nodes.get(&id) else {
            return Err(MetaError::not_found(format!("#{id}")));
        };
        let old_parent = node.parent.unwrap_or(ROOT_ID);
        let old_name = node.name.clone();
        let parent_path = tree.path_of(new_parent);
        let target = format!("{}/{new_name}", parent_path.trim_end_matches('/'));
        if !is_valid_name(new_name) {
            return Err(MetaError::invalid(target, "not a valid name"));
        }
        match tree.nodes.get(&new_parent) {
            None => return Err(MetaError::not_found(parent_path)),
            Some(p) if !p.is_dir => return Err(MetaError::mismatch(parent_path, NodeKind::Directory)),
            Some(_) => {}
        }
        if old_parent == new_parent && old_name == new_name {
            return Ok(node.clone());
        }
        if tree.is_ancestor(id, new_parent) {
            return Err(MetaError::invalid(target, "cannot move a directory into itself"));
        }
        if tree.children.get(&new_parent).is_some_and(|c| c.contains_key(new_name)) {
            return Err(MetaError::AlreadyExists { path: target });
        }

        if let Some(siblings) = tree.children.get_mut(&old_parent) {
            siblings.remove(&old_name);
        }
        tree.children
            .entry(new_parent)
            .or_default()
            .insert(new_name.to_owned(), id);
        tree.touch(new_parent, unix_now());
        let node = tree
            .nodes
            .get_mut(&id)
            .ok_or_else(|| MetaError::not_found(path.clone()))?;
        node.parent = Some(new_parent);
        node.name = new_name.to_owned();
        let moved = node.clone();
        debug!(from = %path, to = %target, "Re-parented node");
        Ok(moved)
    }

    /// Every node below `id`, depth-first in name order, with paths
    /// relative to `id`. Parents always precede their children.
    pub fn descendants(&self, id: NodeId) -> MetaResult<Vec<(Vec<String>, FileNode)>> {
        let tree = self.tree.read();
        if !tree.nodes.contains_key(&id) {
            return Err(MetaError::not_found(format!("#{id}")));
        }
        let mut out = Vec::new();
        tree.collect_descendants(id, &[], &mut out);
        Ok(out)
    }

    /// Start a transaction holding the exclusive tree lock.
    ///
    /// Do not hold the returned guard across an `.await`.
    pub fn transaction(&self) -> MetaTxn<'_> {
        MetaTxn::new(self.tree.write())
    }

    pub fn rows(&self) -> &RowLocks {
        &self.rows
    }

    /// Acquire row locks for `ids` in ascending order.
    pub async fn lock_rows(&self, ids: &[NodeId]) -> RowGuard {
        self.rows.lock_many(ids).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(paths: &[&str]) -> MetaStore {
        let store = MetaStore::new();
        for path in paths {
            let segments = crate::split_path(path);
            let (name, parents) = segments.split_last().expect("non-root path");
            let parent = store.ensure_dir_chain(parents).expect("parent chain");
            store
                .create_leaf(parent.id, name, false, 10, DEFAULT_PERMISSION)
                .expect("create leaf");
        }
        store
    }

    #[test]
    fn test_root_resolves_to_empty_sequence() {
        let store = MetaStore::new();
        let root = store.resolve::<&str>(&[]).unwrap();
        assert!(root.is_root());
        assert!(root.is_dir);
        assert!(store.is_empty());
    }

    #[test]
    fn test_ensure_dir_chain_is_idempotent() {
        let store = MetaStore::new();
        let first = store.ensure_dir_chain(&["a", "b", "c"]).unwrap();
        let second = store.ensure_dir_chain(&["a", "b", "c"]).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(store.len(), 4);
    }

    #[test]
    fn test_ensure_dir_chain_through_file_fails() {
        let store = store_with(&["/a/file.txt"]);
        let err = store.ensure_dir_chain(&["a", "file.txt", "x"]).unwrap_err();
        assert!(matches!(err, MetaError::TypeMismatch { .. }));
    }

    #[test]
    fn test_lookup_is_root_anchored() {
        let store = store_with(&["/a/b/c.txt"]);
        assert!(store.exists(&["a", "b", "c.txt"]));
        assert!(!store.exists(&["b", "c.txt"]));
        assert!(!store.exists(&["c.txt"]));
    }

    #[test]
    fn test_list_children_is_name_ordered() {
        let store = store_with(&["/d/zeta", "/d/alpha", "/d/mid"]);
        let names: Vec<_> = store
            .list_children(&["d"])
            .unwrap()
            .into_iter()
            .map(|n| n.name)
            .collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn test_list_children_of_file_is_mismatch() {
        let store = store_with(&["/f.txt"]);
        let err = store.list_children(&["f.txt"]).unwrap_err();
        assert!(matches!(err, MetaError::TypeMismatch { .. }));
        assert!(store.list_children(&["nope"]).unwrap_err().is_not_found());
    }

    #[test]
    fn test_create_leaf_collisions_and_bad_parents() {
        let store = store_with(&["/a/f.txt"]);
        let a = store.resolve(&["a"]).unwrap();
        let f = store.resolve(&["a", "f.txt"]).unwrap();

        let dup = store.create_leaf(a.id, "f.txt", false, 0, DEFAULT_PERMISSION);
        assert!(matches!(dup, Err(MetaError::AlreadyExists { .. })));

        let under_file = store.create_leaf(f.id, "x", false, 0, DEFAULT_PERMISSION);
        assert!(matches!(under_file, Err(MetaError::TypeMismatch { .. })));

        let missing = store.create_leaf(NodeId(999), "x", false, 0, DEFAULT_PERMISSION);
        assert!(matches!(missing, Err(MetaError::NotFound { .. })));

        let bad = store.create_leaf(a.id, "x/y", false, 0, DEFAULT_PERMISSION);
        assert!(matches!(bad, Err(MetaError::InvalidPath { .. })));
    }

    #[test]
    fn test_delete_requires_empty_directory() {
        let store = store_with(&["/a/f.txt"]);
        let a = store.resolve(&["a"]).unwrap();
        let err = store.delete_node(a.id).unwrap_err();
        assert!(matches!(err, MetaError::HasChildren { .. }));
        assert!(store.exists(&["a", "f.txt"]));

        let f = store.resolve(&["a", "f.txt"]).unwrap();
        store.delete_node(f.id).unwrap();
        store.delete_node(a.id).unwrap();
        assert!(!store.exists(&["a"]));
    }

    #[test]
    fn test_root_cannot_be_deleted() {
        let store = MetaStore::new();
        assert!(matches!(
            store.delete_node(ROOT_ID),
            Err(MetaError::InvalidPath { .. })
        ));
    }

    #[test]
    fn test_reparent_keeps_identity_and_size() {
        let store = store_with(&["/a/b/c.txt"]);
        let c = store.resolve(&["a", "b", "c.txt"]).unwrap();
        let x = store.ensure_dir_chain(&["a", "x"]).unwrap();
        let moved = store.reparent(c.id, x.id, "c.txt").unwrap();
        assert_eq!(moved.id, c.id);
        assert_eq!(moved.size, 10);
        assert_eq!(moved.parent, Some(x.id));
        assert!(!store.exists(&["a", "b", "c.txt"]));
        assert_eq!(store.path_of(c.id).as_deref(), Some("/a/x/c.txt"));
    }

    #[test]
    fn test_reparent_into_own_subtree_is_rejected() {
        let store = MetaStore::new();
        let a = store.ensure_dir_chain(&["a"]).unwrap();
        let inner = store.ensure_dir_chain(&["a", "b"]).unwrap();
        let err = store.reparent(a.id, inner.id, "a").unwrap_err();
        assert!(matches!(err, MetaError::InvalidPath { .. }));
    }

    #[test]
    fn test_descendants_parents_first() {
        let store = store_with(&["/src/f1", "/src/sub/f2"]);
        let src = store.resolve(&["src"]).unwrap();
        let paths: Vec<_> = store
            .descendants(src.id)
            .unwrap()
            .into_iter()
            .map(|(rel, _)| rel.join("/"))
            .collect();
        assert_eq!(paths, vec!["f1", "sub", "sub/f2"]);
    }

    #[test]
    fn test_child_insert_bumps_parent_mtime() {
        let store = MetaStore::new();
        let dir = store.ensure_dir_chain(&["d"]).unwrap();
        {
            let mut txn = store.transaction();
            txn.set_mtime(dir.id, 5).unwrap();
            txn.commit();
        }
        store
            .create_leaf(dir.id, "f", false, 0, DEFAULT_PERMISSION)
            .unwrap();
        assert!(store.get(dir.id).unwrap().mtime > 5);
    }
}
