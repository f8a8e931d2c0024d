//! JSON snapshots of the metadata arena.
//!
//! The cache lives in memory; a snapshot lets a server restart without
//! losing the directory tree. Saving writes to a temporary file in the
//! target directory and renames it into place, so a crash mid-save leaves
//! the previous snapshot intact.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use tracing::{info, instrument};

use super::{FileNode, MetaStore, NodeId, ROOT_ID, Tree};
use crate::error::{MetaResult, SnapshotError};

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    next_id: u64,
    nodes: Vec<FileNode>,
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> SnapshotError + '_ {
    move |source| SnapshotError::Io {
        path: path.to_path_buf(),
        source,
    }
}

impl Snapshot {
    fn into_tree(self) -> Result<Tree, SnapshotError> {
        if self.version != SNAPSHOT_VERSION {
            return Err(SnapshotError::UnsupportedVersion(self.version));
        }
        let mut nodes = HashMap::with_capacity(self.nodes.len());
        for node in self.nodes {
            if node.id.0 >= self.next_id && node.id != ROOT_ID {
                return Err(SnapshotError::Corrupt(format!(
                    "node {} is beyond next_id {}",
                    node.id, self.next_id
                )));
            }
            if nodes.insert(node.id, node).is_some() {
                return Err(SnapshotError::Corrupt("duplicate node id".into()));
            }
        }
        match nodes.get(&ROOT_ID) {
            Some(root) if root.is_dir && root.parent.is_none() => {}
            _ => return Err(SnapshotError::Corrupt("missing root directory".into())),
        }

        let mut children: HashMap<NodeId, BTreeMap<String, NodeId>> = nodes
            .values()
            .filter(|n| n.is_dir)
            .map(|n| (n.id, BTreeMap::new()))
            .collect();
        for node in nodes.values() {
            let Some(parent) = node.parent else {
                if node.id != ROOT_ID {
                    return Err(SnapshotError::Corrupt(format!("node {} has no parent", node.id)));
                }
                continue;
            };
            let siblings = children.get_mut(&parent).ok_or_else(|| {
                SnapshotError::Corrupt(format!("parent {parent} of node {} is not a directory", node.id))
            })?;
            if siblings.insert(node.name.clone(), node.id).is_some() {
                return Err(SnapshotError::Corrupt(format!(
                    "duplicate name '{}' under node {parent}",
                    node.name
                )));
            }
        }

        // Every node must reach the root; a cycle would otherwise survive
        // the checks above.
        for id in nodes.keys() {
            let mut current = *id;
            let mut steps = 0usize;
            while current != ROOT_ID {
                current = nodes
                    .get(&current)
                    .and_then(|n| n.parent)
                    .ok_or_else(|| SnapshotError::Corrupt(format!("node {id} is detached")))?;
                steps += 1;
                if steps > nodes.len() {
                    return Err(SnapshotError::Corrupt(format!("node {id} is in a cycle")));
                }
            }
        }

        Ok(Tree {
            nodes,
            children,
            next_id: self.next_id.max(1),
        })
    }
}

impl MetaStore {
    /// Write every node to `path` as JSON.
    #[instrument(level = "debug", skip_all, fields(path = %path.display()))]
    pub fn save_snapshot(&self, path: &Path) -> MetaResult<()> {
        let snapshot = {
            let tree = self.tree.read();
            let mut nodes: Vec<FileNode> = tree.nodes.values().cloned().collect();
            nodes.sort_by_key(|n| n.id);
            Snapshot {
                version: SNAPSHOT_VERSION,
                next_id: tree.next_id,
                nodes,
            }
        };

        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_error(path))?;
        {
            let mut writer = BufWriter::new(tmp.as_file());
            serde_json::to_writer(&mut writer, &snapshot).map_err(SnapshotError::from)?;
            writer.flush().map_err(io_error(path))?;
        }
        tmp.persist(path).map_err(|e| io_error(path)(e.error))?;

        info!(nodes = snapshot.nodes.len(), "Saved metadata snapshot");
        Ok(())
    }

    /// Rebuild a store from a snapshot written by [`save_snapshot`](Self::save_snapshot).
    #[instrument(level = "debug", skip_all, fields(path = %path.display()))]
    pub fn load_snapshot(path: &Path) -> MetaResult<Self> {
        let file = File::open(path).map_err(io_error(path))?;
        let snapshot: Snapshot =
            serde_json::from_reader(BufReader::new(file)).map_err(SnapshotError::from)?;
        let tree = snapshot.into_tree()?;
        info!(nodes = tree.nodes.len(), "Loaded metadata snapshot");
        Ok(Self::from_tree(tree))
    }
}
