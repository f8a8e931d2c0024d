//! Per-node row locks.
//!
//! A row lock is held across the awaits of a multi-step operation (upload
//! commit, rename, directory removal) so that two such operations on the
//! same node serialize. Locks over several rows are always taken in
//! ascending [`NodeId`] order, which rules out lock-order deadlocks between
//! tasks that touch overlapping sets.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

use super::NodeId;

/// Table of async row mutexes, created lazily per node.
#[derive(Debug, Default)]
pub struct RowLocks {
    locks: DashMap<NodeId, Arc<Mutex<()>>>,
}

/// Held row locks. Releases every row on drop.
#[derive(Debug)]
pub struct RowGuard {
    rows: Vec<NodeId>,
    _guards: Vec<OwnedMutexGuard<()>>,
}

impl RowGuard {
    /// Rows held by this guard, ascending.
    pub fn rows(&self) -> &[NodeId] {
        &self.rows
    }
}

impl RowLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn mutex(&self, id: NodeId) -> Arc<Mutex<()>> {
        Arc::clone(
            self.locks
                .entry(id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }

    pub async fn lock(&self, id: NodeId) -> RowGuard {
        self.lock_many(&[id]).await
    }

    /// Lock several rows in ascending id order. Duplicates are ignored.
    pub async fn lock_many(&self, ids: &[NodeId]) -> RowGuard {
        let mut rows = ids.to_vec();
        rows.sort_unstable();
        rows.dedup();

        let mut guards = Vec::with_capacity(rows.len());
        for id in &rows {
            guards.push(self.mutex(*id).lock_owned().await);
        }
        trace!(rows = ?rows, "Acquired row locks");
        RowGuard {
            rows,
            _guards: guards,
        }
    }

    /// Drop the mutex of a deleted node if nobody is waiting on it.
    pub(crate) fn forget(&self, id: NodeId) {
        self.locks
            .remove_if(&id, |_, mutex| Arc::strong_count(mutex) == 1);
    }

    /// Number of rows with a live mutex.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
