//! Directory-tree metadata cache for FTP front ends over blob storage.
//!
//! Object stores have no real directories, yet FTP clients expect a
//! hierarchical filesystem with cheap `LIST`, `CWD` and `SIZE`. This crate
//! keeps that hierarchy as metadata only: every file and directory is a
//! [`FileNode`] addressed by `(parent, name)`, and paths are resolved by
//! walking the chain from the root.
//!
//! # Modules
//!
//! - [`path`]: splitting paths into segments and building root-anchored
//!   lookup queries
//! - [`meta`]: the [`MetaStore`] arena, its transactions, row locks and
//!   JSON snapshots
//! - [`error`]: [`MetaError`] and the [`MetaResult`] alias
//!
//! File content never lives here. The storage bridge in `blobftp-storage`
//! is the only component that talks to the backing store.

pub mod error;
pub mod meta;
pub mod path;

pub use error::{MetaError, MetaResult, NodeKind, SnapshotError};
pub use meta::{
    DEFAULT_PERMISSION, FileNode, MetaStore, MetaTxn, NodeId, ROOT_ID, RowGuard, RowLocks,
    unix_now,
};
pub use path::{PathQuery, QueryMode, join_path, object_key, split_path};
