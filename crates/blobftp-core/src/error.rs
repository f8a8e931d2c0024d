//! Error types for the metadata cache.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Classification of a node, used in type-mismatch errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Directory,
}

impl NodeKind {
    pub fn of(is_dir: bool) -> Self {
        if is_dir {
            NodeKind::Directory
        } else {
            NodeKind::File
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::File => f.write_str("file"),
            NodeKind::Directory => f.write_str("directory"),
        }
    }
}

/// Errors produced by [`MetaStore`](crate::MetaStore) operations.
///
/// Every variant except [`MetaError::Snapshot`] is a recoverable, typed
/// failure that the filesystem layer maps onto an FTP reply.
#[derive(Error, Debug)]
pub enum MetaError {
    #[error("No such file or directory: {path}")]
    NotFound { path: String },

    #[error("Not a {expected}: {path}")]
    TypeMismatch { path: String, expected: NodeKind },

    #[error("Directory not empty: {path}")]
    HasChildren { path: String },

    #[error("Already exists: {path}")]
    AlreadyExists { path: String },

    #[error("Invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: &'static str },

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),
}

impl MetaError {
    pub(crate) fn not_found(path: impl Into<String>) -> Self {
        MetaError::NotFound { path: path.into() }
    }

    pub(crate) fn mismatch(path: impl Into<String>, expected: NodeKind) -> Self {
        MetaError::TypeMismatch {
            path: path.into(),
            expected,
        }
    }

    pub(crate) fn invalid(path: impl Into<String>, reason: &'static str) -> Self {
        MetaError::InvalidPath {
            path: path.into(),
            reason,
        }
    }

    /// Returns true if this is a `NotFound` error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, MetaError::NotFound { .. })
    }
}

/// Errors raised while saving or loading a metadata snapshot.
#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported snapshot version: {0}")]
    UnsupportedVersion(u32),

    #[error("Corrupt snapshot: {0}")]
    Corrupt(String),
}

pub type MetaResult<T> = Result<T, MetaError>;
