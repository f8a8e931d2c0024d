//! Error handling and FTP reply mapping for the filesystem adapter.
//!
//! Cache and backend errors are folded into one [`FsError`] taxonomy that
//! the protocol layer turns into numbered FTP replies via
//! [`FsError::reply`].

use blobftp_core::{MetaError, NodeKind, SnapshotError};
use blobftp_storage::{BackendError, BridgeError};
use std::fmt;
use thiserror::Error;

/// Errors returned by [`StorageFs`](crate::StorageFs) and the upload protocol.
#[derive(Debug, Error)]
pub enum FsError {
    /// The path does not resolve.
    #[error("No such file or directory: {0}")]
    NotFound(String),

    /// A file was found where a directory was required, or vice versa.
    #[error("Not a {expected}: {path}")]
    TypeMismatch { path: String, expected: NodeKind },

    /// Directory not empty.
    #[error("Directory not empty: {0}")]
    HasChildren(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Malformed name, or an operation the root directory refuses.
    #[error("Invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: &'static str },

    /// Backing store failure during a primary operation (boxed to reduce enum size).
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(Box<BackendError>),

    /// Snapshot save or load failure (boxed to reduce enum size).
    #[error("Metadata snapshot failed: {0}")]
    Snapshot(Box<SnapshotError>),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// A numbered FTP reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub text: String,
}

impl Reply {
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.text)
    }
}

impl FsError {
    /// FTP reply code for this error.
    ///
    /// - 550: missing path, wrong node type, non-empty directory
    /// - 553: rejected file name or name collision
    /// - 451: backend or local processing failure
    pub fn reply_code(&self) -> u16 {
        match self {
            FsError::NotFound(_) | FsError::TypeMismatch { .. } | FsError::HasChildren(_) => 550,
            FsError::AlreadyExists(_) | FsError::InvalidPath { .. } => 553,
            FsError::BackendUnavailable(_) | FsError::Snapshot(_) | FsError::Config(_) => 451,
        }
    }

    pub fn reply(&self) -> Reply {
        let text = match self {
            FsError::NotFound(_) => "File or directory does not exist.".to_owned(),
            FsError::BackendUnavailable(_) => {
                "Requested action aborted: storage unavailable.".to_owned()
            }
            other => other.to_string(),
        };
        Reply::new(self.reply_code(), text)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, FsError::NotFound(_))
    }
}

impl From<MetaError> for FsError {
    fn from(e: MetaError) -> Self {
        match e {
            MetaError::NotFound { path } => FsError::NotFound(path),
            MetaError::TypeMismatch { path, expected } => FsError::TypeMismatch { path, expected },
            MetaError::HasChildren { path } => FsError::HasChildren(path),
            MetaError::AlreadyExists { path } => FsError::AlreadyExists(path),
            MetaError::InvalidPath { path, reason } => FsError::InvalidPath { path, reason },
            MetaError::Snapshot(e) => FsError::Snapshot(Box::new(e)),
        }
    }
}

impl From<BackendError> for FsError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::NotFound { key } => FsError::NotFound(format!("/{key}")),
            other => FsError::BackendUnavailable(Box::new(other)),
        }
    }
}

impl From<BridgeError> for FsError {
    fn from(e: BridgeError) -> Self {
        match e {
            BridgeError::Meta(e) => e.into(),
            BridgeError::Backend(e) => e.into(),
        }
    }
}

/// Result type for filesystem adapter operations.
pub type FsResult<T> = Result<T, FsError>;
