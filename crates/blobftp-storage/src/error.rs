//! Error types for backends and the storage bridge.

use blobftp_core::MetaError;
use thiserror::Error;

/// Errors returned by an [`ObjectBackend`](crate::ObjectBackend).
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Object not found: {key}")]
    NotFound { key: String },

    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Operation '{op}' is not supported by the {backend} backend")]
    Unsupported {
        op: &'static str,
        backend: &'static str,
    },

    #[error("Invalid object key: {key}")]
    InvalidKey { key: String },

    #[error("IO error on '{key}': {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
}

impl BackendError {
    /// Classify an IO error for `key`, folding `ENOENT` into `NotFound`.
    pub fn from_io(key: &str, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            BackendError::NotFound {
                key: key.to_owned(),
            }
        } else {
            BackendError::Io {
                key: key.to_owned(),
                source,
            }
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NotFound { .. })
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Errors from [`StorageBridge`](crate::StorageBridge) operations.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// The metadata cache rejected the operation.
    #[error(transparent)]
    Meta(#[from] MetaError),

    /// A primary backend call failed.
    #[error(transparent)]
    Backend(#[from] BackendError),
}

pub type BridgeResult<T> = Result<T, BridgeError>;
