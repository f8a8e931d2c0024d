//! Storage bridge between the blobftp metadata cache and blob backends.
//!
//! - [`ObjectBackend`]: what a backing store must offer
//! - [`LocalFsBackend`], [`MemoryBackend`] and (with the `s3` feature)
//!   `S3Backend`: concrete stores
//! - [`StorageBridge`]: cache-aware mkdir, rmdir, delete, rename, size,
//!   mtime, read and write

pub mod backend;
pub mod bridge;
pub mod error;

#[cfg(feature = "s3")]
pub use backend::{S3Backend, S3Options};
pub use backend::{DirectoryLayout, LocalFsBackend, MemoryBackend, ObjectBackend, ObjectReader};
pub use bridge::StorageBridge;
pub use error::{BackendError, BackendResult, BridgeError, BridgeResult};
