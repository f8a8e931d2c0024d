//! Backing-store capability set.
//!
//! A backend stores bytes under flat keys such as `a/b/c.txt`. What a
//! "directory" means depends on its [`DirectoryLayout`]: a local disk has
//! real directories that must be created, removed and renamed, while an
//! object store only has key prefixes. The bridge picks its reconciliation
//! strategy from the layout once, at construction.
//!
//! Operations that only make sense for one layout have default
//! implementations returning [`BackendError::Unsupported`].

mod local;
mod memory;
#[cfg(feature = "s3")]
mod s3;

pub use local::LocalFsBackend;
pub use memory::MemoryBackend;
#[cfg(feature = "s3")]
pub use s3::{S3Backend, S3Options};

use async_trait::async_trait;
use std::fmt;
use tokio::io::AsyncRead;

use crate::error::{BackendError, BackendResult};

/// Byte stream handed to and returned from a backend.
pub type ObjectReader = Box<dyn AsyncRead + Send + Unpin>;

/// How a backend represents directories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryLayout {
    /// Directories are real objects (a local filesystem).
    Native,
    /// Directories are a key-prefix convention (S3 and friends).
    Prefix,
}

impl fmt::Display for DirectoryLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DirectoryLayout::Native => f.write_str("native"),
            DirectoryLayout::Prefix => f.write_str("prefix"),
        }
    }
}

#[async_trait]
pub trait ObjectBackend: Send + Sync + fmt::Debug {
    /// Short name used in logs and errors.
    fn name(&self) -> &'static str;

    fn layout(&self) -> DirectoryLayout;

    /// Open an object for reading.
    async fn get(&self, key: &str) -> BackendResult<ObjectReader>;

    /// Store everything `reader` yields under `key`, replacing any existing
    /// object. Returns the number of bytes written.
    async fn put(&self, key: &str, reader: ObjectReader) -> BackendResult<u64>;

    async fn delete(&self, key: &str) -> BackendResult<()>;

    async fn exists(&self, key: &str) -> BackendResult<bool>;

    async fn size(&self, key: &str) -> BackendResult<u64>;

    /// Modification time in seconds since the Unix epoch.
    async fn modified(&self, key: &str) -> BackendResult<i64>;

    async fn mkdir(&self, _key: &str) -> BackendResult<()> {
        Err(self.unsupported("mkdir"))
    }

    async fn rmdir(&self, _key: &str) -> BackendResult<()> {
        Err(self.unsupported("rmdir"))
    }

    /// Atomic rename of a file or directory.
    async fn rename(&self, _from: &str, _to: &str) -> BackendResult<()> {
        Err(self.unsupported("rename"))
    }

    /// Every key starting with `prefix`.
    async fn list_prefix(&self, _prefix: &str) -> BackendResult<Vec<String>> {
        Err(self.unsupported("list_prefix"))
    }

    /// Server-side copy of a single object.
    async fn copy(&self, _from: &str, _to: &str) -> BackendResult<()> {
        Err(self.unsupported("copy"))
    }

    #[doc(hidden)]
    fn unsupported(&self, op: &'static str) -> BackendError {
        BackendError::Unsupported {
            op,
            backend: self.name(),
        }
    }
}
