//! In-process object store for tests and ephemeral servers.

use async_trait::async_trait;
use blobftp_core::unix_now;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::io::AsyncReadExt;
use tracing::trace;

use super::{DirectoryLayout, ObjectBackend, ObjectReader};
use crate::error::{BackendError, BackendResult};

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    modified: i64,
}

/// In-process, prefix-addressed object store.
///
/// Behaves like a bucket: flat keys, no directories. Calling
/// `set_available(false)` makes every operation fail with
/// [`BackendError::Unavailable`], which is how outages are simulated.
#[derive(Debug)]
pub struct MemoryBackend {
    objects: RwLock<BTreeMap<String, StoredObject>>,
    available: AtomicBool,
    calls: AtomicU64,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
            available: AtomicBool::new(true),
            calls: AtomicU64::new(0),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Store an object directly, bypassing availability.
    pub fn insert(&self, key: impl Into<String>, data: impl Into<Vec<u8>>) {
        self.objects.write().insert(
            key.into(),
            StoredObject {
                data: data.into(),
                modified: unix_now(),
            },
        );
    }

    /// Snapshot of every stored key, sorted.
    pub fn keys(&self) -> Vec<String> {
        self.objects.read().keys().cloned().collect()
    }

    pub fn contents(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.read().get(key).map(|o| o.data.clone())
    }

    /// Backend operations attempted so far, failed ones included.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    fn check(&self) -> BackendResult<()> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BackendError::Unavailable("memory backend is offline".into()))
        }
    }

    fn object(&self, key: &str) -> BackendResult<StoredObject> {
        self.objects
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| BackendError::NotFound {
                key: key.to_owned(),
            })
    }
}

#[async_trait]
impl ObjectBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn layout(&self) -> DirectoryLayout {
        DirectoryLayout::Prefix
    }

    async fn get(&self, key: &str) -> BackendResult<ObjectReader> {
        self.check()?;
        let object = self.object(key)?;
        Ok(Box::new(Cursor::new(object.data)))
    }

    async fn put(&self, key: &str, mut reader: ObjectReader) -> BackendResult<u64> {
        self.check()?;
        let mut data = Vec::new();
        reader
            .read_to_end(&mut data)
            .await
            .map_err(|e| BackendError::from_io(key, e))?;
        // The store may have gone away while the body was streaming.
        self.check()?;
        let len = data.len() as u64;
        self.insert(key, data);
        trace!(key, len, "Stored memory object");
        Ok(len)
    }

    async fn delete(&self, key: &str) -> BackendResult<()> {
        self.check()?;
        self.objects
            .write()
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| BackendError::NotFound {
                key: key.to_owned(),
            })
    }

    async fn exists(&self, key: &str) -> BackendResult<bool> {
        self.check()?;
        Ok(self.objects.read().contains_key(key))
    }

    async fn size(&self, key: &str) -> BackendResult<u64> {
        self.check()?;
        Ok(self.object(key)?.data.len() as u64)
    }

    async fn modified(&self, key: &str) -> BackendResult<i64> {
        self.check()?;
        Ok(self.object(key)?.modified)
    }

    async fn list_prefix(&self, prefix: &str) -> BackendResult<Vec<String>> {
        self.check()?;
        Ok(self
            .objects
            .read()
            .range(prefix.to_owned()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn copy(&self, from: &str, to: &str) -> BackendResult<()> {
        self.check()?;
        let object = self.object(from)?;
        self.objects.write().insert(
            to.to_owned(),
            StoredObject {
                data: object.data,
                modified: unix_now(),
            },
        );
        Ok(())
    }
}
