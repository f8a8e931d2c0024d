//! Configuration file support.
//!
//! # Example configuration
//!
//! ```toml
//! [storage]
//! backend = "s3"
//! bucket = "ftp-data"
//! region = "eu-west-1"
//! endpoint = "http://localhost:9000"
//! prefix = "tenants/acme"
//!
//! [cache]
//! snapshot = "/var/lib/blobftp/cache.json"
//!
//! [listing]
//! use_gmt_times = true
//! ```
//!
//! `backend` is one of `local` (with `root`), `memory` or `s3`. An
//! optional `layout = "native" | "prefix"` under `[storage]` overrides the
//! directory strategy the backend advertises.

use blobftp_core::MetaStore;
use blobftp_storage::{DirectoryLayout, LocalFsBackend, MemoryBackend, ObjectBackend, StorageBridge};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{FsError, FsResult};
use crate::filesystem::StorageFs;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FsConfig {
    pub storage: StorageConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub listing: ListingConfig,
}

/// Backing store selection.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(flatten)]
    pub backend: BackendConfig,

    /// Override of the backend's own directory layout.
    pub layout: Option<LayoutConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum BackendConfig {
    Local {
        root: PathBuf,
    },
    Memory,
    S3 {
        bucket: String,
        region: Option<String>,
        endpoint: Option<String>,
        prefix: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LayoutConfig {
    Native,
    Prefix,
}

impl From<LayoutConfig> for DirectoryLayout {
    fn from(layout: LayoutConfig) -> Self {
        match layout {
            LayoutConfig::Native => DirectoryLayout::Native,
            LayoutConfig::Prefix => DirectoryLayout::Prefix,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CacheConfig {
    /// JSON snapshot loaded at startup and written by `StorageFs::persist`.
    pub snapshot: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListingConfig {
    /// Render listing times in UTC rather than local time.
    #[serde(default = "default_true")]
    pub use_gmt_times: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ListingConfig {
    fn default() -> Self {
        Self {
            use_gmt_times: true,
        }
    }
}

impl FsConfig {
    pub fn from_toml_str(content: &str) -> FsResult<Self> {
        toml::from_str(content).map_err(|e| FsError::Config(e.to_string()))
    }

    pub fn from_file(path: &Path) -> FsResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            FsError::Config(format!("Failed to read config file {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    async fn backend(&self) -> FsResult<Arc<dyn ObjectBackend>> {
        match &self.storage.backend {
            BackendConfig::Local { root } => Ok(Arc::new(LocalFsBackend::new(root))),
            BackendConfig::Memory => Ok(Arc::new(MemoryBackend::new())),
            #[cfg(feature = "s3")]
            BackendConfig::S3 {
                bucket,
                region,
                endpoint,
                prefix,
            } => {
                let options = blobftp_storage::S3Options {
                    bucket: bucket.clone(),
                    region: region.clone(),
                    endpoint: endpoint.clone(),
                    prefix: prefix.clone(),
                };
                Ok(Arc::new(blobftp_storage::S3Backend::connect(options).await))
            }
            #[cfg(not(feature = "s3"))]
            BackendConfig::S3 { .. } => Err(FsError::Config(
                "the s3 backend requires the `s3` feature".into(),
            )),
        }
    }

    fn metadata(&self) -> FsResult<MetaStore> {
        match self.cache.snapshot.as_deref() {
            Some(path) if path.exists() => Ok(MetaStore::load_snapshot(path)?),
            Some(path) => {
                warn!(path = %path.display(), "Snapshot not found, starting with an empty cache");
                Ok(MetaStore::new())
            }
            None => Ok(MetaStore::new()),
        }
    }

    /// Assemble the filesystem this configuration describes.
    pub async fn build(&self) -> FsResult<StorageFs> {
        let backend = self.backend().await?;
        let layout = self
            .storage
            .layout
            .map_or_else(|| backend.layout(), DirectoryLayout::from);
        let meta = Arc::new(self.metadata()?);
        info!(backend = backend.name(), layout = %layout, nodes = meta.len(), "Building filesystem");

        let mut fs = StorageFs::new(StorageBridge::new(backend, meta, layout))
            .with_gmt_times(self.listing.use_gmt_times);
        if let Some(snapshot) = &self.cache.snapshot {
            fs = fs.with_snapshot(snapshot);
        }
        Ok(fs)
    }
}
