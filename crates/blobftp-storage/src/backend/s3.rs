//! S3-compatible object store backend.
//!
//! Keys are stored under an optional prefix inside one bucket. Bodies are
//! buffered in memory in both directions; FTP transfers here are expected
//! to be modest, and multipart upload is not implemented.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::ByteStream;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use std::io::Cursor;
use tokio::io::AsyncReadExt;
use tracing::{debug, trace};

use super::{DirectoryLayout, ObjectBackend, ObjectReader};
use crate::error::{BackendError, BackendResult};

/// Connection settings for [`S3Backend`].
#[derive(Debug, Clone, Default)]
pub struct S3Options {
    pub bucket: String,
    pub region: Option<String>,
    /// Custom endpoint for MinIO, RustFS and other S3-compatible servers.
    pub endpoint: Option<String>,
    /// Key prefix prepended to every object, without trailing slash.
    pub prefix: Option<String>,
}

#[derive(Debug, Clone)]
pub struct S3Backend {
    client: Client,
    bucket: String,
    prefix: String,
}

/// Bytes left unescaped in a `CopyObject` source: RFC 3986 unreserved
/// characters and the key's `/` separators.
const COPY_SOURCE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// `bucket/key` with the key URL-encoded, as `CopyObject` requires.
fn copy_source(bucket: &str, key: &str) -> String {
    format!("{bucket}/{}", utf8_percent_encode(key, COPY_SOURCE))
}

fn unavailable(err: impl std::fmt::Display) -> BackendError {
    BackendError::Unavailable(err.to_string())
}

impl S3Backend {
    /// Build a client from the ambient AWS configuration (environment,
    /// profile files, instance metadata) plus the given overrides.
    pub async fn connect(options: S3Options) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = options.region.clone() {
            loader = loader.region(aws_config::Region::new(region));
        }
        if let Some(endpoint) = options.endpoint.as_deref() {
            loader = loader.endpoint_url(endpoint);
        }
        let conf = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&conf);
        if options.endpoint.is_some() {
            // Self-hosted servers rarely support virtual-hosted buckets.
            builder = builder.force_path_style(true);
        }
        debug!(bucket = %options.bucket, "Connected S3 backend");
        Self::with_client(Client::from_conf(builder.build()), options)
    }

    pub fn with_client(client: Client, options: S3Options) -> Self {
        let prefix = options
            .prefix
            .map(|p| p.trim_matches('/').to_owned())
            .filter(|p| !p.is_empty())
            .map(|p| format!("{p}/"))
            .unwrap_or_default();
        Self {
            client,
            bucket: options.bucket,
            prefix,
        }
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }

    fn strip_prefix<'a>(&self, key: &'a str) -> &'a str {
        key.strip_prefix(self.prefix.as_str()).unwrap_or(key)
    }
}

#[async_trait]
impl ObjectBackend for S3Backend {
    fn name(&self) -> &'static str {
        "s3"
    }

    fn layout(&self) -> DirectoryLayout {
        DirectoryLayout::Prefix
    }

    async fn get(&self, key: &str) -> BackendResult<ObjectReader> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().is_some_and(|se| se.is_no_such_key()) {
                    BackendError::NotFound {
                        key: key.to_owned(),
                    }
                } else {
                    unavailable(e)
                }
            })?;
        let bytes = output.body.collect().await.map_err(unavailable)?.into_bytes();
        Ok(Box::new(Cursor::new(bytes.to_vec())))
    }

    async fn put(&self, key: &str, mut reader: ObjectReader) -> BackendResult<u64> {
        let mut data = Vec::new();
        reader
            .read_to_end(&mut data)
            .await
            .map_err(|e| BackendError::from_io(key, e))?;
        let len = data.len() as u64;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(unavailable)?;
        trace!(key, len, "Stored S3 object");
        Ok(len)
    }

    async fn delete(&self, key: &str) -> BackendResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> BackendResult<bool> {
        match self.size(key).await {
            Ok(_) => Ok(true),
            Err(BackendError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn size(&self, key: &str) -> BackendResult<u64> {
        let head = self.head(key).await?;
        Ok(head.content_length().map_or(0, |len| len.max(0) as u64))
    }

    async fn modified(&self, key: &str) -> BackendResult<i64> {
        let head = self.head(key).await?;
        Ok(head.last_modified().map_or(0, aws_sdk_s3::primitives::DateTime::secs))
    }

    async fn list_prefix(&self, prefix: &str) -> BackendResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(self.full_key(prefix))
                .set_continuation_token(token.take())
                .send()
                .await
                .map_err(unavailable)?;
            keys.extend(
                page.contents()
                    .iter()
                    .filter_map(|o| o.key())
                    .map(|k| self.strip_prefix(k).to_owned()),
            );
            match page.next_continuation_token() {
                Some(next) if page.is_truncated().unwrap_or(false) => token = Some(next.to_owned()),
                _ => break,
            }
        }
        Ok(keys)
    }

    async fn copy(&self, from: &str, to: &str) -> BackendResult<()> {
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(copy_source(&self.bucket, &self.full_key(from)))
            .key(self.full_key(to))
            .send()
            .await
            .map_err(unavailable)?;
        Ok(())
    }
}

impl S3Backend {
    async fn head(&self, key: &str) -> BackendResult<aws_sdk_s3::operation::head_object::HeadObjectOutput> {
        self.client
            .head_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().is_some_and(|se| se.is_not_found()) {
                    BackendError::NotFound {
                        key: key.to_owned(),
                    }
                } else {
                    unavailable(e)
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_source_encodes_key() {
        assert_eq!(copy_source("b", "dir/plain.txt"), "b/dir/plain.txt");
        assert_eq!(
            copy_source("b", "in/my report+v2 100%.csv"),
            "b/in/my%20report%2Bv2%20100%25.csv"
        );
        assert_eq!(copy_source("b", "caf\u{e9}"), "b/caf%C3%A9");
    }
}
