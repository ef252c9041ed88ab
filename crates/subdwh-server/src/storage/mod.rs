//! Object storage
//!
//! [`ObjectStore`] is the narrow contract the pipelines use; [`Storage`] is the
//! S3 implementation. Listing is always exhaustive (continuation tokens are
//! followed) because both schedulers rely on complete key sets.

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::{
    config::{Credentials, Region},
    primitives::ByteStream,
    types::MetadataDirective,
    Client,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument};

pub mod config;

/// One listed object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSummary {
    pub key: String,
    pub last_modified: Option<DateTime<Utc>>,
    pub size: i64,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn bucket(&self) -> &str;

    /// Every object under `prefix`, in listing order.
    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectSummary>>;

    /// User metadata of `key` (empty when the object carries none).
    async fn head_metadata(&self, key: &str) -> Result<HashMap<String, String>>;

    /// Replace the object's user metadata wholesale (copy-in-place).
    async fn replace_metadata(&self, key: &str, metadata: HashMap<String, String>) -> Result<()>;

    /// Stream `key` to `path`, creating parent directories. Returns bytes written.
    async fn download_to(&self, key: &str, path: &Path) -> Result<u64>;

    /// Object body, or `None` when the key does not exist.
    async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn put_bytes(&self, key: &str, data: Vec<u8>, content_type: Option<&str>) -> Result<()>;

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .list_objects(prefix)
            .await?
            .into_iter()
            .map(|o| o.key)
            .collect())
    }

    /// Keys under `prefix` created after `since_key`, oldest first.
    async fn list_since(&self, prefix: &str, since_key: Option<&str>) -> Result<Vec<String>> {
        let objects = self.list_objects(prefix).await?;
        Ok(keys_since(objects, since_key))
    }
}

/// Order objects chronologically and keep those after `since_key`
///
/// Objects sort by last-modified time, then key. When `since_key` is absent,
/// or no longer listed, every key is returned.
pub fn keys_since(mut objects: Vec<ObjectSummary>, since_key: Option<&str>) -> Vec<String> {
    objects.sort_by(|a, b| {
        a.last_modified
            .cmp(&b.last_modified)
            .then_with(|| a.key.cmp(&b.key))
    });

    let keys: Vec<String> = objects.into_iter().map(|o| o.key).collect();

    match since_key.and_then(|since| keys.iter().position(|k| k == since)) {
        Some(idx) => keys[idx + 1..].to_vec(),
        None => keys,
    }
}

#[derive(Clone)]
pub struct Storage {
    client: Client,
    bucket: String,
}

impl Storage {
    /// Build a client for the data bucket of `config`
    pub async fn new(config: &config::StorageConfig) -> Result<Self> {
        let mut builder = if config.has_static_credentials() {
            let credentials = Credentials::new(
                &config.access_key,
                &config.secret_key,
                None,
                None,
                "subdwh-storage",
            );
            aws_sdk_s3::Config::builder()
                .behavior_version(BehaviorVersion::latest())
                .credentials_provider(credentials)
                .region(Region::new(config.region.clone()))
        } else {
            let shared = aws_config::defaults(BehaviorVersion::latest())
                .region(Region::new(config.region.clone()))
                .load()
                .await;
            aws_sdk_s3::config::Builder::from(&shared)
        };

        builder = builder.force_path_style(config.path_style);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(builder.build());

        info!(bucket = %config.bucket, "Storage client initialized");

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
        })
    }

    /// Same client, different bucket
    pub fn with_bucket(&self, bucket: impl Into<String>) -> Self {
        Self {
            client: self.client.clone(),
            bucket: bucket.into(),
        }
    }
}

#[async_trait]
impl ObjectStore for Storage {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectSummary>> {
        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .with_context(|| format!("Failed to list s3://{}/{}", self.bucket, prefix))?;

            objects.extend(response.contents().iter().filter_map(|obj| {
                obj.key().map(|key| ObjectSummary {
                    key: key.to_string(),
                    last_modified: obj
                        .last_modified()
                        .and_then(|dt| DateTime::from_timestamp(dt.secs(), dt.subsec_nanos())),
                    size: obj.size().unwrap_or(0),
                })
            }));

            match response.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }

        debug!(count = objects.len(), "Listed objects");
        Ok(objects)
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn head_metadata(&self, key: &str) -> Result<HashMap<String, String>> {
        let response = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("Failed to head s3://{}/{}", self.bucket, key))?;

        Ok(response.metadata().cloned().unwrap_or_default())
    }

    #[instrument(skip(self, metadata), fields(bucket = %self.bucket))]
    async fn replace_metadata(&self, key: &str, metadata: HashMap<String, String>) -> Result<()> {
        // REPLACE drops every header not resent, so carry the content type over.
        let head = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("Failed to head s3://{}/{}", self.bucket, key))?;

        let copy_source = format!("{}/{}", self.bucket, urlencoding::encode(key));

        self.client
            .copy_object()
            .bucket(&self.bucket)
            .key(key)
            .copy_source(copy_source)
            .metadata_directive(MetadataDirective::Replace)
            .set_metadata(Some(metadata))
            .set_content_type(head.content_type().map(str::to_string))
            .send()
            .await
            .with_context(|| format!("Failed to replace metadata on s3://{}/{}", self.bucket, key))?;

        debug!("Replaced metadata on s3://{}/{}", self.bucket, key);
        Ok(())
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn download_to(&self, key: &str, path: &Path) -> Result<u64> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("Failed to download s3://{}/{}", self.bucket, key))?;

        let mut body = response.body.into_async_read();
        let mut file = tokio::fs::File::create(path)
            .await
            .with_context(|| format!("Failed to create {}", path.display()))?;
        let written = tokio::io::copy(&mut body, &mut file)
            .await
            .context("Failed to write S3 object to disk")?;
        file.flush().await?;

        info!(
            "Downloaded s3://{}/{} to {} ({} bytes)",
            self.bucket,
            key,
            path.display(),
            written
        );
        Ok(written)
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let response = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) if e.as_service_error().map(|se| se.is_no_such_key()) == Some(true) => {
                return Ok(None)
            },
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("Failed to get s3://{}/{}", self.bucket, key)))
            },
        };

        let data = response
            .body
            .collect()
            .await
            .context("Failed to read S3 response body")?
            .into_bytes()
            .to_vec();

        Ok(Some(data))
    }

    #[instrument(skip(self, data), fields(bucket = %self.bucket, size = data.len()))]
    async fn put_bytes(&self, key: &str, data: Vec<u8>, content_type: Option<&str>) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .set_content_type(content_type.map(str::to_string))
            .send()
            .await
            .with_context(|| format!("Failed to upload s3://{}/{}", self.bucket, key))?;

        debug!("Uploaded s3://{}/{}", self.bucket, key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn object(key: &str, minute: u32) -> ObjectSummary {
        ObjectSummary {
            key: key.to_string(),
            last_modified: Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, minute, 0).unwrap()),
            size: 1,
        }
    }

    #[test]
    fn test_keys_since_orders_chronologically() {
        let objects = vec![object("c", 3), object("a", 1), object("b", 2)];
        assert_eq!(keys_since(objects, None), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_keys_since_excludes_cursor_and_older() {
        let objects = vec![object("a", 1), object("b", 2), object("c", 3)];
        assert_eq!(keys_since(objects, Some("b")), vec!["c"]);
    }

    #[test]
    fn test_keys_since_cursor_at_end_is_empty() {
        let objects = vec![object("a", 1), object("b", 2)];
        assert!(keys_since(objects, Some("b")).is_empty());
    }

    #[test]
    fn test_keys_since_unknown_cursor_returns_everything() {
        let objects = vec![object("a", 1), object("b", 2)];
        assert_eq!(keys_since(objects, Some("gone")), vec!["a", "b"]);
    }

    #[test]
    fn test_keys_since_breaks_ties_by_key() {
        let objects = vec![object("b", 1), object("a", 1)];
        assert_eq!(keys_since(objects, None), vec!["a", "b"]);
    }
}
