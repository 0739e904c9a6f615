//! Object storage boundary.
//!
//! The sync drivers only see the [`ObjectStore`] trait. [`S3ObjectStore`] is the
//! production implementation on top of `aws-sdk-s3`; every call it makes carries
//! a deadline.

use crate::config::S3Config;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::Client as S3Client;
use chrono::{DateTime, TimeZone, Utc};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Suffix of downloads still being written
pub const PARTIAL_SUFFIX: &str = ".part";

/// A bucket object as reported by a listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

/// Errors returned by the storage backend
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("Object {0} not found")]
    NotFound(String),

    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StorageError {
    /// Whether the next sync cycle may succeed where this one failed
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Timeout { .. } | StorageError::Backend(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}

/// Capabilities the mirror needs from the bucket
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Name of the mirrored bucket
    fn bucket(&self) -> &str;

    /// Every object under `prefix`, recursively
    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectInfo>, StorageError>;

    /// Download `key` to `local_path`, replacing any existing file
    async fn fetch_object(&self, key: &str, local_path: &Path) -> Result<(), StorageError>;

    /// Presigned GET URL for `key`
    async fn presigned_url(&self, key: &str, ttl: Duration) -> Result<String, StorageError>;
}

/// S3-backed object store
pub struct S3ObjectStore {
    client: S3Client,
    bucket: String,
    fetch_timeout: Duration,
    list_timeout: Duration,
}

impl S3ObjectStore {
    /// Create a new S3 object store
    pub async fn new(config: &S3Config) -> Self {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            endpoint = config.endpoint_url.as_deref().unwrap_or("aws"),
            "S3 object store initialized"
        );

        Self {
            client,
            bucket: config.bucket.clone(),
            fetch_timeout: Duration::from_secs(config.fetch_timeout_secs),
            list_timeout: Duration::from_secs(config.list_timeout_secs),
        }
    }

    async fn list_all(&self, prefix: &str) -> Result<Vec<ObjectInfo>, StorageError> {
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .into_paginator()
            .send();

        let mut objects = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| StorageError::Backend(format!("list {prefix}: {e}")))?;

            for obj in page.contents() {
                let Some(key) = obj.key() else { continue };
                let last_modified = obj
                    .last_modified()
                    .and_then(|t| Utc.timestamp_opt(t.secs(), t.subsec_nanos()).single())
                    .unwrap_or_else(Utc::now);

                objects.push(ObjectInfo {
                    key: key.to_string(),
                    size: obj.size().unwrap_or_default().max(0) as u64,
                    last_modified,
                });
            }
        }

        Ok(objects)
    }

    async fn get_bytes(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().map(|e| e.is_no_such_key()).unwrap_or(false) {
                    StorageError::NotFound(key.to_string())
                } else {
                    StorageError::Backend(format!("get {key}: {e}"))
                }
            })?;

        let body = response
            .body
            .collect()
            .await
            .map_err(|e| StorageError::Backend(format!("read {key}: {e}")))?;

        Ok(body.into_bytes().to_vec())
    }
}

/// Sibling path a download is staged at before being moved into place
pub fn partial_path(local_path: &Path) -> PathBuf {
    let mut name = local_path.file_name().unwrap_or_default().to_os_string();
    name.push(PARTIAL_SUFFIX);
    local_path.with_file_name(name)
}

/// Replace `local_path` with `content`; readers see the old file or the new one, never a mix
pub async fn write_replacing(local_path: &Path, content: &[u8]) -> Result<(), StorageError> {
    let partial = partial_path(local_path);
    let staged = match tokio::fs::write(&partial, content).await {
        Ok(()) => tokio::fs::rename(&partial, local_path).await,
        Err(e) => Err(e),
    };

    if let Err(source) = staged {
        match tokio::fs::remove_file(&partial).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                path = %partial.display(),
                error = %e,
                "Failed to remove partial download"
            ),
        }
        return Err(StorageError::Io {
            path: local_path.to_path_buf(),
            source,
        });
    }

    Ok(())
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    #[instrument(skip(self))]
    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectInfo>, StorageError> {
        let objects = tokio::time::timeout(self.list_timeout, self.list_all(prefix))
            .await
            .map_err(|_| StorageError::Timeout {
                operation: "list",
                after: self.list_timeout,
            })??;

        debug!(prefix = %prefix, count = objects.len(), "Listed bucket objects");
        Ok(objects)
    }

    #[instrument(skip(self, local_path))]
    async fn fetch_object(&self, key: &str, local_path: &Path) -> Result<(), StorageError> {
        let content = tokio::time::timeout(self.fetch_timeout, self.get_bytes(key))
            .await
            .map_err(|_| StorageError::Timeout {
                operation: "fetch",
                after: self.fetch_timeout,
            })??;

        write_replacing(local_path, &content).await
    }

    async fn presigned_url(&self, key: &str, ttl: Duration) -> Result<String, StorageError> {
        let presigning_config = PresigningConfig::expires_in(ttl)
            .map_err(|e| StorageError::Backend(format!("presigning config: {e}")))?;

        let presigned = tokio::time::timeout(
            self.fetch_timeout,
            self.client
                .get_object()
                .bucket(&self.bucket)
                .key(key)
                .presigned(presigning_config),
        )
        .await
        .map_err(|_| StorageError::Timeout {
            operation: "presign",
            after: self.fetch_timeout,
        })?
        .map_err(|e| StorageError::Backend(format!("presign {key}: {e}")))?;

        Ok(presigned.uri().to_string())
    }
}
