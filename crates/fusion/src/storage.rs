use std::path::Path;
use async_trait::async_trait;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    BucketLifecycleConfiguration, ExpirationStatus, LifecycleExpiration, LifecycleRule,
    LifecycleRuleFilter,
};
use aws_sdk_s3::Client;
use log::{info, warn};
use thiserror::Error;

use crate::config::S3Config;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("upload failed: {0}")]
    Upload(String),

    #[error("lifecycle configuration failed: {0}")]
    Lifecycle(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Durable home for finished artifacts: local file in, URL out.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn upload(&self, local_path: &Path, key: &str) -> Result<String, StorageError>;
}

/// Strip characters that have no business in an object key
pub fn sanitize_key(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | ' '))
        .collect()
}

/// S3-backed artifact store. Credentials come from the standard AWS
/// environment variables; bucket, region and key prefix from config.
pub struct S3ArtifactStore {
    client: Client,
    cfg: S3Config,
}

impl S3ArtifactStore {
    pub fn new(cfg: S3Config) -> Self {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID").unwrap_or_default();
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY").unwrap_or_default();
        let credentials = Credentials::new(access_key_id, secret_access_key, None, None, "fusion-storage");

        let s3_config = aws_sdk_s3::Config::builder()
            .credentials_provider(credentials)
            .region(Region::new(cfg.region.clone()))
            .behavior_version_latest()
            .build();

        let client = Client::from_conf(s3_config);
        Self { client, cfg }
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.cfg.prefix, key)
    }

    fn object_url(&self, full_key: &str) -> String {
        format!(
            "https://{}.s3.{}.amazonaws.com/{}",
            self.cfg.bucket, self.cfg.region, full_key
        )
    }

    /// Confirm the bucket is reachable. Degraded credentials are worth
    /// knowing about at startup rather than at first upload.
    pub async fn check_connection(&self) {
        match self.client.head_bucket().bucket(&self.cfg.bucket).send().await {
            Ok(_) => info!("Connected to S3 bucket: {}", self.cfg.bucket),
            Err(e) => warn!("S3 bucket {} not reachable: {}", self.cfg.bucket, e),
        }
    }

    /// Install an expiry rule on the artifact prefix so old videos age
    /// out of the bucket on their own.
    pub async fn apply_lifecycle_rule(&self) -> Result<(), StorageError> {
        let Some(days) = self.cfg.expire_days else {
            return Ok(());
        };

        let rule = LifecycleRule::builder()
            .id("expire-fusion-artifacts")
            .filter(LifecycleRuleFilter::builder().prefix(&self.cfg.prefix).build())
            .status(ExpirationStatus::Enabled)
            .expiration(LifecycleExpiration::builder().days(days).build())
            .build()
            .map_err(|e| StorageError::Lifecycle(e.to_string()))?;

        let lifecycle = BucketLifecycleConfiguration::builder()
            .rules(rule)
            .build()
            .map_err(|e| StorageError::Lifecycle(e.to_string()))?;

        self.client
            .put_bucket_lifecycle_configuration()
            .bucket(&self.cfg.bucket)
            .lifecycle_configuration(lifecycle)
            .send()
            .await
            .map_err(|e| StorageError::Lifecycle(e.to_string()))?;

        info!(
            "Lifecycle rule installed on {}: expire {}* after {} days",
            self.cfg.bucket, self.cfg.prefix, days
        );
        Ok(())
    }
}

#[async_trait]
impl ArtifactStore for S3ArtifactStore {
    async fn upload(&self, local_path: &Path, key: &str) -> Result<String, StorageError> {
        let full_key = self.full_key(key);
        let body = ByteStream::from_path(local_path)
            .await
            .map_err(|e| StorageError::Upload(e.to_string()))?;

        self.client
            .put_object()
            .bucket(&self.cfg.bucket)
            .key(&full_key)
            .body(body)
            .send()
            .await
            .map_err(|e| StorageError::Upload(e.to_string()))?;

        let url = self.object_url(&full_key);
        info!("Uploaded {} to s3://{}/{}", local_path.display(), self.cfg.bucket, full_key);
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_key_strips_specials() {
        assert_eq!(sanitize_key("final_j1.mp4"), "final_j1.mp4");
        assert_eq!(sanitize_key("a/b\\c:d*e.mp4"), "abcde.mp4");
        assert_eq!(sanitize_key("héllo vidéo.mp4"), "héllo vidéo.mp4");
    }

    fn bare_store(prefix: &str) -> S3ArtifactStore {
        S3ArtifactStore {
            client: Client::from_conf(
                aws_sdk_s3::Config::builder()
                    .behavior_version_latest()
                    .build(),
            ),
            cfg: S3Config {
                bucket: "fusion-artifacts".to_string(),
                region: "us-east-1".to_string(),
                prefix: prefix.to_string(),
                expire_days: None,
            },
        }
    }

    #[test]
    fn test_full_key_applies_prefix() {
        let store = bare_store("videos/");
        assert_eq!(store.full_key("final_j1.mp4"), "videos/final_j1.mp4");

        let store = bare_store("");
        assert_eq!(store.full_key("final_j1.mp4"), "final_j1.mp4");
    }

    #[test]
    fn test_object_url_shape() {
        let store = bare_store("videos/");
        assert_eq!(
            store.object_url("videos/final_j1.mp4"),
            "https://fusion-artifacts.s3.us-east-1.amazonaws.com/videos/final_j1.mp4"
        );
    }
}
