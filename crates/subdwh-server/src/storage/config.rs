use serde::{Deserialize, Serialize};
use std::env;

/// Package binaries and `.spkg` files live here in every deployment.
pub const DEFAULT_PACKAGE_BUCKET: &str = "spkg_bucket";

const DATA_BUCKET_PREFIX: &str = "data-warehouse-load-427049689281";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub endpoint: Option<String>,
    pub region: String,
    /// Bucket holding produced output files, status ledger and cursor
    pub bucket: String,
    /// Bucket holding packages and the package binary
    pub package_bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub path_style: bool,
}

impl StorageConfig {
    /// Read `S3_*` variables; `deployment` picks the default data bucket.
    pub fn from_env(deployment: &str) -> anyhow::Result<Self> {
        Ok(Self {
            endpoint: env::var("S3_ENDPOINT").ok(),
            region: env::var("S3_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
            bucket: env::var("S3_BUCKET").unwrap_or_else(|_| default_data_bucket(deployment)),
            package_bucket: env::var("S3_PACKAGE_BUCKET")
                .unwrap_or_else(|_| DEFAULT_PACKAGE_BUCKET.to_string()),
            access_key: env::var("S3_ACCESS_KEY")
                .or_else(|_| env::var("AWS_ACCESS_KEY_ID"))
                .unwrap_or_default(),
            secret_key: env::var("S3_SECRET_KEY")
                .or_else(|_| env::var("AWS_SECRET_ACCESS_KEY"))
                .unwrap_or_default(),
            path_style: env::var("S3_PATH_STYLE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(false),
        })
    }

    pub fn for_minio(endpoint: impl Into<String>, bucket: impl Into<String>) -> Self {
        let bucket = bucket.into();
        Self {
            endpoint: Some(endpoint.into()),
            region: "us-east-1".to_string(),
            package_bucket: bucket.clone(),
            bucket,
            access_key: "minioadmin".to_string(),
            secret_key: "minioadmin".to_string(),
            path_style: true,
        }
    }

    /// Static credentials were supplied; otherwise the default AWS chain is used.
    pub fn has_static_credentials(&self) -> bool {
        !self.access_key.is_empty() && !self.secret_key.is_empty()
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bucket.is_empty() {
            anyhow::bail!("S3_BUCKET cannot be empty");
        }
        if self.package_bucket.is_empty() {
            anyhow::bail!("S3_PACKAGE_BUCKET cannot be empty");
        }
        Ok(())
    }
}

pub fn default_data_bucket(deployment: &str) -> String {
    format!("{}-{}", DATA_BUCKET_PREFIX, deployment)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_minio_shares_bucket() {
        let config = StorageConfig::for_minio("http://localhost:9000", "test-bucket");
        assert_eq!(config.endpoint.as_deref(), Some("http://localhost:9000"));
        assert_eq!(config.bucket, "test-bucket");
        assert_eq!(config.package_bucket, "test-bucket");
        assert!(config.path_style);
        assert!(config.has_static_credentials());
    }

    #[test]
    fn test_default_data_bucket_follows_deployment() {
        assert_eq!(
            default_data_bucket("stage"),
            "data-warehouse-load-427049689281-stage"
        );
    }

    #[test]
    fn test_validate_rejects_empty_bucket() {
        let mut config = StorageConfig::for_minio("http://localhost:9000", "b");
        config.bucket.clear();
        assert!(config.validate().is_err());
    }
}
