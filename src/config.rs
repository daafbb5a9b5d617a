//! Component factory for environment-based configuration
//!
//! Factory methods to create the object store and the compactor from
//! environment variables, enabling easy switching between development and
//! production configurations.

use crate::compactor::{Compactor, CompactorConfig};
use crate::Result;
use object_store::{aws::AmazonS3Builder, memory::InMemory, ObjectStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub struct ComponentFactory;

impl ComponentFactory {
    /// Create object store from environment
    ///
    /// Environment variables:
    /// - STORAGE_BACKEND: "memory" (default) or "s3"
    /// - S3_BUCKET: S3 bucket name (required for s3)
    /// - S3_REGION: S3 region (default: us-east-1)
    /// - S3_ENDPOINT: Custom S3 endpoint (optional, for MinIO)
    /// - AWS_ACCESS_KEY_ID: AWS credentials (optional, uses IAM role if not set)
    /// - AWS_SECRET_ACCESS_KEY: AWS credentials (optional)
    pub async fn create_object_store() -> Result<Arc<dyn ObjectStore>> {
        let backend = std::env::var("STORAGE_BACKEND").unwrap_or_else(|_| "memory".to_string());

        match backend.as_str() {
            "memory" => {
                info!("Using in-memory object store (development mode)");
                Ok(Arc::new(InMemory::new()))
            }
            "s3" => {
                let bucket = std::env::var("S3_BUCKET").map_err(|_| {
                    crate::Error::Config("S3_BUCKET required when STORAGE_BACKEND=s3".to_string())
                })?;
                let region = std::env::var("S3_REGION").unwrap_or_else(|_| "us-east-1".to_string());

                info!("Using S3 object store: bucket={}, region={}", bucket, region);

                let mut builder = AmazonS3Builder::new()
                    .with_bucket_name(&bucket)
                    .with_region(&region);

                // Support custom endpoints (MinIO, LocalStack)
                if let Ok(endpoint) = std::env::var("S3_ENDPOINT") {
                    info!("Using custom S3 endpoint: {}", endpoint);
                    builder = builder.with_endpoint(&endpoint).with_allow_http(true);
                }

                // Use explicit credentials if provided, otherwise use IAM role
                if let Ok(key) = std::env::var("AWS_ACCESS_KEY_ID") {
                    builder = builder.with_access_key_id(&key);
                }
                if let Ok(secret) = std::env::var("AWS_SECRET_ACCESS_KEY") {
                    builder = builder.with_secret_access_key(&secret);
                }

                Ok(Arc::new(builder.build()?))
            }
            _ => Err(crate::Error::Config(format!(
                "Unknown STORAGE_BACKEND: {}. Use 'memory' or 's3'",
                backend
            ))),
        }
    }

    /// Create a compactor from environment
    ///
    /// Environment variables:
    /// - BLOCKSYNC_TENANT_ID: tenant to coordinate (default: "default")
    /// - BLOCKSYNC_META_SYNC_CONCURRENCY: concurrent meta.json loads
    /// - BLOCKSYNC_CACHE_DIR: local meta.json cache directory (optional)
    /// - BLOCKSYNC_CONSISTENCY_DELAY_SECS: consistency delay
    /// - BLOCKSYNC_DELETION_MARK_DELAY_SECS: deletion-mark delay
    /// - BLOCKSYNC_WAIT_PERIOD_SECS: job readiness wait period
    /// - BLOCKSYNC_CHECK_INTERVAL_SECS: planning cycle interval
    pub async fn create_compactor(store: Arc<dyn ObjectStore>) -> Result<Compactor> {
        let tenant_id =
            std::env::var("BLOCKSYNC_TENANT_ID").unwrap_or_else(|_| "default".to_string());

        let defaults = CompactorConfig::default();
        let config = CompactorConfig {
            meta_sync_concurrency: parse_env_usize(
                "BLOCKSYNC_META_SYNC_CONCURRENCY",
                defaults.meta_sync_concurrency,
            )?,
            cache_dir: std::env::var("BLOCKSYNC_CACHE_DIR").ok().map(PathBuf::from),
            consistency_delay: parse_env_secs(
                "BLOCKSYNC_CONSISTENCY_DELAY_SECS",
                defaults.consistency_delay,
            )?,
            deletion_mark_delay: parse_env_secs(
                "BLOCKSYNC_DELETION_MARK_DELAY_SECS",
                defaults.deletion_mark_delay,
            )?,
            wait_period: parse_env_secs("BLOCKSYNC_WAIT_PERIOD_SECS", defaults.wait_period)?,
            block_ranges: defaults.block_ranges.clone(),
            check_interval: parse_env_secs(
                "BLOCKSYNC_CHECK_INTERVAL_SECS",
                defaults.check_interval,
            )?,
        };

        info!(
            tenant = %tenant_id,
            concurrency = config.meta_sync_concurrency,
            consistency_delay_secs = config.consistency_delay.as_secs(),
            deletion_mark_delay_secs = config.deletion_mark_delay.as_secs(),
            wait_period_secs = config.wait_period.as_secs(),
            "Creating compactor"
        );

        Compactor::new(config, store, tenant_id)
    }
}

fn parse_env_usize(name: &str, default: usize) -> Result<usize> {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse::<usize>().map_err(|e| {
            crate::Error::Config(format!("{name} must be a positive integer: {e}"))
        }),
        Err(_) => Ok(default),
    }
}

fn parse_env_secs(name: &str, default: Duration) -> Result<Duration> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|e| crate::Error::Config(format!("{name} must be seconds: {e}"))),
        Err(_) => Ok(default),
    }
}
