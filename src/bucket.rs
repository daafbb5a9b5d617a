//! Tenant-scoped object store access
//!
//! The sync, filter, readiness-gate, and upload paths all talk to the object
//! store through the [`Bucket`] capability set rather than a concrete
//! backend. Implementations must translate "object absent" into an error
//! recognized by [`Error::is_not_found`]; every other error propagates.

use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use object_store::path::Path as ObjPath;
use object_store::ObjectStore;
use std::sync::Arc;

/// Attributes of a stored object, as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectAttributes {
    /// When the object was last written. The readiness gate uses this as the
    /// authoritative upload time of a block.
    pub last_modified: DateTime<Utc>,
    /// Object size in bytes.
    pub size_bytes: u64,
}

/// Capability set over a tenant's slice of the object store.
///
/// Safe for concurrent use. Paths are relative to the tenant prefix.
#[async_trait]
pub trait Bucket: Send + Sync {
    /// Whether an object exists at `path`.
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Read the full object at `path`.
    async fn get(&self, path: &str) -> Result<Bytes>;

    /// Write `payload` at `path`, replacing any existing object.
    async fn upload(&self, path: &str, payload: Bytes) -> Result<()>;

    /// Delete the object at `path`.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Names of the immediate child directories under the tenant root,
    /// trailing delimiter included (e.g. `<block id>/`).
    async fn list_block_dirs(&self) -> Result<Vec<String>>;

    /// Attributes of the object at `path`.
    async fn attributes(&self, path: &str) -> Result<ObjectAttributes>;
}

/// [`Bucket`] implementation over an `object_store` backend, scoping every
/// operation under a per-tenant prefix.
pub struct ObjectStoreBucket {
    store: Arc<dyn ObjectStore>,
    tenant_prefix: String,
}

impl ObjectStoreBucket {
    pub fn new(store: Arc<dyn ObjectStore>, tenant_id: &str) -> Self {
        Self {
            store,
            tenant_prefix: tenant_id.to_string(),
        }
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_prefix
    }

    fn full_path(&self, path: &str) -> ObjPath {
        ObjPath::from(format!("{}/{}", self.tenant_prefix, path))
    }
}

#[async_trait]
impl Bucket for ObjectStoreBucket {
    async fn exists(&self, path: &str) -> Result<bool> {
        match self.store.head(&self.full_path(path)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, path: &str) -> Result<Bytes> {
        let result = self.store.get(&self.full_path(path)).await?;
        Ok(result.bytes().await?)
    }

    async fn upload(&self, path: &str, payload: Bytes) -> Result<()> {
        self.store.put(&self.full_path(path), payload.into()).await?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.store.delete(&self.full_path(path)).await?;
        Ok(())
    }

    async fn list_block_dirs(&self) -> Result<Vec<String>> {
        let prefix = ObjPath::from(self.tenant_prefix.clone());
        let listing = self.store.list_with_delimiter(Some(&prefix)).await?;

        Ok(listing
            .common_prefixes
            .iter()
            .filter_map(|p| p.parts().last().map(|part| format!("{}/", part.as_ref())))
            .collect())
    }

    async fn attributes(&self, path: &str) -> Result<ObjectAttributes> {
        let meta = self.store.head(&self.full_path(path)).await?;
        Ok(ObjectAttributes {
            last_modified: meta.last_modified,
            size_bytes: meta.size as u64,
        })
    }
}
