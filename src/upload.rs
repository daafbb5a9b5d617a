//! Two-phase external block ingestion
//!
//! Blocks produced outside the system enter the object store through a
//! begin → stream files → commit protocol. `begin` stages a sanitized
//! descriptor at `meta.json.temp`; files land under the block prefix; only
//! `commit` writes `meta.json`, the visibility flip. A half-finished upload
//! is therefore never visible to the fetcher.

use crate::block::meta::{
    BlockMeta, BlockSource, COMPACTOR_SHARD_ID_LABEL, DEPRECATED_SHARD_ID_LABEL,
    INGESTER_ID_LABEL, TENANT_ID_LABEL,
};
use crate::block::{block_file_path, meta_path, temp_meta_path, BlockId};
use crate::bucket::{Bucket, ObjectStoreBucket};
use crate::Error;

use bytes::Bytes;
use object_store::ObjectStore;
use regex::Regex;
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

/// The only paths a client may upload into a block: the index file and
/// six-digit chunk segments. `meta.json` is forbidden here by construction.
fn allowed_file_path() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(index|chunks/\d{6})$").expect("valid upload path pattern"))
}

/// Upload protocol failures, mapped onto the HTTP surface by the API layer.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    /// The client request is invalid (disallowed path, unknown labels,
    /// missing begin, empty body).
    #[error("{0}")]
    BadRequest(String),
    /// The block is already visible in the object store.
    #[error("block already exists in object storage")]
    Conflict,
    /// An internal read or write against the bucket failed.
    #[error("internal server error")]
    Internal(#[source] Error),
    /// A user-directed file upload failed upstream.
    #[error("failed uploading block file to bucket")]
    BadGateway(#[source] Error),
}

/// Accepts externally uploaded blocks, keyed by `(tenant, block)`.
pub struct BlockUploadService {
    store: Arc<dyn ObjectStore>,
}

impl BlockUploadService {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    fn bucket_for(&self, tenant_id: &str) -> ObjectStoreBucket {
        ObjectStoreBucket::new(Arc::clone(&self.store), tenant_id)
    }

    /// Start an upload: reject if the block is already visible, sanitize the
    /// client descriptor, and stage it at `meta.json.temp`.
    ///
    /// Staging is idempotent: a retried or concurrent `begin` for the same
    /// block simply rewrites the staged descriptor.
    pub async fn begin(
        &self,
        tenant_id: &str,
        block_id: BlockId,
        mut meta: BlockMeta,
    ) -> Result<(), UploadError> {
        debug!(tenant = tenant_id, block = %block_id, "starting block upload");
        let bucket = self.bucket_for(tenant_id);

        let exists = bucket
            .exists(&meta_path(&block_id))
            .await
            .map_err(UploadError::Internal)?;
        if exists {
            debug!(tenant = tenant_id, block = %block_id, "complete block already exists in object storage");
            return Err(UploadError::Conflict);
        }

        sanitize_meta(tenant_id, block_id, &mut meta)?;

        let payload = meta
            .encode()
            .map_err(UploadError::Internal)
            .map(Bytes::from)?;
        bucket
            .upload(&temp_meta_path(&block_id), payload)
            .await
            .map_err(UploadError::Internal)?;

        Ok(())
    }

    /// Store one block file under the block prefix. Requires `begin` to have
    /// staged the descriptor first.
    pub async fn upload_file(
        &self,
        tenant_id: &str,
        block_id: BlockId,
        path: &str,
        body: Bytes,
    ) -> Result<(), UploadError> {
        if path.is_empty() {
            return Err(UploadError::BadRequest(
                "missing or invalid file path".to_string(),
            ));
        }
        if path.rsplit('/').next() == Some("meta.json") {
            return Err(UploadError::BadRequest(
                "meta.json is not allowed".to_string(),
            ));
        }
        if !allowed_file_path().is_match(path) {
            return Err(UploadError::BadRequest(format!("invalid path: {path:?}")));
        }
        if body.is_empty() {
            return Err(UploadError::BadRequest("file cannot be empty".to_string()));
        }

        let bucket = self.bucket_for(tenant_id);

        let staged = bucket
            .exists(&temp_meta_path(&block_id))
            .await
            .map_err(UploadError::Internal)?;
        if !staged {
            return Err(UploadError::BadRequest(format!(
                "upload of block {block_id} not started yet"
            )));
        }

        let dst = block_file_path(&block_id, path);
        debug!(tenant = tenant_id, destination = %dst, size = body.len(), "uploading block file to bucket");

        bucket
            .upload(&dst, body)
            .await
            .map_err(UploadError::BadGateway)?;

        debug!(tenant = tenant_id, block = %block_id, path, "finished uploading block file to bucket");
        Ok(())
    }

    /// Promote the staged descriptor: write `meta.json` (the visibility
    /// flip), then clean up `meta.json.temp`.
    ///
    /// A crash between the two writes leaves an orphan temp descriptor
    /// behind; that is harmless and a retried commit tolerates it.
    pub async fn commit(&self, tenant_id: &str, block_id: BlockId) -> Result<(), UploadError> {
        let bucket = self.bucket_for(tenant_id);

        let staged = bucket
            .get(&temp_meta_path(&block_id))
            .await
            .map_err(UploadError::Internal)?;
        let meta = BlockMeta::decode(&staged).map_err(UploadError::Internal)?;

        debug!(
            tenant = tenant_id,
            block = %block_id,
            files = meta.files.len(),
            "completing block upload"
        );

        let payload = meta
            .encode()
            .map_err(UploadError::Internal)
            .map(Bytes::from)?;
        bucket
            .upload(&meta_path(&block_id), payload)
            .await
            .map_err(UploadError::Internal)?;

        bucket
            .delete(&temp_meta_path(&block_id))
            .await
            .map_err(UploadError::Internal)?;

        debug!(tenant = tenant_id, block = %block_id, "successfully completed block upload");
        Ok(())
    }
}

/// Enforce the block identity and the recognized external label set on a
/// client-provided descriptor.
///
/// The block ID and tenant label are overwritten with the authoritative
/// values, deprecated labels are silently stripped, anything else outside the
/// recognized set rejects the descriptor, and provenance is stamped as
/// `upload`. Idempotent: sanitizing a sanitized descriptor changes nothing.
pub fn sanitize_meta(
    tenant_id: &str,
    block_id: BlockId,
    meta: &mut BlockMeta,
) -> Result<(), UploadError> {
    meta.block_id = block_id;
    meta.labels
        .insert(TENANT_ID_LABEL.to_string(), tenant_id.to_string());

    let mut rejected = Vec::new();
    meta.labels.retain(|label, value| match label.as_str() {
        // Preserve these labels
        TENANT_ID_LABEL | COMPACTOR_SHARD_ID_LABEL => true,
        // Remove unused labels
        INGESTER_ID_LABEL | DEPRECATED_SHARD_ID_LABEL => {
            debug!(block = %block_id, label, value, "removing unused external label from uploaded meta.json");
            false
        }
        other => {
            rejected.push(other.to_string());
            false
        }
    });

    if !rejected.is_empty() {
        warn!(
            block = %block_id,
            tenant = tenant_id,
            labels = rejected.join(","),
            "rejecting unsupported external label(s) in uploaded meta.json"
        );
        return Err(UploadError::BadRequest(format!(
            "unsupported external label(s): {}",
            rejected.join(",")
        )));
    }

    meta.source = BlockSource::Upload;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::meta::{BlockCompaction, META_VERSION};
    use std::collections::BTreeMap;

    fn client_meta(block_id: BlockId) -> BlockMeta {
        BlockMeta {
            version: META_VERSION,
            block_id,
            min_time: 0,
            max_time: 1000,
            compaction: BlockCompaction {
                level: 1,
                sources: Vec::new(),
            },
            labels: BTreeMap::new(),
            source: BlockSource::Ingester,
            files: Vec::new(),
        }
    }

    #[test]
    fn allowed_upload_paths() {
        let re = allowed_file_path();
        assert!(re.is_match("index"));
        assert!(re.is_match("chunks/000001"));
        assert!(!re.is_match("chunks/00A123"));
        assert!(!re.is_match("chunks/0000001"));
        assert!(!re.is_match("meta.json"));
        assert!(!re.is_match("chunks/../index"));
    }

    #[test]
    fn sanitize_overrides_identity_and_stamps_source() {
        let id = BlockId::new();
        let mut meta = client_meta(BlockId::new());
        meta.labels
            .insert(TENANT_ID_LABEL.to_string(), "spoofed".to_string());

        sanitize_meta("user-1", id, &mut meta).unwrap();

        assert_eq!(meta.block_id, id);
        assert_eq!(meta.tenant_id(), Some("user-1"));
        assert_eq!(meta.source, BlockSource::Upload);
    }

    #[test]
    fn sanitize_strips_deprecated_and_rejects_unknown_labels() {
        let id = BlockId::new();

        let mut meta = client_meta(id);
        meta.labels
            .insert(INGESTER_ID_LABEL.to_string(), "ingester-0".to_string());
        meta.labels
            .insert(DEPRECATED_SHARD_ID_LABEL.to_string(), "3".to_string());
        sanitize_meta("user-1", id, &mut meta).unwrap();
        assert!(!meta.labels.contains_key(INGESTER_ID_LABEL));
        assert!(!meta.labels.contains_key(DEPRECATED_SHARD_ID_LABEL));

        let mut meta = client_meta(id);
        meta.labels
            .insert("cluster".to_string(), "dev".to_string());
        let err = sanitize_meta("user-1", id, &mut meta).unwrap_err();
        assert!(matches!(err, UploadError::BadRequest(msg) if msg.contains("cluster")));
    }

    #[test]
    fn sanitize_is_idempotent() {
        let id = BlockId::new();
        let mut meta = client_meta(id);
        meta.labels
            .insert(COMPACTOR_SHARD_ID_LABEL.to_string(), "1_of_4".to_string());

        sanitize_meta("user-1", id, &mut meta).unwrap();
        let once = meta.clone();
        sanitize_meta("user-1", id, &mut meta).unwrap();

        assert_eq!(meta, once);
    }
}
