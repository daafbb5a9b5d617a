//! Block descriptors (`meta.json`) and deletion marks
//!
//! A block is *visible* iff its `meta.json` exists in the object store; the
//! descriptor is always the last object written. The descriptor carries the
//! schema version, time bounds, compaction lineage, external labels, and the
//! list of data files.

use crate::block::{BlockId, META_FILENAME};
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::path::Path;

/// The only descriptor schema version this process understands. A block with
/// any other version is rejected (fatal for the block, not for the sync).
pub const META_VERSION: i32 = 1;

/// External label naming the tenant that owns the block.
pub const TENANT_ID_LABEL: &str = "__tenant_id__";
/// External label naming the compactor shard a split block belongs to.
pub const COMPACTOR_SHARD_ID_LABEL: &str = "__compactor_shard_id__";
/// Deprecated ingester label, silently stripped at upload.
pub const INGESTER_ID_LABEL: &str = "__ingester_id__";
/// Deprecated shard label, silently stripped at upload.
pub const DEPRECATED_SHARD_ID_LABEL: &str = "__shard_id__";

/// Provenance of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BlockSource {
    /// Freshly ingested level-1 block, uploaded by an ingester.
    Ingester,
    /// Output of a regular compaction.
    Compactor,
    /// Output of a compactor repair pass.
    CompactorRepair,
    /// Output of an offline bucket repair.
    BucketRepair,
    /// Block ingested through the two-phase upload protocol.
    Upload,
}

impl BlockSource {
    /// Blocks written by the compacting party itself need no consistency
    /// delay: the writer and the reader are the same process group.
    pub fn is_compaction_output(&self) -> bool {
        matches!(
            self,
            BlockSource::Compactor | BlockSource::CompactorRepair | BlockSource::BucketRepair
        )
    }
}

/// A non-meta file belonging to a block.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BlockFile {
    /// Path relative to the block directory, e.g. `index` or `chunks/000001`.
    pub path: String,
    /// Size in bytes.
    #[serde(default, rename = "size")]
    pub size_bytes: u64,
}

/// Compaction lineage of a block.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BlockCompaction {
    /// Generation count: 1 = freshly ingested, >1 = compactor output.
    pub level: u32,
    /// Level-1 ancestors this block was derived from.
    #[serde(default)]
    pub sources: Vec<BlockId>,
}

/// In-memory representation of a block's `meta.json`.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BlockMeta {
    /// Descriptor schema version; must equal [`META_VERSION`].
    pub version: i32,
    /// The block's identifier. Redundant with the directory name, kept in the
    /// descriptor so a descriptor alone is self-describing.
    #[serde(rename = "id")]
    pub block_id: BlockId,
    /// Inclusive lower time bound, unix milliseconds.
    #[serde(rename = "mint")]
    pub min_time: i64,
    /// Exclusive upper time bound, unix milliseconds.
    #[serde(rename = "maxt")]
    pub max_time: i64,
    /// Compaction level and source lineage.
    pub compaction: BlockCompaction,
    /// External labels (tenant ID, shard ID, ...).
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Provenance tag.
    pub source: BlockSource,
    /// Descriptors of the block's non-meta contents.
    #[serde(default)]
    pub files: Vec<BlockFile>,
}

impl BlockMeta {
    pub fn tenant_id(&self) -> Option<&str> {
        self.labels.get(TENANT_ID_LABEL).map(String::as_str)
    }

    pub fn compactor_shard_id(&self) -> Option<&str> {
        self.labels.get(COMPACTOR_SHARD_ID_LABEL).map(String::as_str)
    }

    pub fn compaction_level(&self) -> u32 {
        self.compaction.level
    }

    /// Decode a descriptor, enforcing the schema version.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let meta: BlockMeta =
            serde_json::from_slice(bytes).map_err(|e| Error::MetaCorrupted(e.to_string()))?;
        if meta.version != META_VERSION {
            return Err(Error::UnexpectedMetaVersion {
                version: meta.version,
            });
        }
        Ok(meta)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Read a cached descriptor from a local block directory.
    pub async fn read_from_dir(block_dir: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(block_dir.join(META_FILENAME)).await?;
        Self::decode(&bytes)
    }

    /// Write the descriptor into a local block directory.
    pub async fn write_to_dir(&self, block_dir: &Path) -> Result<()> {
        tokio::fs::create_dir_all(block_dir).await?;
        tokio::fs::write(block_dir.join(META_FILENAME), self.encode()?).await?;
        Ok(())
    }
}

/// Optional per-block marker turning the block into a deletion candidate.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DeletionMark {
    /// The marked block.
    #[serde(rename = "id")]
    pub block_id: BlockId,
    /// When the block became a deletion candidate, unix seconds.
    #[serde(rename = "deletionTime")]
    pub deletion_time: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_meta() -> BlockMeta {
        let id = BlockId::new();
        BlockMeta {
            version: META_VERSION,
            block_id: id,
            min_time: 1000,
            max_time: 2000,
            compaction: BlockCompaction {
                level: 1,
                sources: vec![id],
            },
            labels: BTreeMap::from([(TENANT_ID_LABEL.to_string(), "tenant-1".to_string())]),
            source: BlockSource::Ingester,
            files: vec![BlockFile {
                path: "index".to_string(),
                size_bytes: 128,
            }],
        }
    }

    #[test]
    fn descriptor_json_field_names() {
        let meta = sample_meta();
        let json: serde_json::Value = serde_json::from_slice(&meta.encode().unwrap()).unwrap();

        assert_eq!(json["version"], META_VERSION);
        assert_eq!(json["mint"], 1000);
        assert_eq!(json["maxt"], 2000);
        assert_eq!(json["source"], "ingester");
        assert_eq!(json["compaction"]["level"], 1);
        assert_eq!(json["files"][0]["size"], 128);
    }

    #[test]
    fn decode_round_trips() {
        let meta = sample_meta();
        let decoded = BlockMeta::decode(&meta.encode().unwrap()).unwrap();
        assert_eq!(decoded, meta);
    }

    #[test]
    fn decode_rejects_unknown_version() {
        let mut meta = sample_meta();
        meta.version = 2;
        let err = BlockMeta::decode(&serde_json::to_vec(&meta).unwrap()).unwrap_err();
        assert!(matches!(
            err,
            Error::UnexpectedMetaVersion { version: 2 }
        ));
    }

    #[test]
    fn decode_classifies_garbage_as_corrupted() {
        let err = BlockMeta::decode(b"{not json").unwrap_err();
        assert!(matches!(err, Error::MetaCorrupted(_)));
    }

    #[test]
    fn source_kebab_case_and_delay_exemptions() {
        assert_eq!(
            serde_json::to_string(&BlockSource::CompactorRepair).unwrap(),
            "\"compactor-repair\""
        );
        assert!(BlockSource::Compactor.is_compaction_output());
        assert!(BlockSource::BucketRepair.is_compaction_output());
        assert!(!BlockSource::Ingester.is_compaction_output());
        assert!(!BlockSource::Upload.is_compaction_output());
    }
}
