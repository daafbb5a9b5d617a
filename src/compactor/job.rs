//! Compaction jobs and the job-readiness gate

use crate::block::{meta_path, BlockId, BlockMeta};
use crate::bucket::Bucket;
use crate::clock::BoundedClock;
use crate::{Error, Result};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A unit of compaction work: an ordered set of blocks of one tenant and one
/// shard, covering one time range.
///
/// `append_meta` is the only mutator; once the planner has sealed a job it is
/// treated as immutable.
#[derive(Debug, Clone)]
pub struct Job {
    tenant_id: String,
    key: String,
    shard_labels: BTreeMap<String, String>,
    resolution: i64,
    use_split: bool,
    shard_id: String,

    /// Ordered by (min time, block ID).
    metas: Vec<Arc<BlockMeta>>,
    min_compaction_level: Option<u32>,
}

impl Job {
    pub fn new(
        tenant_id: impl Into<String>,
        key: impl Into<String>,
        shard_labels: BTreeMap<String, String>,
        resolution: i64,
        use_split: bool,
        shard_id: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            key: key.into(),
            shard_labels,
            resolution,
            use_split,
            shard_id: shard_id.into(),
            metas: Vec::new(),
            min_compaction_level: None,
        }
    }

    /// Add a block to the job, keeping the meta ordering and the cached
    /// minimum compaction level up to date.
    pub fn append_meta(&mut self, meta: Arc<BlockMeta>) -> Result<()> {
        if let Some(tenant) = meta.tenant_id() {
            if tenant != self.tenant_id {
                return Err(Error::Metadata(format!(
                    "block {} belongs to tenant {} not {}",
                    meta.block_id, tenant, self.tenant_id
                )));
            }
        }

        let level = meta.compaction_level();
        self.min_compaction_level = Some(match self.min_compaction_level {
            Some(current) => current.min(level),
            None => level,
        });

        let at = self
            .metas
            .partition_point(|m| (m.min_time, m.block_id) <= (meta.min_time, meta.block_id));
        self.metas.insert(at, meta);
        Ok(())
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn shard_labels(&self) -> &BTreeMap<String, String> {
        &self.shard_labels
    }

    pub fn resolution(&self) -> i64 {
        self.resolution
    }

    pub fn use_split(&self) -> bool {
        self.use_split
    }

    pub fn shard_id(&self) -> &str {
        &self.shard_id
    }

    pub fn metas(&self) -> &[Arc<BlockMeta>] {
        &self.metas
    }

    pub fn block_ids(&self) -> Vec<BlockId> {
        self.metas.iter().map(|m| m.block_id).collect()
    }

    /// Lower time bound of the job, from the earliest block.
    pub fn min_time(&self) -> i64 {
        self.metas.first().map(|m| m.min_time).unwrap_or(0)
    }

    /// Upper time bound of the job, from the latest-ending block.
    pub fn max_time(&self) -> i64 {
        self.metas.iter().map(|m| m.max_time).max().unwrap_or(0)
    }

    /// Minimum compaction level across all appended blocks.
    pub fn min_compaction_level(&self) -> u32 {
        self.min_compaction_level.unwrap_or(0)
    }

    /// Total number of level-1 ancestors across the job's blocks.
    pub fn source_count(&self) -> usize {
        self.metas.iter().map(|m| m.compaction.sources.len()).sum()
    }
}

/// Error from the readiness gate, carrying the block whose probe failed.
#[derive(Debug, thiserror::Error)]
#[error("checking upload age of block {}: {source}", .meta.block_id)]
pub struct WaitPeriodError {
    pub meta: Arc<BlockMeta>,
    #[source]
    pub source: Error,
}

/// Outcome of the readiness gate.
#[derive(Debug, Clone)]
pub enum WaitPeriodCheck {
    /// Every level-1 block is older than the wait period; the job may start.
    Elapsed,
    /// The given block was uploaded within the wait period; the job is not
    /// ready yet.
    TooFresh(Arc<BlockMeta>),
}

/// Decide whether a job may start now, based on the upload age of its
/// level-1 blocks.
///
/// Level-1 blocks were uploaded by ingesters and may not yet be fully
/// consistent in the object store; the upload time reported by the store is
/// the authoritative signal. Level >1 blocks are compactor output and are
/// exempt. A probe failure is authoritative: probing stops and the failing
/// block is reported.
pub async fn job_wait_period_elapsed(
    shutdown: &CancellationToken,
    job: &Job,
    wait_period: Duration,
    bucket: &dyn Bucket,
    clock: &BoundedClock,
) -> std::result::Result<WaitPeriodCheck, WaitPeriodError> {
    if wait_period.is_zero() {
        return Ok(WaitPeriodCheck::Elapsed);
    }

    let wait_millis = wait_period.as_millis() as i64;

    for meta in job.metas() {
        if meta.compaction_level() != 1 {
            continue;
        }

        if shutdown.is_cancelled() {
            return Err(WaitPeriodError {
                meta: Arc::clone(meta),
                source: Error::Cancelled,
            });
        }

        let attrs = match bucket.attributes(&meta_path(&meta.block_id)).await {
            Ok(attrs) => attrs,
            Err(source) => {
                return Err(WaitPeriodError {
                    meta: Arc::clone(meta),
                    source,
                })
            }
        };

        let age = clock.now_millis() - attrs.last_modified.timestamp_millis();
        if age < wait_millis {
            return Ok(WaitPeriodCheck::TooFresh(Arc::clone(meta)));
        }
    }

    Ok(WaitPeriodCheck::Elapsed)
}
