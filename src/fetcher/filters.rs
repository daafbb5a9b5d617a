//! Filters applied to the fetched meta set
//!
//! Filters run in registration order and may delete entries from the meta
//! map or mutate descriptors in flight. Every drop or mutation is accounted
//! for on the staging gauges so the published sync counts stay consistent.

use crate::block::{deletion_mark_path, BlockId, BlockMeta, DeletionMark};
use crate::bucket::Bucket;
use crate::clock::BoundedClock;
use crate::fetcher::metrics::{TxGaugeVec, MARKED_FOR_DELETION_META, TOO_FRESH_META};
use crate::{Error, Result};

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A pluggable filter over the fetched meta set.
#[async_trait]
pub trait MetaFilter: Send + Sync {
    /// Filter name for logs.
    fn name(&self) -> &'static str;

    /// Inspect and possibly shrink or mutate `metas`, accounting for every
    /// removal on `synced` and every mutation on `modified`.
    async fn filter(
        &self,
        shutdown: &CancellationToken,
        metas: &mut HashMap<BlockId, Arc<BlockMeta>>,
        synced: &TxGaugeVec,
        modified: &TxGaugeVec,
    ) -> Result<()>;
}

/// Removes blocks younger than the consistency delay.
///
/// A freshly uploaded level-1 block may not be durable yet across an
/// eventually consistent store, so it is hidden until its identifier age
/// exceeds the delay. Compactor output is exempt: it is written by the same
/// party that syncs.
pub struct ConsistencyDelayFilter {
    delay: Duration,
    clock: Arc<BoundedClock>,
}

impl ConsistencyDelayFilter {
    pub fn new(delay: Duration, clock: Arc<BoundedClock>) -> Self {
        Self { delay, clock }
    }
}

#[async_trait]
impl MetaFilter for ConsistencyDelayFilter {
    fn name(&self) -> &'static str {
        "consistency-delay"
    }

    async fn filter(
        &self,
        _shutdown: &CancellationToken,
        metas: &mut HashMap<BlockId, Arc<BlockMeta>>,
        synced: &TxGaugeVec,
        _modified: &TxGaugeVec,
    ) -> Result<()> {
        let now_millis = self.clock.now_millis();
        let delay_millis = self.delay.as_millis() as i64;

        metas.retain(|id, meta| {
            let age = now_millis - id.creation_time_millis();
            if age < delay_millis && !meta.source.is_compaction_output() {
                debug!(block = %id, age_ms = age, "block is too fresh for now");
                synced.inc(TOO_FRESH_META);
                return false;
            }
            true
        });

        Ok(())
    }
}

/// Removes blocks whose deletion mark has aged beyond the configured delay.
///
/// The delay keeps a marked block visible long enough for its replacement to
/// be fetched first. All encountered marks are published through
/// [`IgnoreDeletionMarkFilter::deletion_marks`] regardless of the delay, so
/// the deleter can act on them.
pub struct IgnoreDeletionMarkFilter {
    bucket: Arc<dyn Bucket>,
    delay: Duration,
    concurrency: usize,
    clock: Arc<BoundedClock>,

    marks: Mutex<HashMap<BlockId, DeletionMark>>,
}

impl IgnoreDeletionMarkFilter {
    pub fn new(
        bucket: Arc<dyn Bucket>,
        delay: Duration,
        concurrency: usize,
        clock: Arc<BoundedClock>,
    ) -> Self {
        Self {
            bucket,
            delay,
            concurrency: concurrency.max(1),
            clock,
            marks: Mutex::new(HashMap::new()),
        }
    }

    /// Deletion marks observed by the last filter run.
    pub fn deletion_marks(&self) -> HashMap<BlockId, DeletionMark> {
        self.marks.lock().clone()
    }

    /// Probe one block's deletion mark. Absence is not an error; an
    /// unparseable mark is logged and skipped.
    async fn probe(&self, id: BlockId) -> Result<Option<DeletionMark>> {
        let bytes = match self.bucket.get(&deletion_mark_path(&id)).await {
            Ok(bytes) => bytes,
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(err),
        };

        match serde_json::from_slice::<DeletionMark>(&bytes) {
            Ok(mark) => Ok(Some(mark)),
            Err(err) => {
                warn!(
                    block = %id,
                    %err,
                    "found partial deletion-mark.json; if this keeps happening for the same block, consider deleting the mark from the object storage manually"
                );
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl MetaFilter for IgnoreDeletionMarkFilter {
    fn name(&self) -> &'static str {
        "ignore-deletion-mark"
    }

    async fn filter(
        &self,
        shutdown: &CancellationToken,
        metas: &mut HashMap<BlockId, Arc<BlockMeta>>,
        synced: &TxGaugeVec,
        _modified: &TxGaugeVec,
    ) -> Result<()> {
        // Snapshot the IDs up front so the probe fan-out never races the map.
        let ids: Vec<BlockId> = metas.keys().copied().collect();

        let mut probes = futures::stream::iter(
            ids.into_iter()
                .map(|id| async move { (id, self.probe(id).await) }),
        )
        .buffer_unordered(self.concurrency);

        let mut marks: HashMap<BlockId, DeletionMark> = HashMap::new();
        let mut last_err: Option<Error> = None;

        while let Some((id, probed)) = probes.next().await {
            if shutdown.is_cancelled() {
                return Err(Error::Cancelled);
            }

            match probed {
                Ok(Some(mark)) => {
                    marks.insert(id, mark);
                }
                Ok(None) => {}
                // Remember the failure but keep draining: marks from
                // successful probes are still published.
                Err(err) => last_err = Some(err),
            }
        }
        drop(probes);

        // Double-buffered: the new map is built locally, then installed.
        *self.marks.lock() = marks.clone();

        let delay_millis = self.delay.as_millis() as i64;
        for (id, mark) in &marks {
            if self.clock.age_millis(mark.deletion_time * 1000) > delay_millis
                && metas.remove(id).is_some()
            {
                synced.inc(MARKED_FOR_DELETION_META);
            }
        }

        match last_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
