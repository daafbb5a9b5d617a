//! Compaction planning: grouping compactable blocks into jobs
//!
//! Blocks are grouped per (compactor shard, aligned time range): each block
//! is assigned to the smallest configured range whose aligned window fully
//! contains it, and windows holding at least two blocks become jobs. Blocks
//! that still carry no shard label are level-1 ingester output and produce
//! split jobs; sharded blocks produce merge jobs.

use crate::block::{BlockId, BlockMeta};
use crate::compactor::job::Job;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Groups the filtered meta set of one tenant into compaction jobs.
pub struct Planner {
    /// Ascending range widths, milliseconds.
    block_ranges: Vec<i64>,
}

impl Planner {
    pub fn new(block_ranges: &[Duration]) -> Self {
        let mut ranges: Vec<i64> = block_ranges
            .iter()
            .map(|r| r.as_millis() as i64)
            .filter(|r| *r > 0)
            .collect();
        ranges.sort_unstable();
        ranges.dedup();

        if ranges.is_empty() {
            // A single two hour range keeps the planner functional even with
            // an empty configuration.
            ranges.push(2 * 3_600_000);
        }

        Self { block_ranges: ranges }
    }

    /// The smallest configured range whose aligned window fully contains the
    /// block, together with the window start. Blocks wider than every range
    /// fall back to the largest one.
    fn range_for(&self, meta: &BlockMeta) -> (i64, i64) {
        for range in &self.block_ranges {
            let start = meta.min_time - meta.min_time.rem_euclid(*range);
            if meta.max_time <= start + range {
                return (*range, start);
            }
        }

        let largest = *self.block_ranges.last().unwrap_or(&3_600_000);
        (largest, meta.min_time - meta.min_time.rem_euclid(largest))
    }

    /// Group `metas` into jobs, smallest ranges first. Deterministic for a
    /// given meta set.
    pub fn plan(&self, tenant_id: &str, metas: &HashMap<BlockId, Arc<BlockMeta>>) -> Vec<Job> {
        // BTreeMap keyed by (range, window start, shard) gives the output
        // ordering for free.
        let mut groups: BTreeMap<(i64, i64, String), Vec<Arc<BlockMeta>>> = BTreeMap::new();

        for meta in metas.values() {
            let (range, start) = self.range_for(meta);
            let shard = meta.compactor_shard_id().unwrap_or_default().to_string();
            groups
                .entry((range, start, shard))
                .or_default()
                .push(Arc::clone(meta));
        }

        let mut jobs = Vec::new();
        for ((range, start, shard), group) in groups {
            if group.len() < 2 {
                continue;
            }

            // Unsharded groups are level-1 ingester output waiting to be
            // split; sharded groups get merged within their shard.
            let use_split = shard.is_empty();
            let key = format!("{start}@{range}@{shard}");

            let shard_labels: BTreeMap<String, String> = group[0]
                .labels
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();

            let mut job = Job::new(tenant_id, key, shard_labels, 0, use_split, shard);
            for meta in group {
                if let Err(err) = job.append_meta(meta) {
                    warn!(job = job.key(), %err, "skipping block while planning job");
                }
            }

            if job.metas().len() >= 2 {
                jobs.push(job);
            }
        }

        jobs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::meta::{
        BlockCompaction, BlockSource, COMPACTOR_SHARD_ID_LABEL, META_VERSION, TENANT_ID_LABEL,
    };

    const TWO_HOURS: i64 = 2 * 3_600_000;

    fn planner() -> Planner {
        Planner::new(&[
            Duration::from_secs(2 * 3600),
            Duration::from_secs(12 * 3600),
        ])
    }

    fn meta(min_time: i64, max_time: i64, shard: Option<&str>) -> Arc<BlockMeta> {
        let mut labels = BTreeMap::from([(TENANT_ID_LABEL.to_string(), "user-1".to_string())]);
        if let Some(shard) = shard {
            labels.insert(COMPACTOR_SHARD_ID_LABEL.to_string(), shard.to_string());
        }

        Arc::new(BlockMeta {
            version: META_VERSION,
            block_id: BlockId::new(),
            min_time,
            max_time,
            compaction: BlockCompaction {
                level: 1,
                sources: Vec::new(),
            },
            labels,
            source: BlockSource::Ingester,
            files: Vec::new(),
        })
    }

    fn metas_map(metas: &[Arc<BlockMeta>]) -> HashMap<BlockId, Arc<BlockMeta>> {
        metas.iter().map(|m| (m.block_id, Arc::clone(m))).collect()
    }

    #[test]
    fn overlapping_blocks_in_one_window_form_a_job() {
        let metas = metas_map(&[
            meta(0, TWO_HOURS, None),
            meta(0, TWO_HOURS, None),
            // Next window, alone: no job.
            meta(TWO_HOURS, 2 * TWO_HOURS, None),
        ]);

        let jobs = planner().plan("user-1", &metas);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].metas().len(), 2);
        assert!(jobs[0].use_split());
        assert_eq!(jobs[0].tenant_id(), "user-1");
    }

    #[test]
    fn shards_are_planned_separately() {
        let metas = metas_map(&[
            meta(0, TWO_HOURS, Some("1_of_2")),
            meta(0, TWO_HOURS, Some("1_of_2")),
            meta(0, TWO_HOURS, Some("2_of_2")),
            meta(0, TWO_HOURS, Some("2_of_2")),
        ]);

        let jobs = planner().plan("user-1", &metas);
        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().all(|j| !j.use_split()));
        assert_eq!(jobs[0].shard_id(), "1_of_2");
        assert_eq!(jobs[1].shard_id(), "2_of_2");
    }

    #[test]
    fn wide_blocks_move_to_a_larger_range() {
        // Spans two small windows: only the 12h range fits.
        let wide_a = meta(0, 3 * TWO_HOURS, None);
        let wide_b = meta(TWO_HOURS, 4 * TWO_HOURS, None);
        let jobs = planner().plan("user-1", &metas_map(&[wide_a, wide_b]));

        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].metas().len(), 2);
    }

    #[test]
    fn plan_is_deterministic() {
        let metas = metas_map(&[
            meta(0, TWO_HOURS, None),
            meta(0, TWO_HOURS, None),
            meta(TWO_HOURS, 2 * TWO_HOURS, Some("1_of_2")),
            meta(TWO_HOURS, 2 * TWO_HOURS, Some("1_of_2")),
        ]);

        let keys_a: Vec<String> = planner()
            .plan("user-1", &metas)
            .iter()
            .map(|j| j.key().to_string())
            .collect();
        let keys_b: Vec<String> = planner()
            .plan("user-1", &metas)
            .iter()
            .map(|j| j.key().to_string())
            .collect();

        assert_eq!(keys_a, keys_b);
        assert_eq!(keys_a.len(), 2);
    }
}
