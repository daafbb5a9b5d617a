//! Scenario tests for the job-readiness gate.

use blocksync::block::meta::{BlockCompaction, BlockSource, META_VERSION};
use blocksync::block::{self, BlockId, BlockMeta};
use blocksync::bucket::{Bucket, ObjectAttributes};
use blocksync::clock::BoundedClock;
use blocksync::compactor::{job_wait_period_elapsed, Job, WaitPeriodCheck};
use blocksync::Error;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn level_meta(seq: i64, level: u32) -> Arc<BlockMeta> {
    Arc::new(BlockMeta {
        version: META_VERSION,
        block_id: BlockId::with_creation_time(seq),
        min_time: 0,
        max_time: 1000,
        compaction: BlockCompaction {
            level,
            sources: Vec::new(),
        },
        labels: BTreeMap::new(),
        source: BlockSource::Ingester,
        files: Vec::new(),
    })
}

fn job_with(metas: &[Arc<BlockMeta>]) -> Job {
    let mut job = Job::new("user-1", "group-1", BTreeMap::new(), 0, true, "shard-1");
    for meta in metas {
        job.append_meta(Arc::clone(meta)).unwrap();
    }
    job
}

/// Bucket serving canned `attributes` responses, with optional injected
/// probe failures. Everything else is out of scope for the gate.
#[derive(Default)]
struct AttributesBucket {
    attrs: HashMap<String, ObjectAttributes>,
    errors: HashMap<String, String>,
}

impl AttributesBucket {
    fn uploaded_ago(&mut self, meta: &BlockMeta, ago: ChronoDuration) {
        self.attrs.insert(
            block::meta_path(&meta.block_id),
            ObjectAttributes {
                last_modified: Utc::now() - ago,
                size_bytes: 1,
            },
        );
    }

    fn failing(&mut self, meta: &BlockMeta, message: &str) {
        self.errors
            .insert(block::meta_path(&meta.block_id), message.to_string());
    }
}

#[async_trait]
impl Bucket for AttributesBucket {
    async fn exists(&self, _path: &str) -> blocksync::Result<bool> {
        Err(Error::Internal("not used by the readiness gate".to_string()))
    }

    async fn get(&self, _path: &str) -> blocksync::Result<Bytes> {
        Err(Error::Internal("not used by the readiness gate".to_string()))
    }

    async fn upload(&self, _path: &str, _payload: Bytes) -> blocksync::Result<()> {
        Err(Error::Internal("not used by the readiness gate".to_string()))
    }

    async fn delete(&self, _path: &str) -> blocksync::Result<()> {
        Err(Error::Internal("not used by the readiness gate".to_string()))
    }

    async fn list_block_dirs(&self) -> blocksync::Result<Vec<String>> {
        Err(Error::Internal("not used by the readiness gate".to_string()))
    }

    async fn attributes(&self, path: &str) -> blocksync::Result<ObjectAttributes> {
        if let Some(message) = self.errors.get(path) {
            return Err(Error::Internal(message.clone()));
        }
        self.attrs
            .get(path)
            .cloned()
            .ok_or(Error::MetaNotFound)
    }
}

#[tokio::test]
async fn wait_period_disabled() {
    let meta1 = level_meta(1, 1);
    let meta2 = level_meta(2, 1);
    let job = job_with(&[Arc::clone(&meta1), Arc::clone(&meta2)]);

    let mut bucket = AttributesBucket::default();
    bucket.uploaded_ago(&meta1, ChronoDuration::minutes(20));
    bucket.uploaded_ago(&meta2, ChronoDuration::minutes(5));

    let check = job_wait_period_elapsed(
        &CancellationToken::new(),
        &job,
        Duration::ZERO,
        &bucket,
        &BoundedClock::default(),
    )
    .await
    .unwrap();

    assert!(matches!(check, WaitPeriodCheck::Elapsed));
}

#[tokio::test]
async fn blocks_uploaded_since_more_than_the_wait_period() {
    let meta1 = level_meta(1, 1);
    let meta2 = level_meta(2, 1);
    let job = job_with(&[Arc::clone(&meta1), Arc::clone(&meta2)]);

    let mut bucket = AttributesBucket::default();
    bucket.uploaded_ago(&meta1, ChronoDuration::minutes(20));
    bucket.uploaded_ago(&meta2, ChronoDuration::minutes(25));

    let check = job_wait_period_elapsed(
        &CancellationToken::new(),
        &job,
        Duration::from_secs(10 * 60),
        &bucket,
        &BoundedClock::default(),
    )
    .await
    .unwrap();

    assert!(matches!(check, WaitPeriodCheck::Elapsed));
}

#[tokio::test]
async fn blocks_uploaded_since_less_than_the_wait_period() {
    let meta1 = level_meta(1, 1);
    let meta2 = level_meta(2, 1);
    let job = job_with(&[Arc::clone(&meta1), Arc::clone(&meta2)]);

    let mut bucket = AttributesBucket::default();
    bucket.uploaded_ago(&meta1, ChronoDuration::minutes(20));
    bucket.uploaded_ago(&meta2, ChronoDuration::minutes(5));

    let check = job_wait_period_elapsed(
        &CancellationToken::new(),
        &job,
        Duration::from_secs(10 * 60),
        &bucket,
        &BoundedClock::default(),
    )
    .await
    .unwrap();

    match check {
        WaitPeriodCheck::TooFresh(meta) => assert_eq!(meta.block_id, meta2.block_id),
        other => panic!("expected TooFresh, got {other:?}"),
    }
}

#[tokio::test]
async fn level_above_one_is_exempt() {
    let meta3 = level_meta(3, 2);
    let meta4 = level_meta(4, 2);
    let job = job_with(&[Arc::clone(&meta3), Arc::clone(&meta4)]);

    // No attributes registered at all: a probe would fail, proving the gate
    // never probes compactor output.
    let bucket = AttributesBucket::default();

    let check = job_wait_period_elapsed(
        &CancellationToken::new(),
        &job,
        Duration::from_secs(10 * 60),
        &bucket,
        &BoundedClock::default(),
    )
    .await
    .unwrap();

    assert!(matches!(check, WaitPeriodCheck::Elapsed));
}

#[tokio::test]
async fn probe_error_is_authoritative() {
    let meta1 = level_meta(1, 1);
    let meta2 = level_meta(2, 1);
    let job = job_with(&[Arc::clone(&meta1), Arc::clone(&meta2)]);

    let mut bucket = AttributesBucket::default();
    // Old enough on its own...
    bucket.uploaded_ago(&meta1, ChronoDuration::minutes(20));
    // ...but the second probe fails.
    bucket.failing(&meta2, "mocked error");

    let err = job_wait_period_elapsed(
        &CancellationToken::new(),
        &job,
        Duration::from_secs(10 * 60),
        &bucket,
        &BoundedClock::default(),
    )
    .await
    .unwrap_err();

    assert_eq!(err.meta.block_id, meta2.block_id);
    assert!(err.source.to_string().contains("mocked error"));
}

#[tokio::test]
async fn cancelled_gate_reports_the_pending_block() {
    let meta1 = level_meta(1, 1);
    let job = job_with(&[Arc::clone(&meta1)]);
    let bucket = AttributesBucket::default();

    let cancelled = CancellationToken::new();
    cancelled.cancel();

    let err = job_wait_period_elapsed(
        &cancelled,
        &job,
        Duration::from_secs(10 * 60),
        &bucket,
        &BoundedClock::default(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err.source, Error::Cancelled));
    assert_eq!(err.meta.block_id, meta1.block_id);
}
