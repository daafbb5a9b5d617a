//! Integration tests for the meta filter chain: consistency delay and
//! deletion marks.

use blocksync::block::meta::{BlockCompaction, BlockSource, META_VERSION, TENANT_ID_LABEL};
use blocksync::block::{self, BlockId, BlockMeta, DeletionMark};
use blocksync::bucket::{Bucket, ObjectAttributes, ObjectStoreBucket};
use blocksync::clock::BoundedClock;
use blocksync::fetcher::filters::{ConsistencyDelayFilter, IgnoreDeletionMarkFilter, MetaFilter};
use blocksync::fetcher::metrics::TxGaugeVec;
use blocksync::Error;

use async_trait::async_trait;
use bytes::Bytes;
use object_store::memory::InMemory;
use object_store::ObjectStore;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const TENANT: &str = "user-1";

fn meta_from(id: BlockId, source: BlockSource) -> Arc<BlockMeta> {
    Arc::new(BlockMeta {
        version: META_VERSION,
        block_id: id,
        min_time: 0,
        max_time: 7_200_000,
        compaction: BlockCompaction {
            level: 1,
            sources: Vec::new(),
        },
        labels: BTreeMap::from([(TENANT_ID_LABEL.to_string(), TENANT.to_string())]),
        source,
        files: Vec::new(),
    })
}

fn metas_map(metas: &[Arc<BlockMeta>]) -> HashMap<BlockId, Arc<BlockMeta>> {
    metas.iter().map(|m| (m.block_id, Arc::clone(m))).collect()
}

fn gauges() -> (TxGaugeVec, TxGaugeVec) {
    (TxGaugeVec::new(&[]), TxGaugeVec::new(&[]))
}

struct FlakyMarkBucket {
    inner: Arc<dyn Bucket>,
    failing_gets: Mutex<HashSet<String>>,
}

#[async_trait]
impl Bucket for FlakyMarkBucket {
    async fn exists(&self, path: &str) -> blocksync::Result<bool> {
        self.inner.exists(path).await
    }

    async fn get(&self, path: &str) -> blocksync::Result<Bytes> {
        if self.failing_gets.lock().contains(path) {
            return Err(Error::Internal(format!("injected failure reading {path}")));
        }
        self.inner.get(path).await
    }

    async fn upload(&self, path: &str, payload: Bytes) -> blocksync::Result<()> {
        self.inner.upload(path, payload).await
    }

    async fn delete(&self, path: &str) -> blocksync::Result<()> {
        self.inner.delete(path).await
    }

    async fn list_block_dirs(&self) -> blocksync::Result<Vec<String>> {
        self.inner.list_block_dirs().await
    }

    async fn attributes(&self, path: &str) -> blocksync::Result<ObjectAttributes> {
        self.inner.attributes(path).await
    }
}

#[tokio::test]
async fn consistency_delay_hides_fresh_uploads_but_not_compactor_output() {
    let clock = Arc::new(BoundedClock::default());
    let now = clock.now_millis();

    let fresh_ingested = meta_from(BlockId::with_creation_time(now - 60_000), BlockSource::Ingester);
    let fresh_uploaded = meta_from(BlockId::with_creation_time(now - 60_000), BlockSource::Upload);
    let old_ingested = meta_from(
        BlockId::with_creation_time(now - 2 * 3_600_000),
        BlockSource::Ingester,
    );
    let fresh_compacted = meta_from(BlockId::with_creation_time(now - 60_000), BlockSource::Compactor);

    let mut metas = metas_map(&[
        Arc::clone(&fresh_ingested),
        Arc::clone(&fresh_uploaded),
        Arc::clone(&old_ingested),
        Arc::clone(&fresh_compacted),
    ]);

    let filter = ConsistencyDelayFilter::new(Duration::from_secs(30 * 60), clock);
    let (synced, modified) = gauges();
    filter
        .filter(&CancellationToken::new(), &mut metas, &synced, &modified)
        .await
        .unwrap();

    assert!(!metas.contains_key(&fresh_ingested.block_id));
    assert!(!metas.contains_key(&fresh_uploaded.block_id));
    assert!(metas.contains_key(&old_ingested.block_id));
    assert!(metas.contains_key(&fresh_compacted.block_id));

    synced.submit();
    assert_eq!(synced.get("too-fresh"), 2);
}

#[tokio::test]
async fn deletion_marks_remove_blocks_only_after_the_delay() {
    let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
    let bucket: Arc<dyn Bucket> = Arc::new(ObjectStoreBucket::new(store, TENANT));
    let clock = Arc::new(BoundedClock::default());
    let now_secs = clock.now_millis() / 1000;

    let aged = meta_from(BlockId::with_creation_time(1_000), BlockSource::Ingester);
    let recent = meta_from(BlockId::with_creation_time(2_000), BlockSource::Ingester);
    let unmarked = meta_from(BlockId::with_creation_time(3_000), BlockSource::Ingester);

    for (meta, marked_at) in [(&aged, now_secs - 2 * 3600), (&recent, now_secs - 10)] {
        let mark = DeletionMark {
            block_id: meta.block_id,
            deletion_time: marked_at,
        };
        bucket
            .upload(
                &block::deletion_mark_path(&meta.block_id),
                Bytes::from(serde_json::to_vec(&mark).unwrap()),
            )
            .await
            .unwrap();
    }

    let mut metas = metas_map(&[Arc::clone(&aged), Arc::clone(&recent), Arc::clone(&unmarked)]);
    let filter = IgnoreDeletionMarkFilter::new(bucket, Duration::from_secs(3600), 4, clock);
    let (synced, modified) = gauges();
    filter
        .filter(&CancellationToken::new(), &mut metas, &synced, &modified)
        .await
        .unwrap();

    // Only the aged mark removes its block; the recent one stays visible so
    // its replacement can land first.
    assert!(!metas.contains_key(&aged.block_id));
    assert!(metas.contains_key(&recent.block_id));
    assert!(metas.contains_key(&unmarked.block_id));

    synced.submit();
    assert_eq!(synced.get("marked-for-deletion"), 1);

    // Both marks are published regardless of the delay.
    let marks = filter.deletion_marks();
    assert_eq!(marks.len(), 2);
    assert!(marks.contains_key(&aged.block_id));
    assert!(marks.contains_key(&recent.block_id));
}

#[tokio::test]
async fn unparseable_deletion_marks_are_skipped() {
    let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
    let bucket: Arc<dyn Bucket> = Arc::new(ObjectStoreBucket::new(store, TENANT));
    let clock = Arc::new(BoundedClock::default());

    let meta = meta_from(BlockId::with_creation_time(1_000), BlockSource::Ingester);
    bucket
        .upload(
            &block::deletion_mark_path(&meta.block_id),
            Bytes::from_static(b"{truncated"),
        )
        .await
        .unwrap();

    let mut metas = metas_map(&[Arc::clone(&meta)]);
    let filter = IgnoreDeletionMarkFilter::new(bucket, Duration::from_secs(3600), 4, clock);
    let (synced, modified) = gauges();
    filter
        .filter(&CancellationToken::new(), &mut metas, &synced, &modified)
        .await
        .unwrap();

    assert!(metas.contains_key(&meta.block_id));
    assert!(filter.deletion_marks().is_empty());
}

#[tokio::test]
async fn probe_errors_are_reported_but_marks_still_published() {
    let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
    let inner: Arc<dyn Bucket> = Arc::new(ObjectStoreBucket::new(store, TENANT));
    let clock = Arc::new(BoundedClock::default());
    let now_secs = clock.now_millis() / 1000;

    let aged = meta_from(BlockId::with_creation_time(1_000), BlockSource::Ingester);
    let unreadable = meta_from(BlockId::with_creation_time(2_000), BlockSource::Ingester);

    let mark = DeletionMark {
        block_id: aged.block_id,
        deletion_time: now_secs - 2 * 3600,
    };
    inner
        .upload(
            &block::deletion_mark_path(&aged.block_id),
            Bytes::from(serde_json::to_vec(&mark).unwrap()),
        )
        .await
        .unwrap();

    let flaky = Arc::new(FlakyMarkBucket {
        inner,
        failing_gets: Mutex::new(HashSet::from([block::deletion_mark_path(
            &unreadable.block_id,
        )])),
    });

    let mut metas = metas_map(&[Arc::clone(&aged), Arc::clone(&unreadable)]);
    let filter = IgnoreDeletionMarkFilter::new(
        flaky as Arc<dyn Bucket>,
        Duration::from_secs(3600),
        4,
        clock,
    );
    let (synced, modified) = gauges();

    let err = filter
        .filter(&CancellationToken::new(), &mut metas, &synced, &modified)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("injected failure"), "{err}");

    // The failing probe did not stop the filter from acting on the marks it
    // did read.
    assert!(!metas.contains_key(&aged.block_id));
    assert!(metas.contains_key(&unreadable.block_id));
    assert_eq!(filter.deletion_marks().len(), 1);
}
