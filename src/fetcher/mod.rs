//! Block metadata discovery and synchronization
//!
//! [`BaseFetcher`] scans a tenant's bucket for block directories, loads each
//! block's `meta.json` through a bounded worker pool, and caches descriptors
//! in memory and optionally on local disk. Concurrent callers are coalesced:
//! at most one bucket scan is in flight per fetcher, and every caller of an
//! in-progress sync shares its result.
//!
//! [`MetaFetcher`] is the entry point planners use: it wraps the base fetcher
//! with a filter chain and the transactional metrics surface.

pub mod filters;
pub mod metrics;

use crate::block::{self, is_block_dir, BlockId, BlockMeta};
use crate::bucket::Bucket;
use crate::{Error, MultiError, Result};

use self::filters::MetaFilter;
use self::metrics::{FetcherMetrics, CORRUPTED_META, FAILED_META, LOADED_META, NO_META};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Subdirectory of the configured cache directory holding per-block
/// `meta.json` copies.
const CACHE_SUBDIR: &str = "meta-syncer";

/// Why a block present in the store could not be used.
///
/// These are the expected, per-block outcomes: they are counted in the sync
/// gauges and reported in the partial map, but never fail the sync on their
/// own.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PartialBlockError {
    /// No `meta.json` under the block directory: the block is invisible,
    /// either mid-upload or mid-deletion.
    #[error("meta.json not found")]
    MetaNotFound,
    /// `meta.json` exists but cannot be decoded.
    #[error("meta.json corrupted: {0}")]
    MetaCorrupted(String),
    /// `meta.json` carries a schema version this process does not understand.
    #[error("unexpected meta.json version: {0}")]
    UnexpectedVersion(i32),
    /// A transient bucket failure while loading this block. The same failure
    /// is also aggregated into the sync's error set.
    #[error("loading meta.json: {0}")]
    Transient(String),
}

/// The outcome of one metadata synchronization.
#[derive(Debug, Clone, Default)]
pub struct MetaSync {
    /// Usable blocks, after filtering.
    pub metas: HashMap<BlockId, Arc<BlockMeta>>,
    /// Blocks present in the store whose meta could not be used. Disjoint
    /// from `metas`.
    pub partial: HashMap<BlockId, PartialBlockError>,
    errors: MultiError,
}

impl MetaSync {
    /// Whether the sync observed every visible block without transient
    /// failures. Only complete views update the fetcher caches.
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }

    /// Transient per-block failures aggregated during the sync.
    pub fn errors(&self) -> &MultiError {
        &self.errors
    }

    /// The incomplete-view error, if any. Callers can still make progress on
    /// `metas`, which holds the healthy subset.
    pub fn error(&self) -> Option<Error> {
        (!self.is_complete()).then(|| Error::IncompleteView(self.errors.clone()))
    }
}

#[derive(Debug, Clone, Default)]
struct FetchResponse {
    metas: HashMap<BlockId, Arc<BlockMeta>>,
    partial: HashMap<BlockId, PartialBlockError>,
    meta_errs: MultiError,
    no_metas: u64,
    corrupted_metas: u64,
    version_failures: u64,
}

impl FetchResponse {
    fn failed_count(&self) -> u64 {
        self.meta_errs.len() as u64 + self.version_failures
    }
}

type SharedFetch = Shared<BoxFuture<'static, std::result::Result<Arc<FetchResponse>, Arc<Error>>>>;

/// Discovers block identifiers and loads their descriptors concurrently.
///
/// Safe for concurrent use. One instance per cache directory: the on-disk
/// cache is single-writer by convention.
pub struct BaseFetcher {
    concurrency: usize,
    bucket: Arc<dyn Bucket>,
    cache_dir: Option<PathBuf>,

    cached: Mutex<HashMap<BlockId, Arc<BlockMeta>>>,
    inflight: tokio::sync::Mutex<Option<SharedFetch>>,
    scans: AtomicU64,
}

impl BaseFetcher {
    /// Create a fetcher reading through `bucket` with `concurrency` meta
    /// loading workers. When `cache_dir` is given, descriptors are also
    /// cached under `<cache_dir>/meta-syncer/<block id>/`.
    pub fn new(concurrency: usize, bucket: Arc<dyn Bucket>, cache_dir: Option<&Path>) -> Result<Self> {
        let cache_dir = match cache_dir {
            Some(dir) => {
                let dir = dir.join(CACHE_SUBDIR);
                std::fs::create_dir_all(&dir)?;
                Some(dir)
            }
            None => None,
        };

        Ok(Self {
            concurrency: concurrency.max(1),
            bucket,
            cache_dir,
            cached: Mutex::new(HashMap::new()),
            inflight: tokio::sync::Mutex::new(None),
            scans: AtomicU64::new(0),
        })
    }

    /// Number of descriptors in the in-memory cache, i.e. the size of the
    /// last complete view.
    pub fn cached_count(&self) -> usize {
        self.cached.lock().len()
    }

    /// Number of bucket scans actually executed. Coalesced callers do not
    /// increment this.
    pub fn scans_total(&self) -> u64 {
        self.scans.load(Ordering::Relaxed)
    }

    /// Run or join the in-flight scan. The first caller's `shutdown` token
    /// drives cancellation for every coalesced caller.
    async fn fetch_metadata(
        self: Arc<Self>,
        shutdown: CancellationToken,
    ) -> std::result::Result<Arc<FetchResponse>, Arc<Error>> {
        let fut = {
            let mut inflight = self.inflight.lock().await;
            match inflight.as_ref() {
                Some(fut) => fut.clone(),
                None => {
                    let this = Arc::clone(&self);
                    let fut = async move {
                        let result = Arc::clone(&this)
                            .scan_bucket(shutdown)
                            .await
                            .map(Arc::new)
                            .map_err(Arc::new);
                        *this.inflight.lock().await = None;
                        result
                    }
                    .boxed()
                    .shared();
                    *inflight = Some(fut.clone());
                    fut
                }
            }
        };

        fut.await
    }

    async fn scan_bucket(self: Arc<Self>, shutdown: CancellationToken) -> Result<FetchResponse> {
        self.scans.fetch_add(1, Ordering::Relaxed);
        metrics::record_base_sync();
        debug!(concurrency = self.concurrency, "fetching block metadata");

        let (tx, rx) = tokio::sync::mpsc::channel::<BlockId>(self.concurrency);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let resp = Arc::new(Mutex::new(FetchResponse::default()));

        let mut workers = JoinSet::new();
        for _ in 0..self.concurrency {
            let this = Arc::clone(&self);
            let rx = Arc::clone(&rx);
            let resp = Arc::clone(&resp);
            workers.spawn(async move {
                loop {
                    let id = { rx.lock().await.recv().await };
                    let Some(id) = id else { break };

                    match this.load_meta(id).await {
                        Ok(meta) => {
                            resp.lock().metas.insert(id, meta);
                        }
                        Err(Error::MetaNotFound) => {
                            let mut resp = resp.lock();
                            resp.no_metas += 1;
                            resp.partial.insert(id, PartialBlockError::MetaNotFound);
                        }
                        Err(Error::MetaCorrupted(msg)) => {
                            let mut resp = resp.lock();
                            resp.corrupted_metas += 1;
                            resp.partial.insert(id, PartialBlockError::MetaCorrupted(msg));
                        }
                        Err(Error::UnexpectedMetaVersion { version }) => {
                            let mut resp = resp.lock();
                            resp.version_failures += 1;
                            resp.partial
                                .insert(id, PartialBlockError::UnexpectedVersion(version));
                        }
                        Err(err) => {
                            let mut resp = resp.lock();
                            resp.partial
                                .insert(id, PartialBlockError::Transient(err.to_string()));
                            resp.meta_errs.push(err);
                        }
                    }
                }
            });
        }

        // Workers scheduled, distribute block IDs. The bounded channel keeps
        // at most `concurrency` IDs pending regardless of bucket size.
        let scheduler = {
            let bucket = Arc::clone(&self.bucket);
            let shutdown = shutdown.clone();
            async move {
                for name in bucket.list_block_dirs().await? {
                    let Some(id) = is_block_dir(&name) else {
                        continue;
                    };

                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => return Err(Error::Cancelled),
                        sent = tx.send(id) => {
                            if sent.is_err() {
                                break;
                            }
                        }
                    }
                }
                Ok(())
            }
        };
        let scheduled = scheduler.await;

        while let Some(joined) = workers.join_next().await {
            if joined.is_err() {
                return Err(Error::Internal("meta loading worker panicked".to_string()));
            }
        }
        scheduled?;

        let resp = Arc::try_unwrap(resp)
            .map(Mutex::into_inner)
            .unwrap_or_else(|resp| resp.lock().clone());

        // An incomplete view must not poison the caches.
        if !resp.meta_errs.is_empty() {
            return Ok(resp);
        }

        *self.cached.lock() = resp.metas.clone();

        if let Some(dir) = self.cache_dir.clone() {
            self.sweep_cache_dir(&dir, &resp.metas).await;
        }

        Ok(resp)
    }

    /// Load one block's descriptor, preferring the in-memory and on-disk
    /// caches. Descriptors are immutable, so a cache hit never needs
    /// revalidation.
    async fn load_meta(&self, id: BlockId) -> Result<Arc<BlockMeta>> {
        let meta_file = block::meta_path(&id);

        match self.bucket.exists(&meta_file).await {
            Ok(true) => {}
            Ok(false) => return Err(Error::MetaNotFound),
            Err(err) => return Err(err),
        }

        if let Some(meta) = self.cached.lock().get(&id) {
            return Ok(Arc::clone(meta));
        }

        if let Some(cache_dir) = &self.cache_dir {
            let block_dir = cache_dir.join(id.to_string());
            match BlockMeta::read_from_dir(&block_dir).await {
                Ok(meta) => return Ok(Arc::new(meta)),
                Err(Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(block = %id, %err, "best effort read of the cached meta.json failed; removing cached block dir");
                    if let Err(err) = tokio::fs::remove_dir_all(&block_dir).await {
                        warn!(block = %id, %err, "best effort removal of the cached block dir failed; ignoring");
                    }
                }
            }
        }

        let bytes = match self.bucket.get(&meta_file).await {
            Ok(bytes) => bytes,
            // meta.json was deleted between the exists probe and here.
            Err(err) if err.is_not_found() => return Err(Error::MetaNotFound),
            Err(err) => return Err(err),
        };

        let meta = BlockMeta::decode(&bytes)?;

        if let Some(cache_dir) = &self.cache_dir {
            if let Err(err) = meta.write_to_dir(&cache_dir.join(id.to_string())).await {
                warn!(block = %id, %err, "best effort write of meta.json to the local cache failed; ignoring");
            }
        }

        Ok(Arc::new(meta))
    }

    /// Remove cached block directories whose block is no longer present.
    /// Only called after complete syncs, so a partial view never deletes
    /// live cache entries. Best-effort throughout.
    async fn sweep_cache_dir(&self, dir: &Path, metas: &HashMap<BlockId, Arc<BlockMeta>>) {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(%err, "best effort scan of the meta cache dir failed; ignoring");
                return;
            }
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(id) = is_block_dir(&name) else {
                continue;
            };
            if metas.contains_key(&id) {
                continue;
            }

            if let Err(err) = tokio::fs::remove_dir_all(entry.path()).await {
                warn!(block = %id, %err, "best effort removal of a stale cached block dir failed; ignoring");
            }
        }
    }
}

/// The fetcher façade used by planners: base fetcher + filter chain +
/// transactional metrics.
pub struct MetaFetcher {
    base: Arc<BaseFetcher>,
    filters: Vec<Arc<dyn MetaFilter>>,
    metrics: FetcherMetrics,
}

impl MetaFetcher {
    pub fn new(base: Arc<BaseFetcher>, filters: Vec<Arc<dyn MetaFilter>>) -> Self {
        Self::with_metrics(base, filters, FetcherMetrics::new())
    }

    /// Build a fetcher whose metrics surface declares extension bins.
    pub fn with_metrics(
        base: Arc<BaseFetcher>,
        filters: Vec<Arc<dyn MetaFilter>>,
        metrics: FetcherMetrics,
    ) -> Self {
        Self {
            base,
            filters,
            metrics,
        }
    }

    /// Basic fetcher without filters or disk cache, for tooling. Does not
    /// handle eventually consistent backends or partial uploads; not suitable
    /// for production sync loops.
    pub fn raw(bucket: Arc<dyn Bucket>) -> Result<Self> {
        Ok(Self::new(Arc::new(BaseFetcher::new(1, bucket, None)?), Vec::new()))
    }

    pub fn metrics(&self) -> &FetcherMetrics {
        &self.metrics
    }

    pub fn base(&self) -> &Arc<BaseFetcher> {
        &self.base
    }

    /// Synchronize block metadata from the bucket.
    ///
    /// Returns the filtered meta map plus the partial map of per-block
    /// failures. A sync that observed transient failures still returns the
    /// healthy subset; `MetaSync::error` reports the incomplete view. `Err`
    /// is reserved for cancellation, bucket iteration failures, and filter
    /// failures; in those cases the staged gauges are discarded unpublished.
    pub async fn fetch(&self, shutdown: &CancellationToken) -> Result<MetaSync> {
        let start = Instant::now();
        metrics::record_sync_started();
        self.metrics.reset_tx();

        let resp = match Arc::clone(&self.base).fetch_metadata(shutdown.clone()).await {
            Ok(resp) => resp,
            Err(err) => {
                metrics::record_sync_finished(start.elapsed().as_secs_f64(), true);
                return Err(Error::from_shared(err));
            }
        };

        // Copy: the same response may be shared with coalesced callers.
        let mut metas = resp.metas.clone();

        self.metrics.synced.set(FAILED_META, resp.failed_count());
        self.metrics.synced.set(NO_META, resp.no_metas);
        self.metrics.synced.set(CORRUPTED_META, resp.corrupted_metas);

        for filter in &self.filters {
            // Filters account for every meta they drop or mutate on the
            // staging gauges.
            if let Err(err) = filter
                .filter(shutdown, &mut metas, &self.metrics.synced, &self.metrics.modified)
                .await
            {
                metrics::record_sync_finished(start.elapsed().as_secs_f64(), true);
                return Err(err);
            }
        }

        self.metrics.synced.set(LOADED_META, metas.len() as u64);
        self.metrics.submit();

        let sync = MetaSync {
            metas,
            partial: resp.partial.clone(),
            errors: resp.meta_errs.clone(),
        };

        let duration = start.elapsed();
        metrics::record_sync_finished(duration.as_secs_f64(), !sync.is_complete());

        if let Some(err) = sync.error() {
            warn!(
                duration_ms = duration.as_millis() as u64,
                returned = sync.metas.len(),
                partial = sync.partial.len(),
                %err,
                "block metadata sync produced an incomplete view"
            );
        } else {
            info!(
                duration_ms = duration.as_millis() as u64,
                cached = self.base.cached_count(),
                returned = sync.metas.len(),
                partial = sync.partial.len(),
                "successfully synchronized block metadata"
            );
        }

        Ok(sync)
    }
}
