//! Compaction coordination for one tenant
//!
//! The compactor is responsible for:
//! - Synchronizing block metadata from the object store (through the fetcher)
//! - Grouping compactable blocks into jobs
//! - Gating jobs on the upload age of their level-1 blocks
//!
//! The actual block merge is carried out by a downstream worker; this service
//! decides *what* may be compacted *now*.

mod job;
mod planner;

pub use self::job::{job_wait_period_elapsed, Job, WaitPeriodCheck, WaitPeriodError};
pub use self::planner::Planner;

use crate::block::{BlockId, DeletionMark};
use crate::bucket::{Bucket, ObjectStoreBucket};
use crate::clock::BoundedClock;
use crate::fetcher::filters::{ConsistencyDelayFilter, IgnoreDeletionMarkFilter, MetaFilter};
use crate::fetcher::{BaseFetcher, MetaFetcher, MetaSync};
use crate::Result;

use object_store::ObjectStore;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Compactor configuration
#[derive(Debug, Clone)]
pub struct CompactorConfig {
    /// Number of concurrent meta.json loads during a sync
    pub meta_sync_concurrency: usize,
    /// Optional local directory caching meta.json files across syncs
    pub cache_dir: Option<PathBuf>,
    /// Minimum identifier age before a non-compactor block becomes visible
    pub consistency_delay: Duration,
    /// How long a deletion-marked block stays visible to the planner
    pub deletion_mark_delay: Duration,
    /// Minimum upload age of level-1 blocks before their job may start
    pub wait_period: Duration,
    /// Time range widths blocks are grouped into
    pub block_ranges: Vec<Duration>,
    /// Planning cycle interval
    pub check_interval: Duration,
}

impl Default for CompactorConfig {
    fn default() -> Self {
        Self {
            meta_sync_concurrency: 20,
            cache_dir: None,
            consistency_delay: Duration::from_secs(30 * 60), // 30 minutes
            deletion_mark_delay: Duration::from_secs(3600),  // 1 hour
            wait_period: Duration::from_secs(10 * 60),       // 10 minutes
            block_ranges: vec![
                Duration::from_secs(2 * 3600),
                Duration::from_secs(12 * 3600),
                Duration::from_secs(24 * 3600),
            ],
            check_interval: Duration::from_secs(60),
        }
    }
}

/// Per-tenant compaction coordinator.
pub struct Compactor {
    config: CompactorConfig,
    tenant_id: String,
    bucket: Arc<dyn Bucket>,
    fetcher: MetaFetcher,
    planner: Planner,
    /// Kept alongside the filter chain so the deleter can read the marks
    /// gathered during the last sync.
    deletion_mark_filter: Arc<IgnoreDeletionMarkFilter>,
    clock: Arc<BoundedClock>,
    /// Cancellation token for graceful shutdown
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Compactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compactor")
            .field("tenant_id", &self.tenant_id)
            .field("config", &self.config)
            .finish()
    }
}

impl Compactor {
    /// Create a compactor for one tenant's slice of the object store.
    pub fn new(
        config: CompactorConfig,
        store: Arc<dyn ObjectStore>,
        tenant_id: impl Into<String>,
    ) -> Result<Self> {
        let tenant_id = tenant_id.into();
        let bucket: Arc<dyn Bucket> = Arc::new(ObjectStoreBucket::new(store, &tenant_id));
        let clock = Arc::new(BoundedClock::default());

        let deletion_mark_filter = Arc::new(IgnoreDeletionMarkFilter::new(
            Arc::clone(&bucket),
            config.deletion_mark_delay,
            config.meta_sync_concurrency,
            Arc::clone(&clock),
        ));

        let filters: Vec<Arc<dyn MetaFilter>> = vec![
            Arc::new(ConsistencyDelayFilter::new(
                config.consistency_delay,
                Arc::clone(&clock),
            )),
            Arc::clone(&deletion_mark_filter) as Arc<dyn MetaFilter>,
        ];

        let base = Arc::new(BaseFetcher::new(
            config.meta_sync_concurrency,
            Arc::clone(&bucket),
            config.cache_dir.as_deref(),
        )?);

        let planner = Planner::new(&config.block_ranges);

        Ok(Self {
            config,
            tenant_id,
            bucket,
            fetcher: MetaFetcher::new(base, filters),
            planner,
            deletion_mark_filter,
            clock,
            shutdown: CancellationToken::new(),
        })
    }

    /// Get a cancellation token that can be used to trigger graceful shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn fetcher(&self) -> &MetaFetcher {
        &self.fetcher
    }

    /// Deletion marks observed during the last sync, for the deleter.
    pub fn deletion_marks(&self) -> HashMap<BlockId, DeletionMark> {
        self.deletion_mark_filter.deletion_marks()
    }

    /// Run the planning loop. Returns when the shutdown token is cancelled.
    pub async fn run(&self) {
        let mut interval = tokio::time::interval(self.config.check_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.run_cycle().await {
                        error!(tenant = %self.tenant_id, "Compaction planning cycle failed: {}", e);
                    }
                }
                _ = self.shutdown.cancelled() => {
                    info!(tenant = %self.tenant_id, "Compactor shutting down gracefully");
                    break;
                }
            }
        }
    }

    /// Run a single planning cycle: sync, group, gate. Returns the jobs that
    /// may start now.
    pub async fn run_cycle(&self) -> Result<Vec<Job>> {
        let sync = self.fetcher.fetch(&self.shutdown).await?;

        // An incomplete view still lets us plan over the healthy subset.
        if let Some(err) = sync.error() {
            warn!(tenant = %self.tenant_id, %err, "planning over an incomplete block view");
        }

        let jobs = self.plan_jobs(&sync);
        let planned = jobs.len();

        let mut ready = Vec::new();
        for job in jobs {
            match job_wait_period_elapsed(
                &self.shutdown,
                &job,
                self.config.wait_period,
                self.bucket.as_ref(),
                &self.clock,
            )
            .await
            {
                Ok(WaitPeriodCheck::Elapsed) => ready.push(job),
                Ok(WaitPeriodCheck::TooFresh(meta)) => {
                    debug!(
                        tenant = %self.tenant_id,
                        job = job.key(),
                        block = %meta.block_id,
                        "job not ready: source block uploaded too recently"
                    );
                }
                Err(err) => {
                    // Probe failure is authoritative; skip the job this round.
                    warn!(
                        tenant = %self.tenant_id,
                        job = job.key(),
                        block = %err.meta.block_id,
                        err = %err.source,
                        "failed to check job readiness; skipping job for this round"
                    );
                }
            }
        }

        info!(
            tenant = %self.tenant_id,
            blocks = sync.metas.len(),
            planned,
            ready = ready.len(),
            "compaction planning cycle completed"
        );

        Ok(ready)
    }

    /// Group a synced meta set into jobs.
    pub fn plan_jobs(&self, sync: &MetaSync) -> Vec<Job> {
        self.planner.plan(&self.tenant_id, &sync.metas)
    }
}
