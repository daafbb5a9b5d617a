//! Transactional sync gauges and fetcher instruments
//!
//! Scrapers must never observe a half-updated set of sync counts. Gauge
//! mutations made during a sync go into a staging buffer; `submit` flips the
//! whole buffer into the published values in one step. A reader between
//! `reset_tx` and `submit` sees the previous completed sync's values.

use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Unit};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::OnceLock;

/// `synced` bin: blocks returned by the sync after filtering.
pub const LOADED_META: &str = "loaded";
/// `synced` bin: block directory with no meta.json (partial block).
pub const NO_META: &str = "no-meta-json";
/// `synced` bin: meta.json present but undecodable (partial block).
pub const CORRUPTED_META: &str = "corrupted-meta-json";
/// `synced` bin: per-block failures (transient errors, unknown versions).
pub const FAILED_META: &str = "failed";
/// `synced` bin: blocks younger than the consistency delay.
pub const TOO_FRESH_META: &str = "too-fresh";
/// `synced` bin: blocks dropped by lineage deduplication.
pub const DUPLICATE_META: &str = "duplicate";
/// `synced` bin: blocks dropped by label selection.
pub const LABEL_EXCLUDED_META: &str = "label-excluded";
/// `synced` bin: blocks dropped by time-range selection.
pub const TIME_EXCLUDED_META: &str = "time-excluded";
/// `synced` bin: blocks whose deletion mark aged beyond the delay.
pub const MARKED_FOR_DELETION_META: &str = "marked-for-deletion";
/// `synced` bin: blocks loaded but excluded from compaction by a no-compact
/// mark. Such blocks are also counted under `loaded`.
pub const MARKED_FOR_NO_COMPACT_META: &str = "marked-for-no-compact";

/// `modified` bin: metas whose replica label was stripped in flight.
pub const REPLICA_LABEL_REMOVED_META: &str = "replica-label-removed";

const SYNCED_BINS: &[&str] = &[
    LOADED_META,
    NO_META,
    CORRUPTED_META,
    FAILED_META,
    TOO_FRESH_META,
    DUPLICATE_META,
    LABEL_EXCLUDED_META,
    TIME_EXCLUDED_META,
    MARKED_FOR_DELETION_META,
    MARKED_FOR_NO_COMPACT_META,
];

const MODIFIED_BINS: &[&str] = &[REPLICA_LABEL_REMOVED_META];

/// A gauge vector whose bins are mutated transactionally.
///
/// Double buffered: writers mutate the staging map, `submit` installs a
/// snapshot of it as the published map under a write lock. Readers only ever
/// touch the published side.
pub struct TxGaugeVec {
    staging: Mutex<HashMap<String, u64>>,
    published: RwLock<HashMap<String, u64>>,
}

impl TxGaugeVec {
    /// Create a gauge vector with the given bins, all starting at zero.
    /// Bins not declared here may still be used; they appear on first bump.
    pub fn new(bins: &[&str]) -> Self {
        let zeroed: HashMap<String, u64> = bins.iter().map(|b| (b.to_string(), 0)).collect();
        Self {
            staging: Mutex::new(zeroed.clone()),
            published: RwLock::new(zeroed),
        }
    }

    /// Start a new transaction: zero every staging bin.
    pub fn reset_tx(&self) {
        let mut staging = self.staging.lock();
        for value in staging.values_mut() {
            *value = 0;
        }
    }

    /// Increment a staging bin by one.
    pub fn inc(&self, bin: &str) {
        self.add(bin, 1);
    }

    /// Increment a staging bin.
    pub fn add(&self, bin: &str, n: u64) {
        *self.staging.lock().entry(bin.to_string()).or_insert(0) += n;
    }

    /// Set a staging bin to an absolute value.
    pub fn set(&self, bin: &str, value: u64) {
        self.staging.lock().insert(bin.to_string(), value);
    }

    /// Atomically publish the staging buffer.
    pub fn submit(&self) {
        let snapshot = self.staging.lock().clone();
        *self.published.write() = snapshot;
    }

    /// Read a published bin. Unknown bins read as zero.
    pub fn get(&self, bin: &str) -> u64 {
        self.published.read().get(bin).copied().unwrap_or(0)
    }

    /// Snapshot of all published bins.
    pub fn snapshot(&self) -> HashMap<String, u64> {
        self.published.read().clone()
    }
}

/// The transactional metrics surface of a meta fetcher.
pub struct FetcherMetrics {
    /// Per-state block counts of the last completed sync.
    pub synced: TxGaugeVec,
    /// Counts of metas mutated in flight by filters.
    pub modified: TxGaugeVec,
}

impl FetcherMetrics {
    pub fn new() -> Self {
        Self::with_extra_bins(&[], &[])
    }

    /// Extension bins are declared at construction time so they are published
    /// as zero from the first sync onward.
    pub fn with_extra_bins(synced_extra: &[&str], modified_extra: &[&str]) -> Self {
        let synced_bins: Vec<&str> = SYNCED_BINS.iter().chain(synced_extra).copied().collect();
        let modified_bins: Vec<&str> = MODIFIED_BINS.iter().chain(modified_extra).copied().collect();
        Self {
            synced: TxGaugeVec::new(&synced_bins),
            modified: TxGaugeVec::new(&modified_bins),
        }
    }

    /// Start a new transaction on both gauge vectors.
    pub fn reset_tx(&self) {
        self.synced.reset_tx();
        self.modified.reset_tx();
    }

    /// Publish both gauge vectors.
    pub fn submit(&self) {
        self.synced.submit();
        self.modified.submit();
    }
}

impl Default for FetcherMetrics {
    fn default() -> Self {
        Self::new()
    }
}

struct FetcherInstruments {
    syncs: Counter<u64>,
    sync_failures: Counter<u64>,
    sync_duration_seconds: Histogram<f64>,
    base_syncs: Counter<u64>,
}

fn instruments() -> &'static FetcherInstruments {
    static INSTRUMENTS: OnceLock<FetcherInstruments> = OnceLock::new();
    INSTRUMENTS.get_or_init(|| {
        let meter = global::meter("blocksync.fetcher");
        FetcherInstruments {
            syncs: meter
                .u64_counter("blocksync.fetcher.syncs")
                .with_description("Total block metadata synchronization attempts")
                .init(),
            sync_failures: meter
                .u64_counter("blocksync.fetcher.sync_failures")
                .with_description("Total failed block metadata synchronizations")
                .init(),
            sync_duration_seconds: meter
                .f64_histogram("blocksync.fetcher.sync_duration")
                .with_description("Duration of block metadata synchronizations")
                .with_unit(Unit::new("s"))
                .init(),
            base_syncs: meter
                .u64_counter("blocksync.fetcher.base_syncs")
                .with_description("Bucket scans actually executed, after single-flight coalescing")
                .init(),
        }
    })
}

pub(crate) fn record_sync_started() {
    instruments().syncs.add(1, &[]);
}

pub(crate) fn record_sync_finished(duration_seconds: f64, failed: bool) {
    let i = instruments();
    i.sync_duration_seconds.record(duration_seconds, &[]);
    if failed {
        i.sync_failures.add(1, &[]);
    }
}

pub(crate) fn record_base_sync() {
    instruments().base_syncs.add(1, &[]);
}
