use std::fmt::Write as _;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::{loader::LoadOutcome, merge::MergeOutcome};

pub struct Metrics {
    // Bulk loader
    pub rows_loaded_total: AtomicU64,
    pub rows_skipped_total: AtomicU64,

    // Aggregation merger
    pub rows_merged_total: AtomicU64,
    pub buckets_merged_total: AtomicU64,

    // Pipeline
    pub jobs_completed_total: AtomicU64,
    pub jobs_failed_total: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            rows_loaded_total: AtomicU64::new(0),
            rows_skipped_total: AtomicU64::new(0),
            rows_merged_total: AtomicU64::new(0),
            buckets_merged_total: AtomicU64::new(0),
            jobs_completed_total: AtomicU64::new(0),
            jobs_failed_total: AtomicU64::new(0),
        }
    }
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::default)
}

/// Called once the loading transaction has committed.
pub(crate) fn record_load(outcome: &LoadOutcome) {
    let m = metrics();
    m.rows_loaded_total
        .fetch_add(outcome.inserted_ids.len() as u64, Ordering::Relaxed);
    m.rows_skipped_total
        .fetch_add(outcome.skipped as u64, Ordering::Relaxed);
}

/// Called once the merging transaction has committed.
pub(crate) fn record_merge(outcome: &MergeOutcome) {
    let m = metrics();
    m.rows_merged_total
        .fetch_add(outcome.merged_rows as u64, Ordering::Relaxed);
    m.buckets_merged_total
        .fetch_add(outcome.buckets as u64, Ordering::Relaxed);
}

pub(crate) fn record_job(succeeded: bool) {
    let m = metrics();
    if succeeded {
        m.jobs_completed_total.fetch_add(1, Ordering::Relaxed);
    } else {
        m.jobs_failed_total.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn render_prometheus() -> String {
    let m = metrics();
    let mut s = String::new();
    // loader
    let _ = writeln!(
        s,
        "# TYPE rows_loaded_total counter\nrows_loaded_total {}",
        m.rows_loaded_total.load(Ordering::Relaxed)
    );
    let _ = writeln!(
        s,
        "# TYPE rows_skipped_total counter\nrows_skipped_total {}",
        m.rows_skipped_total.load(Ordering::Relaxed)
    );
    // merger
    let _ = writeln!(
        s,
        "# TYPE rows_merged_total counter\nrows_merged_total {}",
        m.rows_merged_total.load(Ordering::Relaxed)
    );
    let _ = writeln!(
        s,
        "# TYPE buckets_merged_total counter\nbuckets_merged_total {}",
        m.buckets_merged_total.load(Ordering::Relaxed)
    );
    // jobs
    let _ = writeln!(
        s,
        "# TYPE jobs_completed_total counter\njobs_completed_total {}",
        m.jobs_completed_total.load(Ordering::Relaxed)
    );
    let _ = writeln!(
        s,
        "# TYPE jobs_failed_total counter\njobs_failed_total {}",
        m.jobs_failed_total.load(Ordering::Relaxed)
    );
    s
}
