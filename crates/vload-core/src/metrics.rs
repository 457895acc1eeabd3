//! Loader metrics with Prometheus text export.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Histogram bucket boundaries in milliseconds for batch load duration.
/// Converts to seconds: [1, 5, 15, 30, 60, 300, 900]
const LOAD_DURATION_BUCKETS_MS: [u64; 7] = [1_000, 5_000, 15_000, 30_000, 60_000, 300_000, 900_000];

/// Counters, gauges and a load-duration histogram for one process.
///
/// Invocations running in the same process share one instance; nothing here
/// is used for coordination.
#[derive(Debug, Default)]
pub struct LoaderMetrics {
    // === COUNTERS ===
    events_total: AtomicU64,
    events_rejected_total: AtomicU64,
    files_admitted_total: AtomicU64,
    files_duplicate_total: AtomicU64,
    files_filtered_total: AtomicU64,
    append_conflicts_total: AtomicU64,
    retry_ceiling_total: AtomicU64,
    rotations_total: AtomicU64,
    lock_races_lost_total: AtomicU64,
    batches_complete_total: AtomicU64,
    batches_failed_total: AtomicU64,
    target_failures_total: AtomicU64,
    notifications_total: AtomicU64,
    errors_total: AtomicU64,

    // === GAUGES ===
    last_batch_entries: AtomicU64,

    // === HISTOGRAM: batch_load_duration_seconds ===
    load_duration_sum_ms: AtomicU64,
    load_duration_count: AtomicU64,
    /// Cumulative bucket counts, last slot is +Inf
    load_duration_buckets: [AtomicU64; 8],
}

/// Snapshot of the load-duration histogram.
#[derive(Debug, Clone)]
pub struct LoadDurationHistogram {
    pub sum_seconds: f64,
    pub count: u64,
    /// (upper bound in seconds, cumulative count)
    pub buckets: Vec<(f64, u64)>,
    pub inf_bucket: u64,
}

impl LoaderMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_event(&self) {
        self.events_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_event_rejected(&self) {
        self.events_rejected_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_file_admitted(&self) {
        self.files_admitted_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_file_duplicate(&self) {
        self.files_duplicate_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_file_filtered(&self) {
        self.files_filtered_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_append_conflict(&self) {
        self.append_conflicts_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry_ceiling(&self) {
        self.retry_ceiling_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rotation(&self, entries: usize) {
        self.rotations_total.fetch_add(1, Ordering::Relaxed);
        self.last_batch_entries
            .store(entries as u64, Ordering::Relaxed);
    }

    pub fn record_lock_race_lost(&self) {
        self.lock_races_lost_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a closed batch and how long its load took.
    pub fn record_batch_closed(&self, complete: bool, failed_targets: usize, duration: Duration) {
        if complete {
            self.batches_complete_total.fetch_add(1, Ordering::Relaxed);
        } else {
            self.batches_failed_total.fetch_add(1, Ordering::Relaxed);
        }
        self.target_failures_total
            .fetch_add(failed_targets as u64, Ordering::Relaxed);

        let duration_ms = duration.as_millis() as u64;
        self.load_duration_sum_ms
            .fetch_add(duration_ms, Ordering::Relaxed);
        self.load_duration_count.fetch_add(1, Ordering::Relaxed);
        for (i, &bucket_ms) in LOAD_DURATION_BUCKETS_MS.iter().enumerate() {
            if duration_ms <= bucket_ms {
                self.load_duration_buckets[i].fetch_add(1, Ordering::Relaxed);
            }
        }
        self.load_duration_buckets[7].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_notification(&self) {
        self.notifications_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn events_total(&self) -> u64 {
        self.events_total.load(Ordering::Relaxed)
    }

    pub fn files_admitted_total(&self) -> u64 {
        self.files_admitted_total.load(Ordering::Relaxed)
    }

    pub fn files_duplicate_total(&self) -> u64 {
        self.files_duplicate_total.load(Ordering::Relaxed)
    }

    pub fn append_conflicts_total(&self) -> u64 {
        self.append_conflicts_total.load(Ordering::Relaxed)
    }

    pub fn rotations_total(&self) -> u64 {
        self.rotations_total.load(Ordering::Relaxed)
    }

    pub fn lock_races_lost_total(&self) -> u64 {
        self.lock_races_lost_total.load(Ordering::Relaxed)
    }

    pub fn batches_complete_total(&self) -> u64 {
        self.batches_complete_total.load(Ordering::Relaxed)
    }

    pub fn batches_failed_total(&self) -> u64 {
        self.batches_failed_total.load(Ordering::Relaxed)
    }

    pub fn errors_total(&self) -> u64 {
        self.errors_total.load(Ordering::Relaxed)
    }

    pub fn load_duration_histogram(&self) -> LoadDurationHistogram {
        LoadDurationHistogram {
            sum_seconds: self.load_duration_sum_ms.load(Ordering::Relaxed) as f64 / 1000.0,
            count: self.load_duration_count.load(Ordering::Relaxed),
            buckets: LOAD_DURATION_BUCKETS_MS
                .iter()
                .enumerate()
                .map(|(i, &ms)| {
                    (
                        ms as f64 / 1000.0,
                        self.load_duration_buckets[i].load(Ordering::Relaxed),
                    )
                })
                .collect(),
            inf_bucket: self.load_duration_buckets[7].load(Ordering::Relaxed),
        }
    }

    /// Export all metrics in Prometheus text exposition format.
    pub fn export_prometheus_text(&self) -> String {
        let mut out = String::with_capacity(4096);
        let load = |v: &AtomicU64| v.load(Ordering::Relaxed);

        let counters: [(&str, &str, &AtomicU64); 14] = [
            ("vload_events_total", "Event deliveries received", &self.events_total),
            ("vload_events_rejected_total", "Event deliveries rejected as unsupported", &self.events_rejected_total),
            ("vload_files_admitted_total", "Files admitted into a batch", &self.files_admitted_total),
            ("vload_files_duplicate_total", "Files skipped as already processed", &self.files_duplicate_total),
            ("vload_files_filtered_total", "Files excluded by the filename filter", &self.files_filtered_total),
            ("vload_append_conflicts_total", "Appends that found their batch no longer open", &self.append_conflicts_total),
            ("vload_retry_ceiling_total", "Appends that exhausted the retry ceiling", &self.retry_ceiling_total),
            ("vload_rotations_total", "Batches sealed and rotated", &self.rotations_total),
            ("vload_lock_races_lost_total", "Rotation attempts that found the batch already locked", &self.lock_races_lost_total),
            ("vload_batches_complete_total", "Batches loaded into every target", &self.batches_complete_total),
            ("vload_batches_failed_total", "Batches closed in error", &self.batches_failed_total),
            ("vload_target_failures_total", "Per-target load failures", &self.target_failures_total),
            ("vload_notifications_total", "Notifications published", &self.notifications_total),
            ("vload_errors_total", "Invocations that ended in error", &self.errors_total),
        ];
        for (name, help, value) in counters {
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} counter");
            let _ = writeln!(out, "{name} {}\n", load(value));
        }

        let _ = writeln!(out, "# HELP vload_last_batch_entries Entries in the most recently rotated batch");
        let _ = writeln!(out, "# TYPE vload_last_batch_entries gauge");
        let _ = writeln!(out, "vload_last_batch_entries {}\n", load(&self.last_batch_entries));

        let histogram = self.load_duration_histogram();
        let _ = writeln!(out, "# HELP vload_batch_load_duration_seconds Time from rotation to batch close");
        let _ = writeln!(out, "# TYPE vload_batch_load_duration_seconds histogram");
        for (le, count) in &histogram.buckets {
            let _ = writeln!(out, "vload_batch_load_duration_seconds_bucket{{le=\"{le}\"}} {count}");
        }
        let _ = writeln!(
            out,
            "vload_batch_load_duration_seconds_bucket{{le=\"+Inf\"}} {}",
            histogram.inf_bucket
        );
        let _ = writeln!(out, "vload_batch_load_duration_seconds_sum {}", histogram.sum_seconds);
        let _ = writeln!(out, "vload_batch_load_duration_seconds_count {}", histogram.count);

        out
    }
}
