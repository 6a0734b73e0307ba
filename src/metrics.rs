use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use parking_lot::Mutex;
use serde::Serialize;

/// Performance metrics collector for a capture pipeline
#[derive(Debug)]
pub struct MetricsCollector {
    // Admission
    /// Packets handed to the processor
    packets_received: AtomicU64,
    /// Packets skipped because they were not IPv4
    packets_skipped: AtomicU64,
    /// Records accepted by a shard queue
    records_admitted: AtomicU64,
    /// Records dropped because a shard queue stayed full
    records_dropped: AtomicU64,

    // Flushing
    /// Number of flushes that wrote at least one record
    flush_count: AtomicU64,
    /// Number of flushes abandoned on an I/O error
    flush_failures: AtomicU64,
    /// Records written to shard files
    records_flushed: AtomicU64,
    /// Bytes written to shard files
    bytes_flushed: AtomicU64,
    /// Total flush duration in nanoseconds
    flush_duration_ns: AtomicU64,

    // Merging
    /// Number of completed merge cycles
    merge_count: AtomicU64,
    /// Number of abandoned merge cycles
    merge_failures: AtomicU64,
    /// Rows copied into merged files
    rows_merged: AtomicU64,
    /// Total merge duration in nanoseconds
    merge_duration_ns: AtomicU64,
    /// Last merge duration
    last_merge_duration: Mutex<Duration>,

    // Internal state
    /// Start time of the metrics collector
    start_time: Instant,
}

/// Point-in-time copy of the collector's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub packets_received: u64,
    pub packets_skipped: u64,
    pub records_admitted: u64,
    pub records_dropped: u64,
    pub flush_count: u64,
    pub flush_failures: u64,
    pub records_flushed: u64,
    pub bytes_flushed: u64,
    pub merge_count: u64,
    pub merge_failures: u64,
    pub rows_merged: u64,
    pub last_merge_duration_ms: u64,
    pub uptime_secs: u64,
}

impl MetricsSnapshot {
    /// Fraction of built records that were dropped (0.0 - 1.0)
    pub fn drop_rate(&self) -> f64 {
        let total = self.records_admitted + self.records_dropped;
        if total == 0 {
            return 0.0;
        }

        self.records_dropped as f64 / total as f64
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            packets_received: AtomicU64::new(0),
            packets_skipped: AtomicU64::new(0),
            records_admitted: AtomicU64::new(0),
            records_dropped: AtomicU64::new(0),

            flush_count: AtomicU64::new(0),
            flush_failures: AtomicU64::new(0),
            records_flushed: AtomicU64::new(0),
            bytes_flushed: AtomicU64::new(0),
            flush_duration_ns: AtomicU64::new(0),

            merge_count: AtomicU64::new(0),
            merge_failures: AtomicU64::new(0),
            rows_merged: AtomicU64::new(0),
            merge_duration_ns: AtomicU64::new(0),
            last_merge_duration: Mutex::new(Duration::from_secs(0)),

            start_time: Instant::now(),
        }
    }

    // Admission

    /// Record a packet handed to the processor
    pub fn record_received(&self) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        ::metrics::increment_counter!("netcap_packets_received_total");
    }

    /// Record a packet skipped by the record builder
    pub fn record_skipped(&self) {
        self.packets_skipped.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        ::metrics::increment_counter!("netcap_packets_skipped_total");
    }

    /// Record a record accepted by a shard queue
    pub fn record_admitted(&self) {
        self.records_admitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a record dropped at admission, returning the new drop total
    pub fn record_dropped(&self) -> u64 {
        #[cfg(feature = "metrics")]
        ::metrics::increment_counter!("netcap_records_dropped_total");
        self.records_dropped.fetch_add(1, Ordering::Relaxed) + 1
    }

    // Flushing

    /// Record a flush that wrote `records` lines totalling `bytes`
    pub fn record_flush(&self, records: usize, bytes: usize, duration: Duration) {
        self.flush_count.fetch_add(1, Ordering::Relaxed);
        self.records_flushed.fetch_add(records as u64, Ordering::Relaxed);
        self.bytes_flushed.fetch_add(bytes as u64, Ordering::Relaxed);
        self.flush_duration_ns.fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        ::metrics::counter!("netcap_records_flushed_total", records as u64);
    }

    /// Record an abandoned flush
    pub fn record_flush_failure(&self) {
        self.flush_failures.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        ::metrics::increment_counter!("netcap_flush_failures_total");
    }

    // Merging

    /// Record a completed merge cycle
    pub fn record_merge(&self, rows: u64, duration: Duration) {
        self.merge_count.fetch_add(1, Ordering::Relaxed);
        self.rows_merged.fetch_add(rows, Ordering::Relaxed);
        self.merge_duration_ns.fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
        *self.last_merge_duration.lock() = duration;
        #[cfg(feature = "metrics")]
        ::metrics::histogram!("netcap_merge_duration_seconds", duration.as_secs_f64());
    }

    /// Record an abandoned merge cycle
    pub fn record_merge_failure(&self) {
        self.merge_failures.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        ::metrics::increment_counter!("netcap_merge_failures_total");
    }

    // Getters

    /// Get number of records dropped at admission
    pub fn get_dropped_count(&self) -> u64 {
        self.records_dropped.load(Ordering::Relaxed)
    }

    /// Get number of records admitted to a queue
    pub fn get_admitted_count(&self) -> u64 {
        self.records_admitted.load(Ordering::Relaxed)
    }

    /// Get total flush duration
    pub fn get_flush_duration(&self) -> Duration {
        Duration::from_nanos(self.flush_duration_ns.load(Ordering::Relaxed))
    }

    /// Get total merge duration
    pub fn get_merge_duration(&self) -> Duration {
        Duration::from_nanos(self.merge_duration_ns.load(Ordering::Relaxed))
    }

    /// Get last merge duration
    pub fn get_last_merge_duration(&self) -> Duration {
        *self.last_merge_duration.lock()
    }

    /// Get time since the collector was created
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Take a snapshot of every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            packets_received: self.packets_received.load(Ordering::Relaxed),
            packets_skipped: self.packets_skipped.load(Ordering::Relaxed),
            records_admitted: self.records_admitted.load(Ordering::Relaxed),
            records_dropped: self.records_dropped.load(Ordering::Relaxed),
            flush_count: self.flush_count.load(Ordering::Relaxed),
            flush_failures: self.flush_failures.load(Ordering::Relaxed),
            records_flushed: self.records_flushed.load(Ordering::Relaxed),
            bytes_flushed: self.bytes_flushed.load(Ordering::Relaxed),
            merge_count: self.merge_count.load(Ordering::Relaxed),
            merge_failures: self.merge_failures.load(Ordering::Relaxed),
            rows_merged: self.rows_merged.load(Ordering::Relaxed),
            last_merge_duration_ms: self.get_last_merge_duration().as_millis() as u64,
            uptime_secs: self.uptime().as_secs(),
        }
    }
}
