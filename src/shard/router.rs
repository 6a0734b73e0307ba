//! Record routing and admission
//!
//! Records are spread round-robin by sequence number: the record with
//! sequence `s` always lands in shard `(s - 1) mod N`. Admission waits a
//! bounded time for queue space and drops the record otherwise.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::{Admission, ShardManager};
use crate::metrics::MetricsCollector;
use crate::record::PacketRecord;

/// Shard index of the record with the given sequence number
pub fn shard_index(sequence: u64, shard_count: usize) -> usize {
    (sequence.saturating_sub(1) % shard_count as u64) as usize
}

/// Routes serialized records into shard queues
#[derive(Debug)]
pub struct ShardRouter {
    shards: Arc<ShardManager>,
    offer_timeout: Duration,
    metrics: Arc<MetricsCollector>,
    drops: DropReporter,
}

impl ShardRouter {
    /// Create a router over `shards`
    pub fn new(
        shards: Arc<ShardManager>,
        offer_timeout: Duration,
        drop_log_interval: Duration,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            shards,
            offer_timeout,
            metrics,
            drops: DropReporter::new(drop_log_interval),
        }
    }

    /// Serialize `record` and offer it to its shard
    pub fn route(&self, record: &PacketRecord) -> Admission {
        let index = shard_index(record.sequence, self.shards.len());
        let admission = match self.shards.shard(index) {
            Ok(shard) => shard.offer(record.to_csv_line(), self.offer_timeout),
            Err(e) => {
                tracing::error!(sequence = record.sequence, error = %e, "no shard for record");
                Admission::Dropped
            }
        };

        match admission {
            Admission::Accepted => self.metrics.record_admitted(),
            Admission::Dropped => {
                let total = self.metrics.record_dropped();
                self.drops.report(record.sequence, index, total);
            }
        }

        admission
    }

    /// Get the routed shard set
    pub fn shards(&self) -> &Arc<ShardManager> {
        &self.shards
    }
}

/// Logs dropped records at most once per interval
#[derive(Debug)]
struct DropReporter {
    min_interval: Duration,
    last_log_time: Mutex<Option<Instant>>,
    since_last_log: AtomicU64,
}

impl DropReporter {
    fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_log_time: Mutex::new(None),
            since_last_log: AtomicU64::new(0),
        }
    }

    /// Count a drop and warn if the interval has passed; returns whether it logged
    fn report(&self, sequence: u64, shard: usize, total: u64) -> bool {
        self.since_last_log.fetch_add(1, Ordering::Relaxed);

        let should_log = {
            let mut last_time = self.last_log_time.lock();
            let now = Instant::now();

            match *last_time {
                Some(last) if now.duration_since(last) < self.min_interval => false,
                _ => {
                    *last_time = Some(now);
                    true
                }
            }
        };

        if should_log {
            let count = self.since_last_log.swap(0, Ordering::Relaxed);
            tracing::warn!(
                sequence,
                shard,
                dropped = count,
                total_dropped = total,
                "shard queue full, dropping records"
            );
        }

        should_log
    }
}
