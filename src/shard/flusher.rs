//! Periodic shard flushing
//!
//! A [`ShardFlusher`] is the task behind one shard's fixed-delay timer. Errors
//! never escape a run: they are logged with the shard ID, counted, and the next
//! tick retries.

use std::sync::Arc;
use std::time::Instant;

use super::{FlushOutcome, Shard};
use crate::metrics::MetricsCollector;

/// Flush task for one shard
#[derive(Debug, Clone)]
pub struct ShardFlusher {
    shard: Arc<Shard>,
    batch_size: usize,
    metrics: Arc<MetricsCollector>,
}

impl ShardFlusher {
    /// Create a flusher moving at most `batch_size` lines per run
    pub fn new(shard: Arc<Shard>, batch_size: usize, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            shard,
            batch_size,
            metrics,
        }
    }

    /// Get the flushed shard
    pub fn shard(&self) -> &Arc<Shard> {
        &self.shard
    }

    /// Run one flush; returns what was written, empty on error or idle queue
    pub fn run(&self) -> FlushOutcome {
        if self.shard.queue().is_empty() {
            return FlushOutcome::default();
        }

        let start = Instant::now();
        match self.shard.flush(self.batch_size) {
            Ok(outcome) => {
                if !outcome.is_empty() {
                    let duration = start.elapsed();
                    self.metrics.record_flush(outcome.records, outcome.bytes, duration);
                    tracing::debug!(
                        shard = self.shard.id(),
                        records = outcome.records,
                        bytes = outcome.bytes,
                        elapsed_ms = duration.as_millis() as u64,
                        "flushed shard"
                    );
                }
                outcome
            }
            Err(e) => {
                self.metrics.record_flush_failure();
                tracing::error!(
                    shard = self.shard.id(),
                    path = %self.shard.path().display(),
                    error = %e,
                    "shard flush failed"
                );
                FlushOutcome::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::util;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn test_run_flushes_one_batch() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("traffic_0.csv");
        util::initialize_file(&path)?;

        let shard = Arc::new(Shard::new(0, path.clone(), 16, 4096));
        let metrics = Arc::new(MetricsCollector::new());
        let flusher = ShardFlusher::new(shard.clone(), 3, metrics.clone());

        assert!(flusher.run().is_empty());

        for n in 1..=5 {
            shard.offer(format!("{}\n", n), Duration::ZERO);
        }
        assert_eq!(flusher.run().records, 3);
        assert_eq!(flusher.run().records, 2);
        assert!(flusher.run().is_empty());

        assert_eq!(util::read_data_rows(&path)?, vec!["1", "2", "3", "4", "5"]);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.flush_count, 2);
        assert_eq!(snapshot.records_flushed, 5);

        Ok(())
    }

    #[test_log::test]
    fn test_run_survives_io_errors() -> anyhow::Result<()> {
        let dir = tempdir()?;
        // A directory in place of the shard file cannot be opened for append
        let path = dir.path().join("traffic_0.csv");
        std::fs::create_dir(&path)?;

        let shard = Arc::new(Shard::new(0, path, 16, 4096));
        let metrics = Arc::new(MetricsCollector::new());
        let flusher = ShardFlusher::new(shard.clone(), 10, metrics.clone());

        shard.offer("1\n".into(), Duration::ZERO);
        assert!(flusher.run().is_empty());
        assert_eq!(metrics.snapshot().flush_failures, 1);
        // The line was never dequeued
        assert_eq!(shard.pending(), 1);

        Ok(())
    }
}
