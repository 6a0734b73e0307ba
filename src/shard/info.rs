//! Shard information and statistics data structures
//!
//! Point-in-time views of individual shards and of the whole shard set, for
//! operators and tests.

use std::path::PathBuf;

use serde::Serialize;

use crate::record::CSV_HEADER;
use crate::shard::ShardId;

/// Information about a shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShardInfo {
    /// Shard ID
    pub id: ShardId,
    /// Shard file path
    pub path: PathBuf,
    /// Lines waiting in the queue
    pub pending: usize,
    /// Queue capacity
    pub capacity: usize,
    /// Size of the shard file in bytes, header included
    pub file_size_bytes: u64,
}

impl ShardInfo {
    /// Size of the data rows in the shard file
    pub fn data_bytes(&self) -> u64 {
        self.file_size_bytes.saturating_sub(CSV_HEADER.len() as u64)
    }

    /// Fraction of the queue in use (0.0 - 1.0)
    pub fn fill_ratio(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }

        self.pending as f64 / self.capacity as f64
    }

    /// Check if the shard has neither pending lines nor data rows
    pub fn is_empty(&self) -> bool {
        self.pending == 0 && self.data_bytes() == 0
    }
}

/// Statistics about shards
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShardStats {
    /// Number of shards
    pub shard_count: usize,
    /// Total lines waiting in queues
    pub pending_records: usize,
    /// Total queue capacity
    pub queue_capacity: usize,
    /// Total size of shard files in bytes
    pub file_size_bytes: u64,
    /// Total size of data rows in shard files
    pub data_bytes: u64,
    /// Shards with neither pending lines nor data rows
    pub empty_shards: usize,
}

impl ShardStats {
    /// Create new empty shard stats
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one shard's information
    pub fn add(&mut self, info: &ShardInfo) {
        self.shard_count += 1;
        self.pending_records += info.pending;
        self.queue_capacity += info.capacity;
        self.file_size_bytes += info.file_size_bytes;
        self.data_bytes += info.data_bytes();
        if info.is_empty() {
            self.empty_shards += 1;
        }
    }

    /// Calculate the average number of pending lines per shard
    pub fn avg_pending_per_shard(&self) -> f64 {
        if self.shard_count == 0 {
            return 0.0;
        }

        self.pending_records as f64 / self.shard_count as f64
    }

    /// Check if any shard has unflushed lines
    pub fn has_pending(&self) -> bool {
        self.pending_records > 0
    }
}

impl<'a> FromIterator<&'a ShardInfo> for ShardStats {
    fn from_iter<I: IntoIterator<Item = &'a ShardInfo>>(iter: I) -> Self {
        let mut stats = ShardStats::new();
        for info in iter {
            stats.add(info);
        }
        stats
    }
}
