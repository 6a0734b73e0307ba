//! Shard set management
//!
//! Creates the shard directory and files, hands out shards by ID, and takes
//! every shard lock in ascending ID order for the merge coordinator.

use std::path::Path;
use std::sync::Arc;

use parking_lot::MutexGuard;

use super::{util, FlushOutcome, Shard, ShardError, ShardId, ShardInfo, ShardResult, ShardStats, ShardWriter};
use crate::config::PipelineConfig;

/// Owns the fixed set of shards of one pipeline run
#[derive(Debug)]
pub struct ShardManager {
    shards: Vec<Arc<Shard>>,
    batch_size: usize,
}

impl ShardManager {
    /// Create the base directory and one freshly initialized file per shard
    pub fn open(config: &PipelineConfig) -> ShardResult<Self> {
        util::ensure_dir(&config.base_dir)?;

        let mut shards = Vec::with_capacity(config.shard_count);
        for id in 0..config.shard_count {
            let path = config.shard_path(id);
            util::initialize_file(&path)?;
            shards.push(Arc::new(Shard::new(
                id,
                path,
                config.queue_capacity,
                config.write_buffer_size,
            )));
        }

        tracing::debug!(
            shards = config.shard_count,
            dir = %config.base_dir.display(),
            "shard files initialized"
        );

        Ok(Self {
            shards,
            batch_size: config.batch_size,
        })
    }

    /// Number of shards
    pub fn len(&self) -> usize {
        self.shards.len()
    }

    /// Check if there are no shards
    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    /// Get all shards, ordered by ID
    pub fn shards(&self) -> &[Arc<Shard>] {
        &self.shards
    }

    /// Get a shard by ID
    pub fn shard(&self, id: ShardId) -> ShardResult<&Arc<Shard>> {
        self.shards.get(id).ok_or_else(|| ShardError::invalid_id(id))
    }

    /// Maximum number of lines moved by one flush
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Acquire every shard lock in ascending ID order
    pub fn lock_all(&self) -> Vec<(&Shard, MutexGuard<'_, ShardWriter>)> {
        self.shards
            .iter()
            .map(|shard| (shard.as_ref(), shard.lock()))
            .collect()
    }

    /// Flush everything pending in every shard
    ///
    /// Every shard is attempted; the first error is returned after the rest
    /// have been flushed.
    pub fn flush_all(&self) -> ShardResult<FlushOutcome> {
        let mut total = FlushOutcome::default();
        let mut first_error = None;

        for shard in &self.shards {
            match shard.flush_pending(self.batch_size) {
                Ok(outcome) => {
                    total.records += outcome.records;
                    total.bytes += outcome.bytes;
                }
                Err(e) => {
                    tracing::error!(shard = shard.id(), error = %e, "forced flush failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(total),
        }
    }

    /// Get information about one shard
    pub fn shard_info(&self, id: ShardId) -> ShardResult<ShardInfo> {
        Ok(describe(self.shard(id)?))
    }

    /// List all shards
    pub fn list_shards(&self) -> Vec<ShardInfo> {
        self.shards.iter().map(|shard| describe(shard)).collect()
    }

    /// Get statistics about all shards
    pub fn stats(&self) -> ShardStats {
        self.list_shards().iter().collect()
    }

    /// Directory holding the shard files
    pub fn dir(&self) -> Option<&Path> {
        self.shards.first().and_then(|shard| shard.path().parent())
    }
}

fn describe(shard: &Shard) -> ShardInfo {
    ShardInfo {
        id: shard.id(),
        path: shard.path().to_path_buf(),
        pending: shard.pending(),
        capacity: shard.queue().capacity(),
        file_size_bytes: util::file_len(shard.path()),
    }
}
