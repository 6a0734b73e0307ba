//! Sharded record storage
//!
//! Records are spread across a fixed number of shards. Each shard pairs a
//! bounded queue of serialized lines with an append-only CSV file; a flusher
//! moves lines from the queue into the file and the merge coordinator
//! periodically consolidates and resets the files.

mod error;
mod flusher;
mod info;
mod manager;
mod queue;
mod router;
pub mod util;
mod writer;

pub use error::{ShardError, ShardResult};
pub use flusher::ShardFlusher;
pub use info::{ShardInfo, ShardStats};
pub use manager::ShardManager;
pub use queue::{Admission, ShardQueue};
pub use router::{shard_index, ShardRouter};
pub use writer::{FlushOutcome, ShardWriter};

use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};

/// Shard ID type
pub type ShardId = usize;

/// One shard: a bounded queue feeding a buffered file writer
#[derive(Debug)]
pub struct Shard {
    id: ShardId,
    path: PathBuf,
    queue: ShardQueue,
    writer: Mutex<ShardWriter>,
}

impl Shard {
    /// Create a shard; the file itself is not touched
    pub fn new(id: ShardId, path: PathBuf, queue_capacity: usize, buffer_size: usize) -> Self {
        Self {
            id,
            writer: Mutex::new(ShardWriter::new(path.clone(), buffer_size)),
            path,
            queue: ShardQueue::new(queue_capacity),
        }
    }

    /// Get the shard ID
    pub fn id(&self) -> ShardId {
        self.id
    }

    /// Get the shard file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get the shard queue
    pub fn queue(&self) -> &ShardQueue {
        &self.queue
    }

    /// Offer a serialized line, waiting at most `timeout` for space
    pub fn offer(&self, line: String, timeout: Duration) -> Admission {
        self.queue.offer(line, timeout)
    }

    /// Number of lines waiting to be flushed
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Acquire the shard lock
    pub fn lock(&self) -> MutexGuard<'_, ShardWriter> {
        self.writer.lock()
    }

    /// Flush up to `batch_size` queued lines into the shard file
    pub fn flush(&self, batch_size: usize) -> ShardResult<FlushOutcome> {
        if self.queue.is_empty() {
            return Ok(FlushOutcome::default());
        }

        self.writer.lock().flush_from(&self.queue, batch_size)
    }

    /// Flush everything queued at call time
    pub fn flush_pending(&self, batch_size: usize) -> ShardResult<FlushOutcome> {
        self.writer.lock().flush_pending(&self.queue, batch_size)
    }
}
