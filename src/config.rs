//! Configuration for NetCap
//!
//! This module provides configuration options for the capture pipeline.
//! Every value has a default matching the reference deployment: four shards,
//! half-second flushes and a merge every ten seconds.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::{Serialize, Deserialize};

use crate::error::{Result, Error};
use crate::pipeline::LOCK_FILE_NAME;

/// Smallest write buffer accepted by [`PipelineConfig::validate`]
pub const MIN_WRITE_BUFFER_SIZE: usize = 4 * 1024;

/// Configuration options for a capture pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct PipelineConfig {
    // Sharding
    /// Number of shards (queue, buffer, file) the stream is split across
    pub shard_count: usize,
    /// Capacity of each shard queue, in records
    pub queue_capacity: usize,
    /// Maximum time a producer waits for queue space, in microseconds
    pub offer_timeout_us: u64,

    // Flushing
    /// Size of each shard's reusable write buffer in bytes
    pub write_buffer_size: usize,
    /// Maximum number of records drained per flush
    pub batch_size: usize,
    /// Delay between the end of one flush and the start of the next, in milliseconds
    pub flush_interval_ms: u64,

    // Merging
    /// Period of the merge cycle, in milliseconds
    pub merge_interval_ms: u64,
    /// Whether to fsync the merged file before publishing it
    pub sync_writes: bool,

    // Storage layout
    /// Directory holding the shard files
    pub base_dir: PathBuf,
    /// Directory holding the merged file
    pub merged_dir: PathBuf,
    /// Shard file name prefix ("traffic" -> "traffic_0.csv")
    pub shard_file_prefix: String,
    /// Merged file name
    pub merged_file_name: String,

    // Lifecycle
    /// Name registered with the host environment
    pub application_name: String,
    /// Priority of the packet processor within the packet source
    pub processor_priority: u32,
    /// Time budget for worker shutdown, in milliseconds
    pub shutdown_timeout_ms: u64,
    /// Minimum interval between two queue-full warnings, in milliseconds
    pub drop_log_interval_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            // Sharding
            shard_count: 4,
            queue_capacity: 1 << 20,
            offer_timeout_us: 50,

            // Flushing
            write_buffer_size: 16 * 1024 * 1024, // 16MB
            batch_size: 10_000,
            flush_interval_ms: 500,

            // Merging
            merge_interval_ms: 10_000,
            sync_writes: true,

            // Storage layout
            base_dir: PathBuf::from("traffic_data"),
            merged_dir: PathBuf::from("merged_data"),
            shard_file_prefix: "traffic".to_string(),
            merged_file_name: "merged_traffic.csv".to_string(),

            // Lifecycle
            application_name: "org.netcap.ddos-capture".to_string(),
            processor_priority: 2,
            shutdown_timeout_ms: 5_000,
            drop_log_interval_ms: 10_000,
        }
    }
}

impl PipelineConfig {
    /// Create a new pipeline configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of shards
    pub fn with_shard_count(mut self, count: usize) -> Self {
        self.shard_count = count;
        self
    }

    /// Set the capacity of each shard queue
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set the bounded wait for queue admission
    pub fn with_offer_timeout(mut self, timeout: Duration) -> Self {
        self.offer_timeout_us = timeout.as_micros() as u64;
        self
    }

    /// Set the write buffer size
    pub fn with_write_buffer_size(mut self, size: usize) -> Self {
        self.write_buffer_size = size;
        self
    }

    /// Set the maximum number of records drained per flush
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Set the flush delay
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the merge period
    pub fn with_merge_interval(mut self, interval: Duration) -> Self {
        self.merge_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set whether the merged file is fsynced before publishing
    pub fn with_sync_writes(mut self, sync: bool) -> Self {
        self.sync_writes = sync;
        self
    }

    /// Set the shard file directory
    pub fn with_base_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.base_dir = path.as_ref().to_path_buf();
        self
    }

    /// Set the merged file directory
    pub fn with_merged_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.merged_dir = path.as_ref().to_path_buf();
        self
    }

    /// Set the shard file name prefix
    pub fn with_shard_file_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.shard_file_prefix = prefix.into();
        self
    }

    /// Set the merged file name
    pub fn with_merged_file_name(mut self, name: impl Into<String>) -> Self {
        self.merged_file_name = name.into();
        self
    }

    /// Set the application name registered with the host
    pub fn with_application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = name.into();
        self
    }

    /// Set the packet processor priority
    pub fn with_processor_priority(mut self, priority: u32) -> Self {
        self.processor_priority = priority;
        self
    }

    /// Set the shutdown time budget
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the minimum interval between queue-full warnings
    pub fn with_drop_log_interval(mut self, interval: Duration) -> Self {
        self.drop_log_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.shard_count < 1 {
            return Err(Error::config("Shard count must be at least 1"));
        }

        if self.queue_capacity < 1 {
            return Err(Error::config("Queue capacity must be at least 1"));
        }

        if self.write_buffer_size < MIN_WRITE_BUFFER_SIZE {
            return Err(Error::config(format!(
                "Write buffer size must be at least {} bytes",
                MIN_WRITE_BUFFER_SIZE
            )));
        }

        if self.batch_size < 1 {
            return Err(Error::config("Batch size must be at least 1"));
        }

        if self.flush_interval_ms < 1 {
            return Err(Error::config("Flush interval must be at least 1ms"));
        }

        if self.merge_interval_ms < self.flush_interval_ms {
            return Err(Error::config(
                "Merge interval must not be shorter than the flush interval"
            ));
        }

        if self.shutdown_timeout_ms < 1 {
            return Err(Error::config("Shutdown timeout must be at least 1ms"));
        }

        if self.application_name.trim().is_empty() {
            return Err(Error::config("Application name must not be empty"));
        }

        if self.shard_file_prefix.is_empty() || self.shard_file_prefix.contains(['/', '\\']) {
            return Err(Error::config(
                "Shard file prefix must be a non-empty name without path separators"
            ));
        }

        if self.merged_file_name.is_empty() || self.merged_file_name.contains(['/', '\\']) {
            return Err(Error::config(
                "Merged file name must be a non-empty name without path separators"
            ));
        }

        if self.merged_dir == self.base_dir {
            if self.merged_file_name == LOCK_FILE_NAME {
                return Err(Error::config(format!(
                    "Merged file name must not be the lock file name '{}'",
                    LOCK_FILE_NAME
                )));
            }

            if let Some(id) = self.shard_id_of(&self.merged_file_name) {
                return Err(Error::config(format!(
                    "Merged file name '{}' collides with the file of shard {}",
                    self.merged_file_name, id
                )));
            }
        }

        Ok(())
    }

    /// Get the queue admission wait as a Duration
    pub fn offer_timeout(&self) -> Duration {
        Duration::from_micros(self.offer_timeout_us)
    }

    /// Get the flush delay as a Duration
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// Get the merge period as a Duration
    pub fn merge_interval(&self) -> Duration {
        Duration::from_millis(self.merge_interval_ms)
    }

    /// Get the shutdown budget as a Duration
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Get the drop warning interval as a Duration
    pub fn drop_log_interval(&self) -> Duration {
        Duration::from_millis(self.drop_log_interval_ms)
    }

    /// Path of the file backing shard `id`
    pub fn shard_path(&self, id: usize) -> PathBuf {
        self.base_dir.join(format!("{}_{}.csv", self.shard_file_prefix, id))
    }

    /// Shard id whose file is named `name`, if any
    fn shard_id_of(&self, name: &str) -> Option<usize> {
        let id = name
            .strip_prefix(self.shard_file_prefix.as_str())?
            .strip_prefix('_')?
            .strip_suffix(".csv")?;
        let id: usize = id.parse().ok()?;
        (id < self.shard_count && format!("{}_{}.csv", self.shard_file_prefix, id) == name).then_some(id)
    }

    /// Path of the merged file
    pub fn merged_path(&self) -> PathBuf {
        self.merged_dir.join(&self.merged_file_name)
    }

    /// Create a human-readable string representation of the configuration
    pub fn to_string_pretty(&self) -> String {
        let mut result = String::new();

        result.push_str("=== NetCap Configuration ===\n\n");

        result.push_str("Sharding:\n");
        result.push_str(&format!("  Shard Count: {}\n", self.shard_count));
        result.push_str(&format!("  Queue Capacity: {}\n", self.queue_capacity));
        result.push_str(&format!("  Offer Timeout: {} us\n", self.offer_timeout_us));

        result.push_str("\nFlushing:\n");
        result.push_str(&format!("  Write Buffer Size: {} KB\n", self.write_buffer_size / 1024));
        result.push_str(&format!("  Batch Size: {}\n", self.batch_size));
        result.push_str(&format!("  Flush Interval: {} ms\n", self.flush_interval_ms));

        result.push_str("\nMerging:\n");
        result.push_str(&format!("  Merge Interval: {} ms\n", self.merge_interval_ms));
        result.push_str(&format!("  Sync Writes: {}\n", self.sync_writes));

        result.push_str("\nStorage:\n");
        result.push_str(&format!("  Shard Files: {:?}\n", self.shard_path(0).with_file_name(
            format!("{}_<id>.csv", self.shard_file_prefix)
        )));
        result.push_str(&format!("  Merged File: {:?}\n", self.merged_path()));

        result.push_str("\nLifecycle:\n");
        result.push_str(&format!("  Application: {}\n", self.application_name));
        result.push_str(&format!("  Processor Priority: {}\n", self.processor_priority));
        result.push_str(&format!("  Shutdown Timeout: {} ms\n", self.shutdown_timeout_ms));

        result
    }

    /// Load configuration from a JSON file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;

        Ok(config)
    }

    /// Save configuration to a JSON file
    pub fn to_json_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;

        Ok(())
    }
}
