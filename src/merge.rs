//! Merge coordination
//!
//! A merge cycle consolidates every shard file into one merged CSV file and
//! then resets the shard files to their header. The whole cycle runs with every
//! shard lock held, taken in ascending ID order, so no flush can interleave
//! with the copy or the reset.
//!
//! The merged file is written to a temporary file in the merged directory and
//! renamed over the previous one, so readers only ever see a complete file.
//! Each cycle replaces the previous merged file with the rows gathered since
//! the last cycle.

use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tempfile::NamedTempFile;

use crate::config::PipelineConfig;
use crate::error::{Error, MergeStage, Result};
use crate::metrics::MetricsCollector;
use crate::record::CSV_HEADER;
use crate::shard::{util, ShardManager};

/// Summary of a completed merge cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    /// Data rows in the merged file
    pub rows: u64,
    /// Size of the merged file in bytes, header included
    pub bytes: u64,
    /// Number of shard files merged
    pub shards: usize,
    /// Path of the merged file
    pub path: PathBuf,
    /// CRC32 of the merged file contents
    pub checksum: u32,
    /// Time spent in the cycle, lock acquisition included
    pub duration: Duration,
    /// When the merged file was published
    pub completed_at: DateTime<Utc>,
}

/// Consolidates shard files into the merged file
#[derive(Debug)]
pub struct MergeCoordinator {
    shards: Arc<ShardManager>,
    merged_dir: PathBuf,
    merged_path: PathBuf,
    sync_writes: bool,
    metrics: Arc<MetricsCollector>,
    cycle: Mutex<()>,
}

impl MergeCoordinator {
    /// Create a coordinator writing to the merged path of `config`
    pub fn new(shards: Arc<ShardManager>, config: &PipelineConfig, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            shards,
            merged_dir: config.merged_dir.clone(),
            merged_path: config.merged_path(),
            sync_writes: config.sync_writes,
            metrics,
            cycle: Mutex::new(()),
        }
    }

    /// Get the merged file path
    pub fn merged_path(&self) -> &Path {
        &self.merged_path
    }

    /// Run one merge cycle
    ///
    /// Cycles are serialized. A failure before the merged file is published
    /// leaves every shard file as it was, so the next cycle picks the rows up.
    pub fn run_cycle(&self) -> Result<MergeReport> {
        let _cycle = self.cycle.lock();
        let start = Instant::now();

        match self.merge_locked(start) {
            Ok(report) => {
                self.metrics.record_merge(report.rows, report.duration);
                tracing::info!(
                    rows = report.rows,
                    bytes = report.bytes,
                    checksum = report.checksum,
                    elapsed_ms = report.duration.as_millis() as u64,
                    path = %report.path.display(),
                    "files merged"
                );
                Ok(report)
            }
            Err(e) => {
                self.metrics.record_merge_failure();
                Err(e)
            }
        }
    }

    /// Timer entry point: run a cycle and log a failure instead of returning it
    pub fn run_scheduled(&self) {
        if let Err(e) = self.run_cycle() {
            let stage = e.merge_stage().map(|s| s.to_string()).unwrap_or_default();
            tracing::error!(stage = %stage, error = %e, "merge cycle abandoned, will retry");
        }
    }

    fn merge_locked(&self, start: Instant) -> Result<MergeReport> {
        let batch_size = self.shards.batch_size();
        let mut guards = self.shards.lock_all();

        for (shard, writer) in guards.iter_mut() {
            writer
                .flush_pending(shard.queue(), batch_size)
                .map_err(|e| Error::merge(MergeStage::Flush, format!("shard {}: {}", shard.id(), e)))?;
        }

        util::ensure_dir(&self.merged_dir).map_err(|e| Error::merge(MergeStage::Create, e))?;
        let mut temp = NamedTempFile::new_in(&self.merged_dir).map_err(|e| Error::merge(MergeStage::Create, e))?;

        let mut hasher = crc32fast::Hasher::new();
        let mut rows = 0u64;
        let bytes = {
            let mut out = BufWriter::new(ChecksumWriter::new(temp.as_file_mut(), &mut hasher));
            out.write_all(CSV_HEADER.as_bytes())
                .map_err(|e| Error::merge(MergeStage::Create, e))?;

            let mut bytes = CSV_HEADER.len() as u64;
            for (shard, writer) in guards.iter() {
                let copied = writer
                    .copy_rows_into(&mut out)
                    .map_err(|e| Error::merge(MergeStage::Copy(shard.id()), e))?;
                rows += copied.records as u64;
                bytes += copied.bytes as u64;
            }

            out.flush().map_err(|e| Error::merge(MergeStage::Publish, e))?;
            bytes
        };

        if self.sync_writes {
            temp.as_file()
                .sync_all()
                .map_err(|e| Error::merge(MergeStage::Publish, e))?;
        }
        temp.persist(&self.merged_path)
            .map_err(|e| Error::merge(MergeStage::Publish, e.error))?;

        // The merged file already holds every shard's rows; a shard left unreset merges them again
        let mut first_error = None;
        for (shard, writer) in guards.iter_mut() {
            if let Err(e) = writer.reset() {
                tracing::error!(shard = shard.id(), error = %e, "shard reset failed after publish");
                first_error.get_or_insert(Error::merge(MergeStage::Reset(shard.id()), e));
            }
        }
        let shards = guards.len();
        drop(guards);

        if let Some(e) = first_error {
            return Err(e);
        }

        Ok(MergeReport {
            rows,
            bytes,
            shards,
            path: self.merged_path.clone(),
            checksum: hasher.finalize(),
            duration: start.elapsed(),
            completed_at: Utc::now(),
        })
    }
}

/// Writer adapter feeding everything written into a CRC32 hasher
struct ChecksumWriter<'a, W> {
    inner: W,
    hasher: &'a mut crc32fast::Hasher,
}

impl<'a, W: Write> ChecksumWriter<'a, W> {
    fn new(inner: W, hasher: &'a mut crc32fast::Hasher) -> Self {
        Self { inner, hasher }
    }
}

impl<W: Write> Write for ChecksumWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.hasher.update(&buf[..written]);
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
