//! Buffered shard file writer
//!
//! Each shard owns one [`ShardWriter`], guarded by the shard lock. The write
//! buffer is allocated once and reused by every flush.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use crate::record::CSV_HEADER;
use crate::shard::queue::ShardQueue;
use crate::shard::{util, ShardResult};

/// What a flush or copy moved
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushOutcome {
    /// Number of lines written
    pub records: usize,
    /// Number of bytes written
    pub bytes: usize,
}

impl FlushOutcome {
    /// Check if nothing was written
    pub fn is_empty(&self) -> bool {
        self.records == 0
    }

    fn absorb(&mut self, other: FlushOutcome) {
        self.records += other.records;
        self.bytes += other.bytes;
    }
}

/// Appends queued lines to a shard file through a reusable buffer
#[derive(Debug)]
pub struct ShardWriter {
    path: PathBuf,
    buffer: Vec<u8>,
    buffer_size: usize,
}

impl ShardWriter {
    /// Create a writer for `path` with a buffer of `buffer_size` bytes
    pub fn new(path: impl Into<PathBuf>, buffer_size: usize) -> Self {
        Self {
            path: path.into(),
            buffer: Vec::with_capacity(buffer_size),
            buffer_size,
        }
    }

    /// Get the shard file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Drain up to `batch_size` lines from `queue` and append them to the file
    ///
    /// The file is opened before anything is dequeued, so an unopenable file
    /// leaves the queue untouched.
    pub fn flush_from(&mut self, queue: &ShardQueue, batch_size: usize) -> ShardResult<FlushOutcome> {
        if queue.is_empty() {
            return Ok(FlushOutcome::default());
        }

        let mut file = util::open_append(&self.path)?;
        self.buffer.clear();

        let mut outcome = FlushOutcome::default();
        while outcome.records < batch_size {
            let Some(line) = queue.poll() else { break };
            let bytes = line.as_bytes();

            if self.buffer.len() + bytes.len() > self.buffer_size && !self.buffer.is_empty() {
                file.write_all(&self.buffer)?;
                self.buffer.clear();
            }

            if bytes.len() > self.buffer_size {
                file.write_all(bytes)?;
            } else {
                self.buffer.extend_from_slice(bytes);
            }

            outcome.records += 1;
            outcome.bytes += bytes.len();
        }

        if !self.buffer.is_empty() {
            file.write_all(&self.buffer)?;
            self.buffer.clear();
        }
        file.flush()?;

        Ok(outcome)
    }

    /// Drain everything queued at call time, in batches of `batch_size`
    pub fn flush_pending(&mut self, queue: &ShardQueue, batch_size: usize) -> ShardResult<FlushOutcome> {
        let pending = queue.len();
        let mut total = FlushOutcome::default();

        while total.records < pending {
            let outcome = self.flush_from(queue, batch_size.min(pending - total.records))?;
            if outcome.is_empty() {
                break;
            }
            total.absorb(outcome);
        }

        Ok(total)
    }

    /// Copy the data rows of the shard file into `out`, header excluded
    ///
    /// Exactly the header's byte length is skipped. A file that does not start
    /// with the header is still copied past that offset, with a warning. A
    /// missing file contributes nothing.
    pub fn copy_rows_into<W: Write>(&self, out: &mut W) -> ShardResult<FlushOutcome> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::warn!(path = %self.path.display(), "shard file missing, nothing to copy");
                return Ok(FlushOutcome::default());
            }
            Err(e) => return Err(e.into()),
        };

        let mut header = Vec::with_capacity(CSV_HEADER.len());
        (&mut file).take(CSV_HEADER.len() as u64).read_to_end(&mut header)?;
        if header != CSV_HEADER.as_bytes() {
            tracing::warn!(
                path = %self.path.display(),
                "shard file does not start with the CSV header"
            );
        }

        let mut counting = RowCounter::new(out);
        io::copy(&mut file, &mut counting)?;

        Ok(FlushOutcome {
            records: counting.rows,
            bytes: counting.bytes,
        })
    }

    /// Truncate the shard file back to the header line
    pub fn reset(&mut self) -> ShardResult<()> {
        util::initialize_file(&self.path)
    }
}

/// Writer adapter counting bytes and newline-terminated rows
struct RowCounter<'a, W> {
    inner: &'a mut W,
    rows: usize,
    bytes: usize,
}

impl<'a, W: Write> RowCounter<'a, W> {
    fn new(inner: &'a mut W) -> Self {
        Self {
            inner,
            rows: 0,
            bytes: 0,
        }
    }
}

impl<W: Write> Write for RowCounter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.rows += buf[..written].iter().filter(|&&b| b == b'\n').count();
        self.bytes += written;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
