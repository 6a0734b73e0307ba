//! Utility functions for shard files
//!
//! Provides helpers for creating, resetting and inspecting the CSV files that
//! back each shard.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;

use crate::record::CSV_HEADER;
use crate::shard::{ShardError, ShardResult};

/// Create a directory and its parents if they don't exist
pub fn ensure_dir(dir: &Path) -> ShardResult<()> {
    fs::create_dir_all(dir).map_err(|e| {
        ShardError::file_error(dir, format!("Failed to create directory: {}", e))
    })
}

/// Create or truncate a file so that it holds exactly the header line
pub fn initialize_file(path: &Path) -> ShardResult<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(|e| ShardError::file_error(path, format!("Failed to initialize file: {}", e)))?;

    file.write_all(CSV_HEADER.as_bytes())?;
    file.flush()?;

    Ok(())
}

/// Open an existing shard file for appending
///
/// A file that has disappeared is recreated with its header first, so rows
/// are never appended to a headerless file.
pub fn open_append(path: &Path) -> ShardResult<File> {
    match OpenOptions::new().append(true).open(path) {
        Ok(file) => Ok(file),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tracing::warn!(path = %path.display(), "shard file missing, recreating");
            initialize_file(path)?;
            Ok(OpenOptions::new().append(true).open(path)?)
        }
        Err(e) => Err(ShardError::file_error(path, format!("Failed to open for append: {}", e))),
    }
}

/// Get the size of a file in bytes, zero if it doesn't exist
pub fn file_len(path: &Path) -> u64 {
    fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

/// Read the data rows of a CSV file written by the pipeline, header excluded
pub fn read_data_rows(path: &Path) -> ShardResult<Vec<String>> {
    let reader = BufReader::new(File::open(path)?);
    let mut rows = Vec::new();

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if index == 0 {
            if format!("{}\n", line) != CSV_HEADER {
                return Err(ShardError::file_error(path, "File does not start with the CSV header"));
            }
            continue;
        }
        rows.push(line);
    }

    Ok(rows)
}

/// Check whether a file holds exactly the header line
pub fn is_header_only(path: &Path) -> ShardResult<bool> {
    Ok(fs::read(path)? == CSV_HEADER.as_bytes())
}
