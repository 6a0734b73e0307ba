//! Error types for the shard module
//!
//! Defines error types specific to shard file and queue operations.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during shard operations
#[derive(Error, Debug)]
pub enum ShardError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// File error
    #[error("File error for {path:?}: {message}")]
    File {
        path: PathBuf,
        message: String,
    },

    /// Shard index outside of the configured range
    #[error("Invalid shard ID: {0}")]
    InvalidId(usize),
}

/// Result type for shard operations
pub type ShardResult<T> = std::result::Result<T, ShardError>;

impl ShardError {
    /// Create a new file error
    pub fn file_error(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::File {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a new invalid shard ID error
    pub fn invalid_id(id: usize) -> Self {
        Self::InvalidId(id)
    }

    /// Check if this is an I/O error
    pub fn is_io_error(&self) -> bool {
        matches!(self, Self::Io(_))
    }

    /// Check if this is a file error
    pub fn is_file_error(&self) -> bool {
        matches!(self, Self::File { .. })
    }

    /// Check if the underlying cause is a missing file
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Io(err) if err.kind() == io::ErrorKind::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_error_creation() {
        let err = ShardError::file_error("/path/to/traffic_0.csv", "append failed");
        assert!(matches!(err, ShardError::File { ref path, ref message }
            if path == &PathBuf::from("/path/to/traffic_0.csv") && message == "append failed"));
        assert!(err.is_file_error());

        let err = ShardError::invalid_id(7);
        assert_eq!(err.to_string(), "Invalid shard ID: 7");
    }

    #[test]
    fn test_shard_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err = ShardError::from(io_err);

        assert!(err.is_io_error());
        assert!(err.is_not_found());
    }
}
