//! Error handling for NetCap
//!
//! This module provides error types and result aliases for pipeline operations.

use std::fmt;
use std::io;
use thiserror::Error;

use crate::shard::ShardError;

/// Stage of a merge cycle, used to give merge failures context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStage {
    /// Draining shard queues into shard files
    Flush,
    /// Creating the temporary merged file
    Create,
    /// Copying the rows of one shard
    Copy(usize),
    /// Renaming the temporary file over the merged path
    Publish,
    /// Resetting shard files to the header line
    Reset(usize),
}

impl fmt::Display for MergeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flush => write!(f, "flush"),
            Self::Create => write!(f, "create"),
            Self::Copy(shard) => write!(f, "copy shard {}", shard),
            Self::Publish => write!(f, "publish"),
            Self::Reset(shard) => write!(f, "reset shard {}", shard),
        }
    }
}

/// Errors that can occur in NetCap operations
#[derive(Error, Debug)]
pub enum Error {
    /// Errors related to storage directories and locks
    #[error("Storage error: {0}")]
    Storage(String),

    /// Errors related to I/O operations
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Errors related to serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Errors related to configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors raised by a shard
    #[error("Shard error: {0}")]
    Shard(#[from] ShardError),

    /// Errors raised during a merge cycle
    #[error("Merge error during {stage}: {message}")]
    Merge {
        stage: MergeStage,
        message: String,
    },

    /// Errors related to the pipeline lifecycle
    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    /// Errors reported by the host environment or packet source
    #[error("Host error: {0}")]
    Host(String),

    /// Errors related to frame decoding
    #[error("Decode error: {0}")]
    Decode(String),
}

/// Result type for NetCap operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a new storage error
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    /// Create a new configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a new merge error for the given stage
    pub fn merge(stage: MergeStage, message: impl fmt::Display) -> Self {
        Self::Merge {
            stage,
            message: message.to_string(),
        }
    }

    /// Create a new lifecycle error
    pub fn lifecycle(message: impl Into<String>) -> Self {
        Self::Lifecycle(message.into())
    }

    /// Create a new host error
    pub fn host(message: impl Into<String>) -> Self {
        Self::Host(message.into())
    }

    /// Create a new decode error
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode(message.into())
    }

    /// Check if this is an I/O error
    pub fn is_io_error(&self) -> bool {
        matches!(self, Self::Io(_))
    }

    /// Check if this is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// Check if this is a merge error
    pub fn is_merge_error(&self) -> bool {
        matches!(self, Self::Merge { .. })
    }

    /// Check if this is a lifecycle error
    pub fn is_lifecycle_error(&self) -> bool {
        matches!(self, Self::Lifecycle(_))
    }

    /// Get the merge stage if this is a merge error
    pub fn merge_stage(&self) -> Option<MergeStage> {
        match self {
            Self::Merge { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Get a user-friendly suggestion for resolving the error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::Storage(_) => Some("Check that the capture directories exist, are writable and not used by another pipeline".to_string()),
            Self::Io(err) if err.kind() == io::ErrorKind::NotFound => {
                Some("The specified file or directory does not exist".to_string())
            }
            Self::Io(err) if err.kind() == io::ErrorKind::PermissionDenied => {
                Some("You don't have permission to access this file or directory".to_string())
            }
            Self::Merge { .. } => Some("Shard files were left intact; the next merge cycle retries".to_string()),
            Self::Config(_) => Some("Review the pipeline configuration values".to_string()),
            Self::Lifecycle(_) => Some("Stop the pipeline before starting it again".to_string()),
            _ => None,
        }
    }
}
