//! Error types for TideKV

use thiserror::Error;

/// Result type alias for TideKV operations
pub type Result<T> = std::result::Result<T, TideError>;

/// TideKV error types
#[derive(Error, Debug)]
pub enum TideError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Invalid data format
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// A file or segment referenced by the engine does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The engine has been closed
    #[error("Engine is closed")]
    Closed,

    /// Writes are refused after a durability or repeated background failure
    #[error("Engine is read-only: {0}")]
    ReadOnly(String),

    /// Compaction error
    #[error("Compaction error: {0}")]
    Compaction(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TideError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, TideError::Io(_) | TideError::Compaction(_))
    }

    /// Check if error indicates corruption
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            TideError::Corruption(_) | TideError::ChecksumMismatch { .. }
        )
    }
}

impl From<bincode::Error> for TideError {
    fn from(e: bincode::Error) -> Self {
        TideError::InvalidFormat(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let err = TideError::ChecksumMismatch {
            expected: 1,
            actual: 2,
        };
        assert!(err.is_corruption());
        assert!(!err.is_retryable());

        let err = TideError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk"));
        assert!(err.is_retryable());
        assert!(!err.is_corruption());
    }
}
