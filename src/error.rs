//! Error types for the ANN engine

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, AnnError>;

/// Error types that can occur in engine operations
#[derive(Error, Debug)]
pub enum AnnError {
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Invalid index handle: {0}")]
    InvalidHandle(u64),

    #[error("Dataset mismatch: {0}")]
    DatasetMismatch(String),

    #[error("Corrupt index: {0}")]
    CorruptIndex(String),

    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    #[error("Point not found: {id}")]
    NotFound { id: usize },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl AnnError {
    /// Negative status code for callers that follow the count-or-sentinel
    /// convention. Every kind maps to a distinct value.
    pub fn code(&self) -> i64 {
        match self {
            AnnError::InvalidParameters(_) => -1,
            AnnError::DimensionMismatch { .. } => -2,
            AnnError::InvalidHandle(_) => -3,
            AnnError::DatasetMismatch(_) => -4,
            AnnError::CorruptIndex(_) => -5,
            AnnError::OutOfMemory(_) => -6,
            AnnError::NotFound { .. } => -7,
            AnnError::IoError(_) => -8,
            AnnError::SerializationError(_) => -9,
        }
    }

    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        AnnError::InvalidParameters(reason.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_codes_are_negative_and_distinct() {
        let errors = vec![
            AnnError::invalid("x"),
            AnnError::DimensionMismatch { expected: 1, actual: 2 },
            AnnError::InvalidHandle(7),
            AnnError::DatasetMismatch("x".into()),
            AnnError::CorruptIndex("x".into()),
            AnnError::OutOfMemory("x".into()),
            AnnError::NotFound { id: 3 },
            AnnError::IoError(std::io::Error::new(std::io::ErrorKind::Other, "x")),
            AnnError::SerializationError("x".into()),
        ];
        let codes: HashSet<i64> = errors.iter().map(AnnError::code).collect();
        assert_eq!(codes.len(), errors.len());
        assert!(codes.iter().all(|&c| c < 0));
    }

    #[test]
    fn test_display() {
        let err = AnnError::DimensionMismatch { expected: 3, actual: 2 };
        assert_eq!(err.to_string(), "Dimension mismatch: expected 3, got 2");
    }
}
