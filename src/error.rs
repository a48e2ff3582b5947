//! Error types for the mosaic-nas search engine

use thiserror::Error;

/// Result type alias for mosaic operations
pub type Result<T> = std::result::Result<T, MosaicError>;

/// Main error type for the mosaic-nas framework
#[derive(Error, Debug)]
pub enum MosaicError {
    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    #[error("Operation already registered: {0}")]
    DuplicateName(String),

    #[error("Shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch { expected: String, actual: String },

    #[error("Non-finite loss at step {step}: {value}")]
    NonFiniteLoss { step: usize, value: f64 },

    #[error("Batch source exhausted: {0}")]
    ExhaustedIterator(String),

    #[error("Invalid model description: {0}")]
    InvalidDescription(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<serde_json::Error> for MosaicError {
    fn from(err: serde_json::Error) -> Self {
        MosaicError::SerializationError(err.to_string())
    }
}

impl From<bincode::Error> for MosaicError {
    fn from(err: bincode::Error) -> Self {
        MosaicError::SerializationError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MosaicError::UnknownOperation("sep_conv_9x9".to_string());
        assert_eq!(err.to_string(), "Unknown operation: sep_conv_9x9");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: MosaicError = io_err.into();
        assert!(matches!(err, MosaicError::IoError(_)));
    }
}
