//! Error types shared by bulkflow crates

use thiserror::Error;

/// Result type alias for bulkflow operations
pub type Result<T> = std::result::Result<T, BulkflowError>;

/// Errors that are not specific to one pipeline stage
#[derive(Error, Debug)]
pub enum BulkflowError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

impl BulkflowError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn invalid_value(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.into(),
            value: value.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_value_display() {
        let err = BulkflowError::invalid_value("LOG_LEVEL", "loud");
        assert_eq!(err.to_string(), "Invalid value for LOG_LEVEL: loud");
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: BulkflowError = io.into();
        assert!(matches!(err, BulkflowError::Io(_)));
    }
}
