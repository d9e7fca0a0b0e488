//! Query error types

use crate::storage::StorageError;
use thiserror::Error;

/// Errors that can occur while answering a query
#[derive(Error, Debug)]
pub enum QueryError {
    /// Start is not before end, or a bound could not be parsed
    #[error("Invalid time range: {0}")]
    InvalidTimeRange(String),

    /// Malformed query parameters
    #[error("Invalid query: {0}")]
    Invalid(String),

    /// Storage layer error
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Result type for query operations
pub type QueryResult<T> = Result<T, QueryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_wraps() {
        let err: QueryError = StorageError::InvalidTimeRange.into();
        assert_eq!(
            err.to_string(),
            "Storage error: Invalid time range: start must be less than end"
        );
    }
}
