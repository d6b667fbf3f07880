// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for batchlink-core.
//!
//! Provides a unified error type with stable error codes that transport
//! adapters map onto their own status codes.

use std::fmt;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors that can occur while correlating batches and requests.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CoreError {
    /// Batch was not found in the record store.
    BatchNotFound {
        /// The batch ID that was not found.
        batch_id: String,
    },

    /// Batch already exists (duplicate create).
    BatchAlreadyExists {
        /// The batch ID that already exists.
        batch_id: String,
    },

    /// A resolution report referenced a request that was never registered.
    UnknownRequest {
        /// The request ID carried by the report.
        request_id: String,
    },

    /// A resolution report for a request that is no longer pending.
    AlreadyResolved {
        /// The owning batch.
        batch_id: String,
        /// The duplicate request ID.
        request_id: String,
    },

    /// A request ID is already registered under a different batch.
    Conflict {
        /// The colliding request ID.
        request_id: String,
        /// The batch the request is already registered to.
        existing_batch_id: String,
        /// The batch that attempted to claim it.
        batch_id: String,
    },

    /// Input validation failed.
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// A persisted record could not be decoded or failed shape validation.
    CorruptRecord {
        /// The key of the corrupt record.
        key: String,
        /// What was wrong with it.
        details: String,
    },

    /// Storage operation failed.
    StorageError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::BatchNotFound { .. } => "BATCH_NOT_FOUND",
            Self::BatchAlreadyExists { .. } => "BATCH_ALREADY_EXISTS",
            Self::UnknownRequest { .. } => "UNKNOWN_REQUEST",
            Self::AlreadyResolved { .. } => "ALREADY_RESOLVED",
            Self::Conflict { .. } => "REQUEST_CONFLICT",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::CorruptRecord { .. } => "CORRUPT_RECORD",
            Self::StorageError { .. } => "STORAGE_ERROR",
        }
    }

    /// Whether this error is an expected, absorbable outcome of callback
    /// delivery (unknown or duplicate request) rather than a failure.
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            Self::UnknownRequest { .. } | Self::AlreadyResolved { .. }
        )
    }

    pub(crate) fn storage(operation: &str, details: impl fmt::Display) -> Self {
        Self::StorageError {
            operation: operation.to_string(),
            details: details.to_string(),
        }
    }

    pub(crate) fn corrupt(key: &str, details: impl fmt::Display) -> Self {
        Self::CorruptRecord {
            key: key.to_string(),
            details: details.to_string(),
        }
    }

    pub(crate) fn validation(field: &str, message: impl Into<String>) -> Self {
        Self::ValidationError {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BatchNotFound { batch_id } => {
                write!(f, "Batch '{}' not found", batch_id)
            }
            Self::BatchAlreadyExists { batch_id } => {
                write!(f, "Batch '{}' already exists", batch_id)
            }
            Self::UnknownRequest { request_id } => {
                write!(f, "Request '{}' is not registered to any batch", request_id)
            }
            Self::AlreadyResolved {
                batch_id,
                request_id,
            } => {
                write!(
                    f,
                    "Request '{}' of batch '{}' was already resolved",
                    request_id, batch_id
                )
            }
            Self::Conflict {
                request_id,
                existing_batch_id,
                batch_id,
            } => {
                write!(
                    f,
                    "Request '{}' is registered to batch '{}', refusing to register it to '{}'",
                    request_id, existing_batch_id, batch_id
                )
            }
            Self::ValidationError { field, message } => {
                write!(f, "Validation error for '{}': {}", field, message)
            }
            Self::CorruptRecord { key, details } => {
                write!(f, "Corrupt record '{}': {}", key, details)
            }
            Self::StorageError { operation, details } => {
                write!(f, "Storage error during '{}': {}", operation, details)
            }
        }
    }
}

impl std::error::Error for CoreError {}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::StorageError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::StorageError {
            operation: "io".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::StorageError {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let test_cases = vec![
            (
                CoreError::BatchNotFound {
                    batch_id: "b-1".to_string(),
                },
                "BATCH_NOT_FOUND",
            ),
            (
                CoreError::BatchAlreadyExists {
                    batch_id: "b-1".to_string(),
                },
                "BATCH_ALREADY_EXISTS",
            ),
            (
                CoreError::UnknownRequest {
                    request_id: "r-1".to_string(),
                },
                "UNKNOWN_REQUEST",
            ),
            (
                CoreError::AlreadyResolved {
                    batch_id: "b-1".to_string(),
                    request_id: "r-1".to_string(),
                },
                "ALREADY_RESOLVED",
            ),
            (
                CoreError::Conflict {
                    request_id: "r-1".to_string(),
                    existing_batch_id: "b-1".to_string(),
                    batch_id: "b-2".to_string(),
                },
                "REQUEST_CONFLICT",
            ),
            (CoreError::validation("items", "empty"), "VALIDATION_ERROR"),
            (CoreError::corrupt("b-1", "bad json"), "CORRUPT_RECORD"),
            (CoreError::storage("write", "disk full"), "STORAGE_ERROR"),
        ];

        for (error, expected_code) in test_cases {
            assert_eq!(
                error.error_code(),
                expected_code,
                "Error {:?} should have code {}",
                error,
                expected_code
            );
            assert!(!error.to_string().is_empty());
        }
    }

    #[test]
    fn test_error_display() {
        let err = CoreError::BatchNotFound {
            batch_id: "abc".to_string(),
        };
        assert_eq!(err.to_string(), "Batch 'abc' not found");

        let err = CoreError::Conflict {
            request_id: "r-9".to_string(),
            existing_batch_id: "b-1".to_string(),
            batch_id: "b-2".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Request 'r-9' is registered to batch 'b-1', refusing to register it to 'b-2'"
        );

        let err = CoreError::storage("write", "disk full");
        assert_eq!(err.to_string(), "Storage error during 'write': disk full");
    }

    #[test]
    fn test_benign_classification() {
        assert!(
            CoreError::UnknownRequest {
                request_id: "r".to_string()
            }
            .is_benign()
        );
        assert!(
            CoreError::AlreadyResolved {
                batch_id: "b".to_string(),
                request_id: "r".to_string()
            }
            .is_benign()
        );
        assert!(
            !CoreError::Conflict {
                request_id: "r".to_string(),
                existing_batch_id: "b".to_string(),
                batch_id: "c".to_string()
            }
            .is_benign()
        );
        assert!(!CoreError::corrupt("b", "x").is_benign());
    }
}
