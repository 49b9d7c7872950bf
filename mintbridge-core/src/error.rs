use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::hbar::Hbar;
use crate::id::LedgerTokenId;

/// A required input field was missing or unusable. Rejected before any side effect.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid `{field}`: {reason}")]
pub struct ValidationError {
    pub field: String,
    pub reason: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn missing(field: impl Into<String>) -> Self {
        Self::new(field, "required field is missing")
    }
}

/// Represents all possible errors that can occur when interacting with the local state store
#[derive(Error, Debug)]
pub enum StorageError {
    /// Database errors that occur with the underlying storage backend
    #[error("Database error: {0}")]
    Database(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Errors related to missing data
    #[error("Not found: {0}")]
    NotFound(String),

    /// Generic errors that don't fit in other categories
    #[error("Other error: {0}")]
    Other(String),

    /// Anyhow error wrapper for error context
    #[error(transparent)]
    Context(#[from] anyhow::Error),
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StorageError::NotFound("Row not found".to_string()),
            _ => StorageError::Database(err.to_string()),
        }
    }
}

// A stored value that no longer decodes into its domain type
impl From<ValidationError> for StorageError {
    fn from(err: ValidationError) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Failures reported by the distributed ledger. None of them are retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("network failure: {0}")]
    Network(String),

    #[error("insufficient transaction fee: requires {required}, maximum is {max}")]
    InsufficientFee { required: Hbar, max: Hbar },

    #[error("payer {payer} balance {balance} cannot cover {required}")]
    InsufficientBalance {
        payer: String,
        balance: Hbar,
        required: Hbar,
    },

    #[error("signature rejected: {0}")]
    SignatureRejected(String),

    #[error("unknown ledger entity: {0}")]
    UnknownEntity(String),

    #[error("metadata is {len} bytes, the ledger accepts at most {max}")]
    MetadataTooLarge { len: usize, max: usize },

    #[error("token class {0} has reached its maximum supply")]
    SupplyExhausted(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("ledger call timed out after {0:?}")]
    Timeout(Duration),
}

/// The batch file could not be fetched or read to completion
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("failed to fetch {location}: {reason}")]
    Fetch { location: String, reason: String },

    #[error("I/O error while streaming batch: {0}")]
    Io(#[from] io::Error),

    #[error("batch file is not valid delimited text: {0}")]
    Csv(String),
}

/// Errors surfaced by the marketplace transitions
#[derive(Error, Debug)]
pub enum MarketError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("token {0} not found")]
    NotFound(LedgerTokenId),

    #[error("token {0} is not available for sale")]
    NotAvailable(LedgerTokenId),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError::missing("serial");
        assert_eq!(err.to_string(), "invalid `serial`: required field is missing");
    }

    #[test]
    fn test_market_error_distinguishes_not_found() {
        let token = LedgerTokenId::mirrored("A");
        let not_found = MarketError::NotFound(token.clone());
        let not_available = MarketError::NotAvailable(token);
        assert!(not_found.to_string().contains("not found"));
        assert!(not_available.to_string().contains("not available"));
    }
}
