//! Error types for COURIER operations

use thiserror::Error;

/// Cache store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Failed to serialize value for {key}: {reason}")]
    Serialization { key: String, reason: String },

    #[error("Failed to deserialize cached value for {key}: {reason}")]
    Deserialization { key: String, reason: String },
}

/// Endpoint declaration and lookup errors.
///
/// These are programmer errors: they are reported loudly rather than
/// degraded into empty data.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EndpointError {
    #[error("Endpoint {endpoint} is disabled and cannot be fetched")]
    Disabled { endpoint: String },

    #[error("Endpoint not declared: {endpoint}")]
    UnknownEndpoint { endpoint: String },

    #[error("Endpoint {endpoint} is a {actual} endpoint, not a {expected} endpoint")]
    KindMismatch {
        endpoint: String,
        expected: String,
        actual: String,
    },

    #[error("Endpoint {endpoint} was declared with different argument or result types")]
    TypeMismatch { endpoint: String },

    #[error("Endpoint declared twice: {endpoint}")]
    DuplicateEndpoint { endpoint: String },

    #[error("No endpoint exposes accessor {accessor}")]
    UnknownAccessor { accessor: String },
}

/// Failures of caller-supplied remote operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("Remote operation failed: {reason}")]
    Failed { reason: String },

    #[error("Remote operation rejected with code {code}: {reason}")]
    Rejected { code: i32, reason: String },

    #[error("Remote operation cancelled by teardown")]
    Cancelled,
}

impl RemoteError {
    /// Shorthand for [`RemoteError::Failed`].
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to parse configuration: {reason}")]
    Parse { reason: String },
}

/// Master error type for all COURIER errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CourierError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Endpoint error: {0}")]
    Endpoint(#[from] EndpointError),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl CourierError {
    /// Returns true if the error was produced because the facade was closed
    /// while the operation was in flight.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Remote(RemoteError::Cancelled))
    }
}

/// Result type alias for COURIER operations.
pub type CourierResult<T> = Result<T, CourierError>;

// =============================================================================
// TESTS
// =============================================================================
