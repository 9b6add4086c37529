//! # Error Types
//!
//! Domain-specific error types for slalom-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  slalom-core errors (this file)                                        │
//! │  ├── CoreError        - General domain errors                          │
//! │  ├── ValidationError  - Ill-formed entries / faults                    │
//! │  └── StoreError       - Failures reported by a storage collaborator    │
//! │                                                                         │
//! │  slalom-db errors (separate crate)                                     │
//! │  └── DbError          - SQLite failures, converted into StoreError     │
//! │                                                                         │
//! │  slalom-sync errors (separate crate)                                   │
//! │  └── SyncError        - Network, protocol, race-context failures       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Core domain errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A record failed validation.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// The storage collaborator failed.
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    /// A record could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Serialization(err.to_string())
    }
}

// =============================================================================
// Validation Error
// =============================================================================

/// Validation failures for timing records.
///
/// Remote records that fail validation are dropped from a merge, never
/// partially applied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: &'static str },

    /// A field exceeds its maximum length.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: &'static str, max: usize },

    /// Run number outside the supported range.
    #[error("Run must be 1 or 2, got {0}")]
    InvalidRun(u8),

    /// Gate range where start is after end.
    #[error("Invalid gate range {start}-{end}")]
    InvalidGateRange { start: u32, end: u32 },

    /// A value could not be parsed into a known variant.
    #[error("Invalid {field}: {value}")]
    InvalidValue { field: &'static str, value: String },
}

// =============================================================================
// Store Error
// =============================================================================

/// Error reported by a storage collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The backing store is unavailable.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A read or write failed.
    #[error("Store operation failed: {0}")]
    Operation(String),

    /// A persisted record could not be decoded.
    #[error("Corrupt record {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Result type for storage collaborators.
pub type StoreResult<T> = Result<T, StoreError>;
