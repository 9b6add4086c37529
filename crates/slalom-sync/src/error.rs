//! # Sync Error Types
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │  Connectivity   │  │     Server              │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Offline        │  │  Server (5xx)           │ │
//! │  │  MissingDeviceId│  │  ConnectionFail │  │  Timeout                │ │
//! │  │  InvalidUrl     │  │                 │  │  Rejected (4xx)         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Authentication │  │  Race Context   │  │     Protocol            │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  AuthExpired    │  │  RaceChanged    │  │  Malformed              │ │
//! │  │  Unauthorized   │  │  RaceDeleted    │  │  SerializationFailed    │ │
//! │  │                 │  │  Cancelled      │  │                         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every decision point (status machine, polling error counter, queue retry
//! accounting) goes through [`SyncError::class`].

use slalom_core::{StoreError, ValidationError};
use thiserror::Error;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Coarse classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network unreachable or device offline.
    Connectivity,
    /// 5xx or request timeout.
    Server,
    /// 401 carrying `expired: true`.
    AuthExpired,
    /// Unparseable or wrongly shaped response.
    Malformed,
    /// The active race changed (or vanished) while the operation ran.
    RaceChanged,
    /// Request refused by the server (4xx other than an expired token).
    Rejected,
    /// Local failure (storage, configuration, channel).
    Internal,
}

/// Sync error type covering all possible sync failures.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    #[error("Device ID not configured. Run `slalom config init` first.")]
    MissingDeviceId,

    #[error("Invalid API URL: {0}")]
    InvalidUrl(String),

    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Connectivity Errors
    // =========================================================================
    /// The device reports no network.
    #[error("Device is offline")]
    Offline,

    /// The request never reached the server.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    // =========================================================================
    // Server Errors
    // =========================================================================
    /// The request exceeded its deadline and was aborted.
    #[error("Request timed out after {0} ms")]
    Timeout(u64),

    #[error("Server error (HTTP {status}): {message}")]
    Server { status: u16, message: String },

    #[error("Request rejected (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },

    /// The record failed local validation and was never sent.
    #[error("Invalid record: {0}")]
    InvalidRecord(#[from] ValidationError),

    // =========================================================================
    // Authentication Errors
    // =========================================================================
    /// 401 without an expiry marker.
    #[error("Unauthorized")]
    Unauthorized,

    /// 401 with `expired: true`. Requires re-authentication.
    #[error("Authentication expired")]
    AuthExpired,

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    #[error("Malformed response: {0}")]
    Malformed(String),

    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    // =========================================================================
    // Race Context Errors
    // =========================================================================
    /// The active race changed while the operation was in flight.
    #[error("Active race changed during operation")]
    RaceChanged,

    /// The server reports the race as deleted.
    #[error("Race {0} was deleted")]
    RaceDeleted(String),

    /// No race is active.
    #[error("Sync coordinator is not initialized")]
    NotInitialized,

    /// The operation was cancelled before it completed.
    #[error("Operation cancelled")]
    Cancelled,

    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

/// Transport-level reqwest failures. HTTP status handling lives in the
/// client, since it needs the response body.
impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SyncError::Timeout(0)
        } else if err.is_connect() || err.is_request() {
            SyncError::ConnectionFailed(err.to_string())
        } else if err.is_decode() {
            SyncError::Malformed(err.to_string())
        } else {
            SyncError::Internal(err.to_string())
        }
    }
}

// =============================================================================
// Error Categorization
// =============================================================================

impl SyncError {
    pub fn class(&self) -> ErrorClass {
        match self {
            SyncError::Offline | SyncError::ConnectionFailed(_) => ErrorClass::Connectivity,
            SyncError::Timeout(_) | SyncError::Server { .. } => ErrorClass::Server,
            SyncError::AuthExpired => ErrorClass::AuthExpired,
            SyncError::Unauthorized | SyncError::Rejected { .. } | SyncError::InvalidRecord(_) => {
                ErrorClass::Rejected
            }
            SyncError::Malformed(_) | SyncError::SerializationFailed(_) => ErrorClass::Malformed,
            SyncError::RaceChanged
            | SyncError::RaceDeleted(_)
            | SyncError::NotInitialized
            | SyncError::Cancelled => ErrorClass::RaceChanged,
            SyncError::InvalidConfig(_)
            | SyncError::MissingDeviceId
            | SyncError::InvalidUrl(_)
            | SyncError::ConfigLoadFailed(_)
            | SyncError::ConfigSaveFailed(_)
            | SyncError::Storage(_)
            | SyncError::Internal(_) => ErrorClass::Internal,
        }
    }

    /// Returns true if the same request may succeed later.
    pub fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::Connectivity | ErrorClass::Server)
    }

    /// Returns true if the failure means the device cannot reach the server.
    pub fn is_connectivity(&self) -> bool {
        self.class() == ErrorClass::Connectivity
    }

    /// Returns true if a failed send should bump the item's `retryCount`.
    ///
    /// Connectivity losses defer the item. Race-context failures leave it
    /// untouched.
    pub fn counts_against_retries(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::Server | ErrorClass::Rejected | ErrorClass::Malformed | ErrorClass::Internal
        )
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::MissingDeviceId
                | SyncError::InvalidUrl(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }
}
