//! # slalom-core: Pure Sync Logic for Slalom Timing
//!
//! Types and deterministic algorithms shared by the storage layer and the
//! sync engine. Nothing in this crate performs I/O.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Slalom Sync Architecture                            │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                 apps/slalom-cli (headless daemon)               │   │
//! │  └───────────────┬─────────────────────────────┬───────────────────┘   │
//! │                  │                             │                        │
//! │  ┌───────────────▼─────────────┐ ┌─────────────▼───────────────────┐   │
//! │  │  slalom-sync                │ │  slalom-db                      │   │
//! │  │  polling, queue, coordinator│ │  SQLite records, queue, cursors │   │
//! │  └───────────────┬─────────────┘ └─────────────┬───────────────────┘   │
//! │                  │                             │                        │
//! │  ┌───────────────▼─────────────────────────────▼───────────────────┐   │
//! │  │               ★ slalom-core (THIS CRATE) ★                      │   │
//! │  │                                                                 │   │
//! │  │   types      polling     backoff     broadcast    store         │   │
//! │  │   Entry      tiers       jittered    envelope     collaborator  │   │
//! │  │   Fault      ladders     retries     channel      traits        │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • NO TIMERS                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Entries, faults, queue items, environment enums
//! - [`polling`] - Polling tier precedence and interval ladders
//! - [`backoff`] - Retry delay with jitter
//! - [`broadcast`] - Cross-tab message envelope
//! - [`validation`] - Record shape checks
//! - [`store`] - Storage collaborator traits
//! - [`error`] - Domain error types
//!
//! ## Example Usage
//!
//! ```rust
//! use slalom_core::polling::{polling_config, PollingEnvironment};
//! use slalom_core::ConnectionQuality;
//!
//! let env = PollingEnvironment {
//!     quality: ConnectionQuality::Offline,
//!     ..PollingEnvironment::default()
//! };
//! assert_eq!(polling_config(&env).base_interval.as_millis(), 60_000);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod backoff;
pub mod broadcast;
pub mod error;
pub mod polling;
pub mod store;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use backoff::{RetryPolicy, MAX_RETRIES};
pub use broadcast::{channel_name, BroadcastMessage, BroadcastPayload, PresenceInfo};
pub use error::{CoreError, StoreError, StoreResult, ValidationError};
pub use polling::{PollingConfig, PollingEnvironment, PollingTier};
pub use store::{CursorStore, LocalStore, QueueStore, RecordStore};
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Maximum records sent in one batch request.
pub const MAX_BATCH_SIZE: usize = 10;
