//! # slalom-db: Database Layer for Slalom Sync
//!
//! Local SQLite persistence for timing records, pending-send queues and
//! delta-sync cursors.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  slalom-sync engine                                                    │
//! │       │  RecordStore / QueueStore / CursorStore (slalom-core traits)   │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     slalom-db (THIS CRATE)                      │   │
//! │  │                                                                 │   │
//! │  │   Database (pool.rs) ──► RecordRepository                       │   │
//! │  │                      ──► QueueRepository                        │   │
//! │  │                      ──► CursorRepository                       │   │
//! │  │   Migrations (embedded, migrations/sqlite)                      │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SQLite database file (WAL)                                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use slalom_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("path/to/slalom.db")).await?;
//! let entries: Vec<Entry> = db.records().list("race-1").await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;
pub mod store;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};

pub use repository::cursor::CursorRepository;
pub use repository::queue::QueueRepository;
pub use repository::records::RecordRepository;
