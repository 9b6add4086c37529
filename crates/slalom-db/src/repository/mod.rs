//! # Repository Module
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Database                                                              │
//! │  ├── records()  → RecordRepository   entries + faults (JSON payloads)  │
//! │  ├── queue()    → QueueRepository    pending sends per race            │
//! │  └── cursors()  → CursorRepository   delta-sync watermarks             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod cursor;
pub mod queue;
pub mod records;
