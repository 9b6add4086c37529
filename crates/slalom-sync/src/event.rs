//! Outcomes the engine reports to the embedding application.

use slalom_core::{ConnectionStatus, EpochMillis, RecordKind};
use std::sync::Mutex;

use crate::error::ErrorClass;

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    StatusChanged(ConnectionStatus),

    FetchCompleted {
        kind: RecordKind,
        merged: usize,
        removed: usize,
        discarded: usize,
        cursor: EpochMillis,
    },

    FetchFailed {
        kind: RecordKind,
        class: ErrorClass,
        message: String,
    },

    /// The cloud acknowledged a record.
    Sent { kind: RecordKind, id: String },

    /// A record went to the retry queue instead.
    Queued { kind: RecordKind, id: String },

    /// Another device already recorded the same event on the server.
    CrossDeviceDuplicate { kind: RecordKind, id: String },

    /// The server accepted the entry but not its photo.
    PhotoSkipped { id: String },

    /// Local records from several devices describe the same event.
    DuplicateDetected {
        kind: RecordKind,
        key: String,
        device_ids: Vec<String>,
    },

    CloudInfo {
        device_count: Option<u32>,
        highest_bib: Option<u32>,
    },

    /// A sibling session merged or removed a record.
    RemoteChange {
        kind: RecordKind,
        id: String,
        device_id: Option<String>,
    },

    Presence { device_id: Option<String>, device_name: String },

    /// The token expired. The coordinator tore down.
    AuthExpired,

    /// The server deleted the race. The coordinator tore down.
    RaceDeleted { race_id: String },
}

/// Receives engine events (UI bridge, CLI logger).
pub trait SyncEventEmitter: Send + Sync {
    fn emit(&self, event: &SyncEvent);
}

/// Drops every event.
pub struct NoOpEmitter;

impl SyncEventEmitter for NoOpEmitter {
    fn emit(&self, _event: &SyncEvent) {}
}

/// Keeps every event in memory.
#[derive(Default)]
pub struct RecordingEmitter {
    events: Mutex<Vec<SyncEvent>>,
}

impl RecordingEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SyncEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn take(&self) -> Vec<SyncEvent> {
        self.events.lock().map(|mut e| std::mem::take(&mut *e)).unwrap_or_default()
    }
}

impl SyncEventEmitter for RecordingEmitter {
    fn emit(&self, event: &SyncEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
