//! # Domain Types
//!
//! Timing records, queue records and the environment signals the sync engine
//! reacts to.
//!
//! ## Record Identity
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Record Identity                                  │
//! │                                                                         │
//! │  Entry / FaultEntry                                                    │
//! │  ──────────────────                                                    │
//! │  identity = (id, deviceId)                                             │
//! │                                                                         │
//! │  Two timers may generate the same short id offline; the device id      │
//! │  keeps them apart. Tombstones (`deletedIds`) from the cloud match on   │
//! │  `id` alone.                                                           │
//! │                                                                         │
//! │  Records are immutable once created. The sync core only annotates      │
//! │  `syncedAt` once the cloud acknowledges a record.                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ValidationError;
use crate::validation;

/// Milliseconds since the Unix epoch.
pub type EpochMillis = i64;

// =============================================================================
// Record Kind & Key
// =============================================================================

/// The two record families that are synchronized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// Start/finish timing entries.
    Entry,
    /// Gate judge faults.
    Fault,
}

impl RecordKind {
    /// Stable name used for storage keys and logging.
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Entry => "entry",
            RecordKind::Fault => "fault",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a record: `(id, deviceId)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordKey {
    pub id: String,
    pub device_id: String,
}

impl RecordKey {
    pub fn new(id: impl Into<String>, device_id: impl Into<String>) -> Self {
        RecordKey {
            id: id.into(),
            device_id: device_id.into(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.device_id)
    }
}

/// Behaviour shared by every record the engine synchronizes.
pub trait SyncRecord:
    Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Which family this record belongs to.
    const KIND: RecordKind;

    fn id(&self) -> &str;

    fn device_id(&self) -> &str;

    fn key(&self) -> RecordKey {
        RecordKey::new(self.id(), self.device_id())
    }

    fn synced_at(&self) -> Option<EpochMillis>;

    fn set_synced_at(&mut self, at: EpochMillis);

    /// Key under which records from different devices describe the same
    /// real-world event. Used for duplicate detection only.
    fn duplicate_key(&self) -> String;

    fn validate(&self) -> Result<(), ValidationError>;
}

// =============================================================================
// Entry
// =============================================================================

/// Timing point of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimingPoint {
    #[serde(rename = "S")]
    Start,
    #[serde(rename = "F")]
    Finish,
}

impl fmt::Display for TimingPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimingPoint::Start => write!(f, "S"),
            TimingPoint::Finish => write!(f, "F"),
        }
    }
}

/// Result status attached to an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    #[default]
    Ok,
    /// Did not start.
    Dns,
    /// Did not finish.
    Dnf,
    /// Disqualified.
    Dsq,
}

fn default_run() -> u8 {
    1
}

/// A timing record captured at a start or finish point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    pub id: String,
    pub bib: String,
    pub point: TimingPoint,
    #[serde(default = "default_run")]
    pub run: u8,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub status: EntryStatus,
    pub device_id: String,
    #[serde(default)]
    pub device_name: String,
    /// Reference to a captured photo, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo: Option<String>,
    /// Set once the cloud acknowledged this entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced_at: Option<EpochMillis>,
}

impl SyncRecord for Entry {
    const KIND: RecordKind = RecordKind::Entry;

    fn id(&self) -> &str {
        &self.id
    }

    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn synced_at(&self) -> Option<EpochMillis> {
        self.synced_at
    }

    fn set_synced_at(&mut self, at: EpochMillis) {
        self.synced_at = Some(at);
    }

    fn duplicate_key(&self) -> String {
        format!("{}|{}|{}", self.bib.trim(), self.point, self.run)
    }

    fn validate(&self) -> Result<(), ValidationError> {
        validation::validate_entry(self)
    }
}

// =============================================================================
// Fault
// =============================================================================

/// Kind of gate fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaultType {
    /// Missed gate.
    #[serde(rename = "MG")]
    MissedGate,
    /// Straddling.
    #[serde(rename = "STR")]
    Straddling,
    /// Binding released.
    #[serde(rename = "BR")]
    BindingRelease,
}

/// Inclusive range of gates a judge is responsible for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateRange {
    pub start: u32,
    pub end: u32,
}

impl GateRange {
    pub fn contains(&self, gate: u32) -> bool {
        (self.start..=self.end).contains(&gate)
    }
}

/// A fault recorded by a gate judge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaultEntry {
    pub id: String,
    pub bib: String,
    #[serde(default = "default_run")]
    pub run: u8,
    pub gate_number: u32,
    pub fault_type: FaultType,
    pub timestamp: DateTime<Utc>,
    pub device_id: String,
    #[serde(default)]
    pub device_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate_range: Option<GateRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced_at: Option<EpochMillis>,
}

impl SyncRecord for FaultEntry {
    const KIND: RecordKind = RecordKind::Fault;

    fn id(&self) -> &str {
        &self.id
    }

    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn synced_at(&self) -> Option<EpochMillis> {
        self.synced_at
    }

    fn set_synced_at(&mut self, at: EpochMillis) {
        self.synced_at = Some(at);
    }

    fn duplicate_key(&self) -> String {
        format!("{}|{}|{}", self.bib.trim(), self.run, self.gate_number)
    }

    fn validate(&self) -> Result<(), ValidationError> {
        validation::validate_fault(self)
    }
}

// =============================================================================
// Sync Queue Item
// =============================================================================

/// A record that has not been acknowledged by the cloud yet.
///
/// Persisted as `{entry, retryCount, lastAttempt, error?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncQueueItem<T> {
    pub entry: T,
    #[serde(default)]
    pub retry_count: u32,
    pub last_attempt: EpochMillis,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: SyncRecord> SyncQueueItem<T> {
    /// Creates a fresh queue item; `now` counts as the first attempt time.
    pub fn new(entry: T, now: EpochMillis) -> Self {
        SyncQueueItem {
            entry,
            retry_count: 0,
            last_attempt: now,
            error: None,
        }
    }

    pub fn key(&self) -> RecordKey {
        self.entry.key()
    }

    /// Records a failed send attempt.
    pub fn record_failure(&mut self, now: EpochMillis, error: impl Into<String>) {
        self.retry_count = self.retry_count.saturating_add(1);
        self.last_attempt = now;
        self.error = Some(error.into());
    }
}

// =============================================================================
// Environment Signals
// =============================================================================

/// Connection quality as reported by the network collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    #[default]
    Good,
    Slow,
    Offline,
}

impl fmt::Display for ConnectionQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionQuality::Good => write!(f, "good"),
            ConnectionQuality::Slow => write!(f, "slow"),
            ConnectionQuality::Offline => write!(f, "offline"),
        }
    }
}

/// Battery level category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatteryLevel {
    #[default]
    Normal,
    Medium,
    Low,
    Critical,
}

/// Raw battery reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatteryStatus {
    /// Charge as a fraction in `0.0..=1.0`.
    pub level: f64,
    pub charging: bool,
}

impl Default for BatteryStatus {
    fn default() -> Self {
        BatteryStatus {
            level: 1.0,
            charging: true,
        }
    }
}

impl BatteryStatus {
    pub fn new(level: f64, charging: bool) -> Self {
        BatteryStatus {
            level: level.clamp(0.0, 1.0),
            charging,
        }
    }

    /// Maps the raw reading onto a category. A charging device is always
    /// `Normal`.
    pub fn category(&self) -> BatteryLevel {
        if self.charging {
            return BatteryLevel::Normal;
        }
        match self.level {
            l if l >= 0.50 => BatteryLevel::Normal,
            l if l >= 0.20 => BatteryLevel::Medium,
            l if l >= 0.10 => BatteryLevel::Low,
            _ => BatteryLevel::Critical,
        }
    }
}

// =============================================================================
// Connection Status
// =============================================================================

/// Connectivity status of the sync coordinator as shown to the user.
///
/// ```text
/// disconnected ──► connecting ──► connected ⇄ syncing
///                                   │   ▲
///                                   ▼   │
///                              error / offline
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Transient sub-state of `Connected` while a fetch is in flight.
    Syncing,
    Error,
    Offline,
}

impl ConnectionStatus {
    /// Returns true if the state machine allows moving to `next`.
    pub fn can_transition_to(&self, next: ConnectionStatus) -> bool {
        use ConnectionStatus::*;

        if next == Disconnected {
            return true;
        }
        match self {
            Disconnected => next == Connecting,
            Connecting => matches!(next, Connected | Syncing | Error | Offline),
            Connected => matches!(next, Syncing | Error | Offline),
            Syncing => matches!(next, Connected | Error | Offline),
            Error => matches!(next, Connecting | Connected | Syncing | Offline),
            Offline => matches!(next, Connecting | Connected | Syncing | Error),
        }
    }

    /// Returns true when the coordinator has a live session with the cloud.
    pub fn is_online(&self) -> bool {
        matches!(self, ConnectionStatus::Connected | ConnectionStatus::Syncing)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Syncing => "syncing",
            ConnectionStatus::Error => "error",
            ConnectionStatus::Offline => "offline",
        };
        f.write_str(s)
    }
}
