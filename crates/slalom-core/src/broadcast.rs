//! # Cross-Tab Broadcast Envelope
//!
//! Messages exchanged between sibling tabs of the same device on a
//! race-scoped channel.
//!
//! Wire shape:
//! ```text
//! { "type": "entry" | "presence" | "fault" | "fault-deleted",
//!   "data": { ... },
//!   "deviceId": "dev-..." }            // optional
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;
use crate::types::{Entry, FaultEntry};

/// Prefix of every race channel name.
pub const CHANNEL_PREFIX: &str = "slalom-race-";

/// Deterministic channel name for a race.
pub fn channel_name(race_id: &str) -> String {
    format!("{}{}", CHANNEL_PREFIX, race_id.trim().to_lowercase())
}

/// Presence beacon of a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceInfo {
    pub device_name: String,
    pub last_seen: DateTime<Utc>,
}

/// Payload of a broadcast message.
#[derive(Debug, Clone, PartialEq)]
pub enum BroadcastPayload {
    Entry(Entry),
    Presence(PresenceInfo),
    Fault(FaultEntry),
    FaultDeleted { fault_id: String },
}

impl BroadcastPayload {
    /// Value of the envelope's `type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            BroadcastPayload::Entry(_) => "entry",
            BroadcastPayload::Presence(_) => "presence",
            BroadcastPayload::Fault(_) => "fault",
            BroadcastPayload::FaultDeleted { .. } => "fault-deleted",
        }
    }
}

/// A typed message on a race channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Envelope", into = "Envelope")]
pub struct BroadcastMessage {
    pub payload: BroadcastPayload,
    /// Sender device, used for self-echo filtering.
    pub device_id: Option<String>,
}

impl BroadcastMessage {
    pub fn new(payload: BroadcastPayload, device_id: impl Into<String>) -> Self {
        BroadcastMessage {
            payload,
            device_id: Some(device_id.into()),
        }
    }

    /// Returns true if this message was sent by `local_device_id`.
    pub fn is_from(&self, local_device_id: &str) -> bool {
        self.device_id.as_deref() == Some(local_device_id)
    }

    pub fn to_json(&self) -> Result<String, CoreError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self, CoreError> {
        Ok(serde_json::from_str(raw)?)
    }
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
    #[serde(rename = "deviceId", default, skip_serializing_if = "Option::is_none")]
    device_id: Option<String>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FaultDeletedData {
    fault_id: String,
}

impl TryFrom<Envelope> for BroadcastMessage {
    type Error = String;

    fn try_from(envelope: Envelope) -> Result<Self, Self::Error> {
        let data = envelope.data;
        let payload = match envelope.kind.as_str() {
            "entry" => {
                BroadcastPayload::Entry(serde_json::from_value(data).map_err(|e| e.to_string())?)
            }
            "presence" => {
                BroadcastPayload::Presence(serde_json::from_value(data).map_err(|e| e.to_string())?)
            }
            "fault" => {
                BroadcastPayload::Fault(serde_json::from_value(data).map_err(|e| e.to_string())?)
            }
            "fault-deleted" => {
                let d: FaultDeletedData = serde_json::from_value(data).map_err(|e| e.to_string())?;
                BroadcastPayload::FaultDeleted { fault_id: d.fault_id }
            }
            other => return Err(format!("unknown broadcast type: {other}")),
        };
        Ok(BroadcastMessage {
            payload,
            device_id: envelope.device_id,
        })
    }
}

impl From<BroadcastMessage> for Envelope {
    fn from(message: BroadcastMessage) -> Self {
        let kind = message.payload.kind().to_string();
        let data = match message.payload {
            BroadcastPayload::Entry(entry) => serde_json::to_value(entry),
            BroadcastPayload::Presence(presence) => serde_json::to_value(presence),
            BroadcastPayload::Fault(fault) => serde_json::to_value(fault),
            BroadcastPayload::FaultDeleted { fault_id } => {
                serde_json::to_value(FaultDeletedData { fault_id })
            }
        }
        .unwrap_or(Value::Null);
        Envelope {
            kind,
            data,
            device_id: message.device_id,
        }
    }
}
