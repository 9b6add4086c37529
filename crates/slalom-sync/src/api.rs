//! # Sync API Wire Types
//!
//! JSON contract of the cloud sync endpoints.
//!
//! ```text
//! GET    /sync?raceId&deviceId&deviceName[&since]
//!        → {entries[], deletedIds[], lastUpdated, deviceCount?, highestBib?, deleted?}
//! POST   /sync?raceId   {entry | entries[], deviceId, deviceName}
//!        → {success | results[], crossDeviceDuplicate?, photoSkipped?, deleted?}
//! DELETE /sync?raceId   {entryId, deviceId, deviceName}
//!
//! /faults mirrors /sync with faults[], gateStart/gateEnd, gateRange, isReady.
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use slalom_core::{EpochMillis, GateRange, RecordKind, SyncRecord};
use tracing::debug;

use crate::error::SyncResult;

/// Endpoint path of a record family, relative to the API base URL.
pub fn endpoint(kind: RecordKind) -> &'static str {
    match kind {
        RecordKind::Entry => "sync",
        RecordKind::Fault => "faults",
    }
}

// =============================================================================
// Fetch
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchQuery {
    pub race_id: String,
    pub device_id: String,
    pub device_name: String,
    /// Omitted on the first sync so the server returns everything.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<EpochMillis>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gate_start: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gate_end: Option<u32>,
}

impl FetchQuery {
    /// Query pairs in wire order.
    pub fn pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("raceId", self.race_id.clone()),
            ("deviceId", self.device_id.clone()),
            ("deviceName", self.device_name.clone()),
        ];
        if let Some(since) = self.since {
            pairs.push(("since", since.to_string()));
        }
        if let Some(start) = self.gate_start {
            pairs.push(("gateStart", start.to_string()));
        }
        if let Some(end) = self.gate_end {
            pairs.push(("gateEnd", end.to_string()));
        }
        pairs
    }
}

/// Fetch response. Records stay raw until [`decode_records`] so one bad
/// record does not reject the whole response.
///
/// The records array is required unless the server reports the race as
/// deleted, which it does with a bare `{"deleted": true, "message": ..}`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(try_from = "RawFetchResponse")]
pub struct FetchResponse {
    pub entries: Vec<Value>,
    pub deleted_ids: Vec<String>,
    pub last_updated: Option<EpochMillis>,
    pub device_count: Option<u32>,
    pub highest_bib: Option<u32>,
    pub deleted: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFetchResponse {
    #[serde(default, alias = "faults")]
    entries: Option<Vec<Value>>,
    #[serde(default)]
    deleted_ids: Vec<String>,
    #[serde(default)]
    last_updated: Option<EpochMillis>,
    #[serde(default)]
    device_count: Option<u32>,
    #[serde(default)]
    highest_bib: Option<u32>,
    #[serde(default)]
    deleted: bool,
}

impl TryFrom<RawFetchResponse> for FetchResponse {
    type Error = String;

    fn try_from(raw: RawFetchResponse) -> Result<Self, Self::Error> {
        let entries = match (raw.entries, raw.deleted) {
            (Some(entries), _) => entries,
            (None, true) => Vec::new(),
            (None, false) => {
                return Err("missing records array (`entries` or `faults`)".to_string());
            }
        };
        Ok(FetchResponse {
            entries,
            deleted_ids: raw.deleted_ids,
            last_updated: raw.last_updated,
            device_count: raw.device_count,
            highest_bib: raw.highest_bib,
            deleted: raw.deleted,
        })
    }
}

/// Decodes and validates fetched records. Returns the good records and the
/// number discarded.
pub fn decode_records<T: SyncRecord>(values: Vec<Value>) -> (Vec<T>, usize) {
    let total = values.len();
    let records: Vec<T> = values
        .into_iter()
        .filter_map(|value| match serde_json::from_value::<T>(value) {
            Ok(record) => match record.validate() {
                Ok(()) => Some(record),
                Err(e) => {
                    debug!(
                        kind = %T::KIND,
                        id = %record.id(),
                        error = %e,
                        "Discarding invalid record"
                    );
                    None
                }
            },
            Err(e) => {
                debug!(kind = %T::KIND, error = %e, "Discarding ill-formed record");
                None
            }
        })
        .collect();
    let discarded = total - records.len();
    (records, discarded)
}

// =============================================================================
// Post
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PostBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entries: Option<Vec<Value>>,
    pub device_id: String,
    pub device_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gate_range: Option<GateRange>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_ready: Option<bool>,
}

impl PostBody {
    pub fn single<T: SyncRecord>(
        record: &T,
        device_id: &str,
        device_name: &str,
    ) -> SyncResult<Self> {
        Ok(PostBody {
            entry: Some(serde_json::to_value(record)?),
            entries: None,
            device_id: device_id.to_string(),
            device_name: device_name.to_string(),
            gate_range: None,
            is_ready: None,
        })
    }

    pub fn batch<T: SyncRecord>(
        records: &[T],
        device_id: &str,
        device_name: &str,
    ) -> SyncResult<Self> {
        let entries = records
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(PostBody {
            entry: None,
            entries: Some(entries),
            device_id: device_id.to_string(),
            device_name: device_name.to_string(),
            gate_range: None,
            is_ready: None,
        })
    }

    /// Adds the judge's gate assignment to a fault post.
    pub fn with_gate_state(mut self, gate_range: Option<GateRange>, is_ready: bool) -> Self {
        self.gate_range = gate_range;
        self.is_ready = Some(is_ready);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostResult {
    pub id: String,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub results: Option<Vec<PostResult>>,
    /// The server saw the same event from another device. Either a flag or
    /// a description of the other entry.
    #[serde(default)]
    pub cross_device_duplicate: Option<Value>,
    #[serde(default)]
    pub photo_skipped: bool,
    #[serde(default)]
    pub deleted: bool,
}

impl PostResponse {
    pub fn has_cross_device_duplicate(&self) -> bool {
        match &self.cross_device_duplicate {
            None | Some(Value::Null) | Some(Value::Bool(false)) => false,
            Some(_) => true,
        }
    }
}

// =============================================================================
// Delete
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fault_id: Option<String>,
    pub device_id: String,
    pub device_name: String,
}

impl DeleteBody {
    pub fn new(kind: RecordKind, id: &str, device_id: &str, device_name: &str) -> Self {
        let (entry_id, fault_id) = match kind {
            RecordKind::Entry => (Some(id.to_string()), None),
            RecordKind::Fault => (None, Some(id.to_string())),
        };
        DeleteBody {
            entry_id,
            fault_id,
            device_id: device_id.to_string(),
            device_name: device_name.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub deleted: bool,
}

// =============================================================================
// Transport
// =============================================================================

/// Cloud transport. Implemented over HTTP by
/// [`HttpSyncApi`](crate::http::HttpSyncApi).
#[async_trait]
pub trait SyncApi: Send + Sync {
    async fn fetch(&self, kind: RecordKind, query: &FetchQuery) -> SyncResult<FetchResponse>;

    async fn post(
        &self,
        kind: RecordKind,
        race_id: &str,
        body: &PostBody,
    ) -> SyncResult<PostResponse>;

    async fn delete(
        &self,
        kind: RecordKind,
        race_id: &str,
        body: &DeleteBody,
    ) -> SyncResult<DeleteResponse>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::entry;
    use serde_json::json;
    use slalom_core::Entry;

    #[test]
    fn test_first_sync_omits_since() {
        let query = FetchQuery {
            race_id: "r1".into(),
            device_id: "dev-a".into(),
            device_name: "Start".into(),
            since: None,
            gate_start: None,
            gate_end: None,
        };
        let keys: Vec<&str> = query.pairs().iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec!["raceId", "deviceId", "deviceName"]);

        let delta = FetchQuery { since: Some(42), ..query };
        assert!(delta.pairs().contains(&("since", "42".to_string())));
    }

    #[test]
    fn test_fetch_response_requires_records_array() {
        assert!(serde_json::from_value::<FetchResponse>(json!({"deletedIds": []})).is_err());

        let body = json!({"faults": [], "lastUpdated": 10, "deleted": true});
        let faults: FetchResponse = serde_json::from_value(body).unwrap();
        assert!(faults.deleted);
        assert_eq!(faults.last_updated, Some(10));
    }

    #[test]
    fn test_deleted_race_body_without_records() {
        let body = r#"{"deleted":true,"message":"Race has been deleted"}"#;
        let response: FetchResponse = serde_json::from_str(body).unwrap();
        assert!(response.deleted);
        assert!(response.entries.is_empty());
        assert!(response.deleted_ids.is_empty());

        let missing = serde_json::from_str::<FetchResponse>(r#"{"deleted":false}"#);
        assert!(missing.is_err());
    }

    #[test]
    fn test_decode_discards_bad_records() {
        let good = serde_json::to_value(entry("e1", "dev-a")).unwrap();
        let mut invalid = serde_json::to_value(entry("e2", "dev-a")).unwrap();
        invalid["bib"] = json!("");

        let (records, discarded) = decode_records::<Entry>(vec![good, json!({"id": 3}), invalid]);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "e1");
        assert_eq!(discarded, 2);
    }

    #[test]
    fn test_post_body_shapes() {
        let single = PostBody::single(&entry("e1", "dev-a"), "dev-a", "Start").unwrap();
        let wire = serde_json::to_value(&single).unwrap();
        assert!(wire.get("entry").is_some());
        assert!(wire.get("entries").is_none());
        assert_eq!(wire["deviceName"], "Start");

        let entries = [entry("e1", "dev-a"), entry("e2", "dev-a")];
        let batch = PostBody::batch(&entries, "dev-a", "Start").unwrap();
        let wire = serde_json::to_value(&batch).unwrap();
        assert_eq!(wire["entries"].as_array().map(|a| a.len()), Some(2));
    }

    #[test]
    fn test_cross_device_duplicate_flag() {
        let flagged: PostResponse = serde_json::from_value(json!({
            "success": true,
            "crossDeviceDuplicate": {"deviceName": "Finish"}
        }))
        .unwrap();
        assert!(flagged.has_cross_device_duplicate());

        let body = json!({"success": true, "crossDeviceDuplicate": false});
        let plain: PostResponse = serde_json::from_value(body).unwrap();
        assert!(!plain.has_cross_device_duplicate());
    }

    #[test]
    fn test_delete_body_key_per_kind() {
        let body = DeleteBody::new(RecordKind::Fault, "f1", "dev-a", "Gate 4");
        let wire = serde_json::to_value(body).unwrap();
        assert_eq!(wire["faultId"], "f1");
        assert!(wire.get("entryId").is_none());
    }
}
