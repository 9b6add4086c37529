//! Shape checks for records received from the cloud or sibling tabs.

use crate::error::ValidationError;
use crate::types::{Entry, FaultEntry, GateRange};

/// Maximum characters in a bib.
pub const MAX_BIB_LEN: usize = 10;

/// Maximum characters in a record or device id.
pub const MAX_ID_LEN: usize = 128;

/// Maximum characters in a device name.
pub const MAX_DEVICE_NAME_LEN: usize = 100;

fn required(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::Required { field });
    }
    Ok(())
}

fn max_len(field: &'static str, value: &str, max: usize) -> Result<(), ValidationError> {
    if value.chars().count() > max {
        return Err(ValidationError::TooLong { field, max });
    }
    Ok(())
}

fn validate_identity(id: &str, device_id: &str, device_name: &str) -> Result<(), ValidationError> {
    required("id", id)?;
    max_len("id", id, MAX_ID_LEN)?;
    required("deviceId", device_id)?;
    max_len("deviceId", device_id, MAX_ID_LEN)?;
    max_len("deviceName", device_name, MAX_DEVICE_NAME_LEN)
}

fn validate_bib(bib: &str) -> Result<(), ValidationError> {
    required("bib", bib)?;
    max_len("bib", bib, MAX_BIB_LEN)
}

fn validate_run(run: u8) -> Result<(), ValidationError> {
    if !(1..=2).contains(&run) {
        return Err(ValidationError::InvalidRun(run));
    }
    Ok(())
}

pub fn validate_gate_range(range: &GateRange) -> Result<(), ValidationError> {
    if range.start > range.end {
        return Err(ValidationError::InvalidGateRange {
            start: range.start,
            end: range.end,
        });
    }
    Ok(())
}

pub fn validate_entry(entry: &Entry) -> Result<(), ValidationError> {
    validate_identity(&entry.id, &entry.device_id, &entry.device_name)?;
    validate_bib(&entry.bib)?;
    validate_run(entry.run)
}

pub fn validate_fault(fault: &FaultEntry) -> Result<(), ValidationError> {
    validate_identity(&fault.id, &fault.device_id, &fault.device_name)?;
    validate_bib(&fault.bib)?;
    validate_run(fault.run)?;
    if fault.gate_number == 0 {
        return Err(ValidationError::InvalidValue {
            field: "gateNumber",
            value: "0".into(),
        });
    }
    if let Some(range) = &fault.gate_range {
        validate_gate_range(range)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EntryStatus, FaultType, TimingPoint};
    use chrono::Utc;

    fn entry() -> Entry {
        Entry {
            id: "e1".into(),
            bib: "12".into(),
            point: TimingPoint::Start,
            run: 1,
            timestamp: Utc::now(),
            status: EntryStatus::Ok,
            device_id: "dev-a".into(),
            device_name: "Start".into(),
            photo: None,
            synced_at: None,
        }
    }

    #[test]
    fn test_valid_entry() {
        assert!(validate_entry(&entry()).is_ok());
    }

    #[test]
    fn test_invalid_entries() {
        let mut e = entry();
        e.bib = "  ".into();
        assert_eq!(validate_entry(&e), Err(ValidationError::Required { field: "bib" }));

        let mut e = entry();
        e.run = 3;
        assert_eq!(validate_entry(&e), Err(ValidationError::InvalidRun(3)));

        let mut e = entry();
        e.device_id.clear();
        assert!(validate_entry(&e).is_err());

        let mut e = entry();
        e.bib = "12345678901".into();
        assert!(matches!(validate_entry(&e), Err(ValidationError::TooLong { .. })));
    }

    #[test]
    fn test_fault_gate_range() {
        let fault = FaultEntry {
            id: "f1".into(),
            bib: "12".into(),
            run: 2,
            gate_number: 4,
            fault_type: FaultType::MissedGate,
            timestamp: Utc::now(),
            device_id: "judge-1".into(),
            device_name: "Gate 1-10".into(),
            gate_range: Some(GateRange { start: 10, end: 1 }),
            synced_at: None,
        };
        assert_eq!(
            validate_fault(&fault),
            Err(ValidationError::InvalidGateRange { start: 10, end: 1 })
        );
    }
}
