use chrono::{DateTime, Local};
use serde::{Serialize, Serializer};

use crate::protocol::{TelemetryRecord, TelesignalizationRecord};

/// Timestamp layout of `last_update`, local time.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

fn serialize_timestamp<S: Serializer>(
    value: &DateTime<Local>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_str(&value.format(TIMESTAMP_FORMAT))
}

/// One published message: both readings of a pack taken in the same cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PackRecord {
    #[serde(skip)]
    pub address: u8,
    #[serde(serialize_with = "serialize_timestamp")]
    pub last_update: DateTime<Local>,
    pub telemetry: TelemetryRecord,
    pub telesignalization: TelesignalizationRecord,
}

impl PackRecord {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// What the bridge knows about a pack. Lives for the whole process.
#[derive(Debug, Clone, PartialEq)]
pub struct PackState {
    pub address: u8,
    pub last_record: Option<PackRecord>,
    pub consecutive_failures: u32,
    pub total_failures: u64,
}

impl PackState {
    pub fn new(address: u8) -> Self {
        Self {
            address,
            last_record: None,
            consecutive_failures: 0,
            total_failures: 0,
        }
    }

    pub fn last_update(&self) -> Option<DateTime<Local>> {
        self.last_record.as_ref().map(|record| record.last_update)
    }

    pub fn record_success(&mut self, record: PackRecord) {
        self.last_record = Some(record);
        self.consecutive_failures = 0;
    }

    /// The previous record is kept untouched.
    pub fn record_failure(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.total_failures = self.total_failures.saturating_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::telemetry::{fixture::TelemetryPayload, CellVoltageLimits};
    use crate::protocol::telesignalization::fixture::TelesignalizationPayload;
    use chrono::TimeZone;

    fn record(address: u8) -> PackRecord {
        PackRecord {
            address,
            last_update: Local.with_ymd_and_hms(2024, 5, 17, 8, 30, 5).unwrap(),
            telemetry: TelemetryRecord::decode(
                &TelemetryPayload::default().build(),
                &CellVoltageLimits::default(),
            )
            .unwrap(),
            telesignalization: TelesignalizationRecord::decode(
                &TelesignalizationPayload::default().build(),
            )
            .unwrap(),
        }
    }

    #[test]
    fn test_message_shape() {
        let json: serde_json::Value = serde_json::from_str(&record(1).to_json().unwrap()).unwrap();
        assert_eq!(json["last_update"], "2024-05-17 08:30:05");
        assert_eq!(json["telemetry"]["soc"], 90.0);
        assert_eq!(json["telesignalization"]["system_status"], "unknown");
        assert!(json.get("address").is_none());
    }

    #[test]
    fn test_failure_keeps_previous_record() {
        let mut state = PackState::new(1);
        state.record_success(record(1));
        state.record_failure();
        state.record_failure();
        assert_eq!(state.consecutive_failures, 2);
        assert_eq!(state.total_failures, 2);
        assert_eq!(state.last_record, Some(record(1)));

        state.record_success(record(1));
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.total_failures, 2);
    }
}
