//! Data Models for the Scan Station
//!
//! Scans, buffered writes, and the outcomes reported back to the
//! presentation layer.

use crate::error::{RemoteError, StationError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Length of a valid EPC code
pub const EPC_LENGTH: usize = 24;

/// Origin address recorded for scans captured without network
pub const OFFLINE_ORIGIN: &str = "offline";

/// A validated EPC tag identifier.
///
/// Scanner input is trimmed and upper-cased before validation, so `e2...`
/// and `E2...` name the same tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EpcCode(String);

impl EpcCode {
    pub fn parse(raw: &str) -> Result<Self, StationError> {
        let code = raw.trim().to_ascii_uppercase();

        let reason = if code.len() != EPC_LENGTH {
            Some("must be 24 characters long")
        } else if !code.starts_with('E') {
            Some("must start with 'E'")
        } else if !code.chars().all(|c| c.is_ascii_alphanumeric()) {
            Some("must be alphanumeric")
        } else {
            None
        };

        match reason {
            Some(reason) => Err(StationError::InvalidTag { code, reason }),
            None => Ok(Self(code)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EpcCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for EpcCode {
    type Err = StationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for EpcCode {
    type Error = StationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<EpcCode> for String {
    fn from(code: EpcCode) -> Self {
        code.0
    }
}

/// Delivery state of a buffered write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncState {
    Pending,
    Synced,
}

impl SyncState {
    pub fn as_i64(self) -> i64 {
        match self {
            SyncState::Pending => 0,
            SyncState::Synced => 1,
        }
    }

    pub fn from_i64(value: i64) -> Self {
        if value == 0 {
            SyncState::Pending
        } else {
            SyncState::Synced
        }
    }
}

/// A scan buffered in the local queue, waiting for delivery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingWrite {
    /// Queue-assigned ULID
    pub id: String,

    /// Scanned tag
    pub tag_id: EpcCode,

    /// Station that captured the scan
    pub station_id: String,

    /// Network identity of the station at capture time
    pub origin_address: String,

    /// Delivery state
    pub sync_state: SyncState,

    /// Capture time, forwarded to the record store as the event time
    pub created_at: DateTime<Utc>,
}

/// One upsert call against the record store
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertRequest {
    pub tag_id: EpcCode,
    pub station_id: String,
    pub source_address: String,
    pub event_time: DateTime<Utc>,
}

impl From<&PendingWrite> for UpsertRequest {
    fn from(write: &PendingWrite) -> Self {
        Self {
            tag_id: write.tag_id.clone(),
            station_id: write.station_id.clone(),
            source_address: write.origin_address.clone(),
            event_time: write.created_at,
        }
    }
}

/// Return code conventions of the upsert procedure
pub mod return_codes {
    pub const APPLIED: i32 = 1;
    pub const DUPLICATE_FOR_DAY: i32 = -1;
    pub const VALIDATION_FAILED: i32 = 0;
}

/// Result of a single upsert against the record store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// The record is now durable remotely
    Applied,
    /// The record store already holds this tag for the current day
    DuplicateRejected,
    /// The record store refused the data (tag not yet matched)
    ValidationFailed,
    /// The call failed; the caller decides whether to retry
    Error(RemoteError),
}

impl UpsertOutcome {
    pub fn from_return_code(code: i32) -> Self {
        match code {
            return_codes::APPLIED => UpsertOutcome::Applied,
            return_codes::DUPLICATE_FOR_DAY => UpsertOutcome::DuplicateRejected,
            return_codes::VALIDATION_FAILED => UpsertOutcome::ValidationFailed,
            other => UpsertOutcome::Error(RemoteError::Protocol(format!(
                "unknown return code {}",
                other
            ))),
        }
    }
}

/// What happened to a submitted scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubmitOutcome {
    /// Recorded remotely
    Applied,
    /// Already recorded remotely today
    DuplicateRejected,
    /// Remote refused the tag (not yet matched)
    ValidationFailed,
    /// Saved locally, will be synced later
    Buffered,
    /// An unsynced scan of this tag is already buffered
    DuplicatePending,
}

impl SubmitOutcome {
    /// Short operator-facing description
    pub fn message(&self) -> &'static str {
        match self {
            SubmitOutcome::Applied => "recorded",
            SubmitOutcome::DuplicateRejected => "already recorded today",
            SubmitOutcome::ValidationFailed => "not yet matched",
            SubmitOutcome::Buffered => "offline: saved locally",
            SubmitOutcome::DuplicatePending => "offline: already saved locally",
        }
    }
}

impl fmt::Display for SubmitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// Result of one sync pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSummary {
    /// Remote upsert calls made
    pub attempted: usize,
    /// Records applied and removed
    pub applied: usize,
    /// Records the remote already had, removed
    pub duplicate: usize,
    /// Records the remote refused, removed
    pub rejected: usize,
    /// Records that errored and stay queued
    pub failed: usize,
    /// Records left in the queue after the pass
    pub still_pending: usize,
    /// Whether the pass stopped early (offline or connectivity lost)
    pub aborted: bool,
}

impl fmt::Display for SyncSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "attempted {}, applied {}, duplicate {}, rejected {}, failed {}, still pending {}",
            self.attempted, self.applied, self.duplicate, self.rejected, self.failed, self.still_pending
        )?;
        if self.aborted {
            write!(f, " (aborted)")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epc_normalized() {
        let code = EpcCode::parse("  e2801160600002054b6c1a3f ").unwrap();
        assert_eq!(code.as_str(), "E2801160600002054B6C1A3F");
    }

    #[test]
    fn test_epc_rejects_bad_input() {
        assert!(EpcCode::parse("E2801160").is_err());
        assert!(EpcCode::parse("A2801160600002054B6C1A3F").is_err());
        assert!(EpcCode::parse("E2801160600002054B6C1A3-").is_err());
        assert!(EpcCode::parse("").is_err());
    }

    #[test]
    fn test_return_codes() {
        assert_eq!(UpsertOutcome::from_return_code(1), UpsertOutcome::Applied);
        assert_eq!(UpsertOutcome::from_return_code(-1), UpsertOutcome::DuplicateRejected);
        assert_eq!(UpsertOutcome::from_return_code(0), UpsertOutcome::ValidationFailed);
        assert!(matches!(
            UpsertOutcome::from_return_code(7),
            UpsertOutcome::Error(RemoteError::Protocol(_))
        ));
    }

    #[test]
    fn test_sync_state_roundtrip() {
        assert_eq!(SyncState::from_i64(SyncState::Pending.as_i64()), SyncState::Pending);
        assert_eq!(SyncState::from_i64(SyncState::Synced.as_i64()), SyncState::Synced);
    }

    #[test]
    fn test_upsert_request_uses_capture_fields() {
        let created_at = DateTime::from_timestamp_micros(1_700_000_000_000_000).unwrap();
        let write = PendingWrite {
            id: "01HZ".into(),
            tag_id: EpcCode::parse("E00000000000000000000001").unwrap(),
            station_id: "ST-01".into(),
            origin_address: OFFLINE_ORIGIN.into(),
            sync_state: SyncState::Pending,
            created_at,
        };
        let request = UpsertRequest::from(&write);
        assert_eq!(request.event_time, created_at);
        assert_eq!(request.source_address, "offline");

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["tagId"], "E00000000000000000000001");
        assert_eq!(json["stationId"], "ST-01");
    }
}
