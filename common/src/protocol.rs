//! HTTP protocol types for the capture server's status surface.

use serde::{Deserialize, Serialize};

use crate::segment::{format_bytes, StorageStats};

/// Periodic liveness audit of capture, storage and device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Epoch milliseconds when the report was assembled.
    pub timestamp: i64,
    pub is_recording: bool,
    pub recording_duration_ms: i64,
    pub recording_healthy: bool,
    pub storage_healthy: bool,
    pub device_healthy: bool,
    pub uptime_ms: i64,
    pub has_recent_activity: bool,
    pub consecutive_failures: u32,
    pub is_healthy: bool,
}

/// Storage figures plus human-readable renderings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageResponse {
    #[serde(flatten)]
    pub stats: StorageStats,
    pub formatted_used: String,
    pub formatted_available: String,
    pub formatted_expected: String,
}

impl From<StorageStats> for StorageResponse {
    fn from(stats: StorageStats) -> Self {
        Self {
            formatted_used: format_bytes(stats.total_bytes),
            formatted_available: format_bytes(stats.available_bytes),
            formatted_expected: format_bytes(stats.expected_bytes),
            stats,
        }
    }
}

/// Telephony state pushed by an external bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallState {
    Ringing,
    OffHook,
    Idle,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallStateRequest {
    pub state: CallState,
    #[serde(default)]
    pub number: Option<String>,
}

/// Result of a manual rotation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotateResponse {
    pub rotated: bool,
    /// File name of the segment that was closed, if any.
    pub completed: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_state_wire_names() {
        let req: CallStateRequest =
            serde_json::from_str(r#"{"state":"OFF_HOOK","number":"555"}"#).unwrap();
        assert_eq!(req.state, CallState::OffHook);
        assert_eq!(req.number.as_deref(), Some("555"));

        let req: CallStateRequest = serde_json::from_str(r#"{"state":"IDLE"}"#).unwrap();
        assert_eq!(req.state, CallState::Idle);
        assert!(req.number.is_none());
    }

    #[test]
    fn test_storage_response_is_flat() {
        let resp = StorageResponse::from(StorageStats {
            total_bytes: 2048,
            segment_count: 2,
            available_bytes: 10,
            expected_bytes: 3 * 1024 * 1024,
        });
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["segment_count"], 2);
        assert_eq!(json["formatted_used"], "2.0 KB");
        assert_eq!(json["expected_bytes"], 3 * 1024 * 1024);
        assert_eq!(json["formatted_expected"], "3.0 MB");
    }
}
