//! Segment records and the value objects that flow between the capture
//! controller and the retention engine.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Direction of a captured phone call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallDirection {
    Incoming,
    Outgoing,
}

impl CallDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Incoming => "INCOMING",
            Self::Outgoing => "OUTGOING",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "INCOMING" => Some(Self::Incoming),
            "OUTGOING" => Some(Self::Outgoing),
            _ => None,
        }
    }
}

impl fmt::Display for CallDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata attached to a segment captured during a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallInfo {
    pub direction: CallDirection,
    /// Caller ID (incoming) or dialed number (outgoing) when known.
    pub number: Option<String>,
}

/// A closed recording span as reported by the capture controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedSegment {
    pub path: PathBuf,
    /// Wall-clock start, epoch milliseconds.
    pub start_time: i64,
    pub duration: i64,
    pub call: Option<CallInfo>,
}

impl CompletedSegment {
    pub fn end_time(&self) -> i64 {
        self.start_time + self.duration
    }

    pub fn is_call(&self) -> bool {
        self.call.is_some()
    }
}

/// A registered segment, as stored in the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub id: i64,
    pub file_path: PathBuf,
    pub start_time: i64,
    pub end_time: i64,
    pub duration: i64,
    pub file_size: u64,
    pub is_call: bool,
    pub call_direction: Option<CallDirection>,
    pub call_number: Option<String>,
    /// A copy has been exported to the saved directory.
    pub is_saved: bool,
    pub created_at: i64,
}

/// A segment about to be inserted; the store assigns the id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSegment {
    pub file_path: PathBuf,
    pub start_time: i64,
    pub end_time: i64,
    pub duration: i64,
    pub file_size: u64,
    pub call: Option<CallInfo>,
    pub created_at: i64,
}

impl NewSegment {
    pub fn from_completed(done: &CompletedSegment, file_size: u64, created_at: i64) -> Self {
        Self {
            file_path: done.path.clone(),
            start_time: done.start_time,
            end_time: done.end_time(),
            duration: done.duration,
            file_size,
            call: done.call.clone(),
            created_at,
        }
    }

    /// Check the record invariants, returning every violation found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.start_time <= 0 {
            errors.push("start time must be positive".to_string());
        }
        if self.duration <= 0 {
            errors.push("duration must be positive".to_string());
        }
        if self.end_time != self.start_time + self.duration {
            errors.push("end time must equal start time plus duration".to_string());
        }
        if self.file_path.as_os_str().is_empty() {
            errors.push("file path cannot be empty".to_string());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Aggregate storage figures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageStats {
    pub total_bytes: u64,
    pub segment_count: u64,
    pub available_bytes: u64,
    /// What the current settings are expected to occupy, with margin.
    pub expected_bytes: u64,
}

/// Human-readable byte count (`1.5 MB`).
pub fn format_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    let b = bytes as f64;
    if b >= KB * KB * KB {
        format!("{:.1} GB", b / (KB * KB * KB))
    } else if b >= KB * KB {
        format!("{:.1} MB", b / (KB * KB))
    } else if b >= KB {
        format!("{:.1} KB", b / KB)
    } else {
        format!("{bytes} B")
    }
}
