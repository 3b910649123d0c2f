//! Configuration parsing – reads a KEY=VALUE file (`rewind.conf`).
//!
//! The loop-relevant subset is exposed as a [`Settings`] snapshot so the
//! scheduler and retention engine can pick up a reloaded file at their next
//! iteration boundary.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

pub const MIN_AUDIO_BITRATE: u32 = 16_000;
pub const MAX_AUDIO_BITRATE: u32 = 128_000;
pub const MIN_AUDIO_SAMPLE_RATE: u32 = 8_000;
pub const MAX_AUDIO_SAMPLE_RATE: u32 = 48_000;
pub const MAX_SEGMENT_SECONDS: u64 = 3_600;
pub const MIN_MAX_STORAGE_MB: u64 = 10;
pub const MAX_MAX_STORAGE_MB: u64 = 10_000;

const MB: u64 = 1024 * 1024;

/// Values the running loops re-read once per iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub segment_duration_seconds: u64,
    pub adaptive_mode_enabled: bool,
    pub target_seconds: u64,
    pub retention_period_ms: i64,
    pub max_storage_bytes: u64,
    pub bitrate_bps: u32,
    pub sample_rate_hz: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            segment_duration_seconds: 60,
            adaptive_mode_enabled: false,
            target_seconds: 300,
            retention_period_ms: 10 * 60 * 1000,
            max_storage_bytes: 100 * MB,
            bitrate_bps: 32_000,
            sample_rate_hz: 16_000,
        }
    }
}

impl Settings {
    /// Fixed-mode segment length, floored at one second.
    pub fn segment_duration(&self) -> Duration {
        Duration::from_secs(self.segment_duration_seconds.max(1))
    }

    /// Adaptive-mode target length, floored at one second.
    pub fn target(&self) -> Duration {
        Duration::from_secs(self.target_seconds.max(1))
    }

    /// Bytes the rotating window is expected to occupy at the configured
    /// bitrate: one segment's size times the number of segments retained.
    pub fn expected_storage_usage(&self) -> u64 {
        let segment_secs = self.segment_duration_seconds.max(1);
        let segment_bytes = self.bitrate_bps as u64 / 8 * segment_secs;
        let retention_secs = (self.retention_period_ms.max(0) / 1000) as u64;
        segment_bytes.saturating_mul(retention_secs / segment_secs)
    }

    /// [`expected_storage_usage`](Self::expected_storage_usage) plus a
    /// percentage margin.
    pub fn expected_storage_usage_with_margin(&self, margin_percent: f64) -> u64 {
        let base = self.expected_storage_usage() as f64;
        (base + base * margin_percent / 100.0) as u64
    }
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    // ── recording ────────────────────────────────────────────────────
    pub settings: Settings,
    pub rec_card: Option<String>,
    pub recs_dir: PathBuf,

    // ── storage ──────────────────────────────────────────────────────
    pub db_path: PathBuf,
    pub min_free_bytes: u64,
    pub cleanup_interval_secs: u64,

    // ── health ───────────────────────────────────────────────────────
    pub health_check_interval_secs: u64,
    pub recent_activity_secs: u64,

    // ── network ──────────────────────────────────────────────────────
    /// Address the status HTTP server listens on.
    pub listen_addr: String,
}

impl Config {
    /// Default config path.
    pub fn default_path() -> &'static str {
        "/etc/rewind/rewind.conf"
    }

    /// Directory the rotating segments are captured into.
    pub fn segments_dir(&self) -> PathBuf {
        self.recs_dir.join("segments")
    }

    /// Directory user-saved copies are exported to.
    pub fn saved_dir(&self) -> PathBuf {
        self.recs_dir.join("saved")
    }

    /// Check every value against its allowed range, reporting all problems
    /// at once.
    pub fn validate(&self) -> Result<()> {
        let s = &self.settings;
        let mut errors = Vec::new();

        if !(MIN_AUDIO_BITRATE..=MAX_AUDIO_BITRATE).contains(&s.bitrate_bps) {
            errors.push(format!(
                "AUDIO_BITRATE must be between {MIN_AUDIO_BITRATE} and {MAX_AUDIO_BITRATE} bps"
            ));
        }
        if !(MIN_AUDIO_SAMPLE_RATE..=MAX_AUDIO_SAMPLE_RATE).contains(&s.sample_rate_hz) {
            errors.push(format!(
                "AUDIO_SAMPLE_RATE must be between {MIN_AUDIO_SAMPLE_RATE} and {MAX_AUDIO_SAMPLE_RATE} Hz"
            ));
        }
        if !(1..=MAX_SEGMENT_SECONDS).contains(&s.segment_duration_seconds) {
            errors.push(format!(
                "SEGMENT_DURATION_SECONDS must be between 1 and {MAX_SEGMENT_SECONDS}"
            ));
        }
        if !(1..=MAX_SEGMENT_SECONDS).contains(&s.target_seconds) {
            errors.push(format!("TARGET_SECONDS must be between 1 and {MAX_SEGMENT_SECONDS}"));
        }
        if s.retention_period_ms < 60_000 {
            errors.push("RETENTION_PERIOD_MINUTES must be at least 1".to_string());
        }
        let max_mb = s.max_storage_bytes / MB;
        if !(MIN_MAX_STORAGE_MB..=MAX_MAX_STORAGE_MB).contains(&max_mb) {
            errors.push(format!(
                "MAX_STORAGE_MB must be between {MIN_MAX_STORAGE_MB} and {MAX_MAX_STORAGE_MB}"
            ));
        }
        if self.listen_addr.parse::<SocketAddr>().is_err() {
            errors.push(format!("LISTEN_ADDR is not a socket address: {}", self.listen_addr));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("Invalid configuration: {}", errors.join("; "))
        }
    }
}

/// Parse a `KEY=VALUE` configuration file.
///
/// Lines starting with `#` are comments.  Values may be optionally
/// double-quoted.  Unknown keys are silently ignored.
pub fn load(path: &Path) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read config: {}", path.display()))?;

    let config = from_map(&parse_conf(&text));
    info!("Loaded config from {}", path.display());
    Ok(config)
}

fn from_map(map: &HashMap<String, String>) -> Config {
    let get = |key: &str| -> Option<String> { map.get(key).cloned() };
    let get_u64 = |key: &str, default: u64| -> u64 {
        get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    };
    let get_u32 = |key: &str, default: u32| -> u32 {
        get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    };

    let recs_dir = PathBuf::from(get("RECS_DIR").unwrap_or_else(|| "/data".into()));
    let db_path = get("DB_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|| recs_dir.join("segments.db"));

    let defaults = Settings::default();
    let settings = Settings {
        segment_duration_seconds: get_u64(
            "SEGMENT_DURATION_SECONDS",
            defaults.segment_duration_seconds,
        ),
        adaptive_mode_enabled: get("ADAPTIVE_MODE")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(defaults.adaptive_mode_enabled),
        target_seconds: get_u64("TARGET_SECONDS", defaults.target_seconds),
        retention_period_ms: i64::try_from(get_u64("RETENTION_PERIOD_MINUTES", 10))
            .unwrap_or(i64::MAX)
            .saturating_mul(60 * 1000),
        max_storage_bytes: get_u64("MAX_STORAGE_MB", 100).saturating_mul(MB),
        bitrate_bps: get_u32("AUDIO_BITRATE", defaults.bitrate_bps),
        sample_rate_hz: get_u32("AUDIO_SAMPLE_RATE", defaults.sample_rate_hz),
    };

    Config {
        settings,
        rec_card: get("REC_CARD").filter(|s| !s.is_empty()),
        recs_dir,
        db_path,
        min_free_bytes: get_u64("MIN_FREE_MB", 10).saturating_mul(MB),
        cleanup_interval_secs: get_u64("CLEANUP_INTERVAL_SECS", 60).max(1),
        health_check_interval_secs: get_u64("HEALTH_CHECK_INTERVAL_SECS", 30).max(1),
        recent_activity_secs: get_u64("RECENT_ACTIVITY_SECS", 300),
        listen_addr: get("LISTEN_ADDR").unwrap_or_else(|| "127.0.0.1:8090".into()),
    }
}

/// Parse `KEY=VALUE` lines into a map, stripping optional double-quotes.
fn parse_conf(text: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, val)) = line.split_once('=') {
            let key = key.trim();
            let val = val.trim().trim_matches('"');
            map.insert(key.to_string(), val.to_string());
        }
    }
    map
}

// ─── tests ───────────────────────────────────────────────────────────────
