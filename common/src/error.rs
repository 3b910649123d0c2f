//! Error taxonomy shared by the capture components.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CaptureError {
    /// The sink could not be configured or started. Retryable, bounded.
    #[error("capture start failed: {0}")]
    CaptureStartFailed(String),

    /// The live session broke while running; treated as session loss.
    #[error("capture I/O failed: {0}")]
    CaptureIoFailed(String),

    #[error("storage exhausted: {available} bytes free, {required} required")]
    StorageExhausted { available: u64, required: u64 },

    /// The segment index could not be reached; the pass is retried next tick.
    #[error("segment index unavailable: {0}")]
    IndexUnavailable(String),

    /// Call-state source or capture device missing. Degrades a feature.
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),
}

impl CaptureError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::CaptureStartFailed(_) | Self::IndexUnavailable(_)
        )
    }
}

impl From<rusqlite::Error> for CaptureError {
    fn from(e: rusqlite::Error) -> Self {
        Self::IndexUnavailable(e.to_string())
    }
}

impl From<std::io::Error> for CaptureError {
    fn from(e: std::io::Error) -> Self {
        Self::CaptureIoFailed(e.to_string())
    }
}
