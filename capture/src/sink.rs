//! Capture sink – spawns `arecord` and writes its PCM stream to a WAV file.
//!
//! The controller only ever talks to the [`CaptureSink`] trait; the
//! `arecord` implementation mirrors how the capture server used to spawn
//! its recording child, with stderr drained on a side thread so ALSA errors
//! reach the log.

use std::io::{BufRead, BufReader, BufWriter, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info, warn};

use rewind_common::error::CaptureError;

/// How long a freshly spawned `arecord` must survive before it counts as started.
const ARECORD_SETTLE: Duration = Duration::from_millis(300);

/// Encoding parameters handed to the sink for each session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkParams {
    pub bitrate_bps: u32,
    pub sample_rate_hz: u32,
    pub channels: u16,
}

/// Non-blocking view of the input level.
pub trait LevelMeter: Send + Sync {
    /// Peak absolute amplitude (0..=32767) since the previous read.
    fn current_amplitude(&self) -> i32;
}

/// Lock-free peak tracker fed by the writer thread.
#[derive(Debug, Default)]
pub struct PeakMeter {
    peak: AtomicI32,
}

impl PeakMeter {
    pub fn record(&self, amplitude: i32) {
        self.peak.fetch_max(amplitude, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.peak.store(0, Ordering::Relaxed);
    }
}

impl LevelMeter for PeakMeter {
    fn current_amplitude(&self) -> i32 {
        self.peak.swap(0, Ordering::Relaxed)
    }
}

/// An encoder that turns live input into a file.
///
/// Only the capture controller's actor calls the mutating methods, so
/// implementations never see concurrent start/stop.
pub trait CaptureSink: Send {
    fn configure(&mut self, params: &SinkParams, output: &Path) -> Result<(), CaptureError>;
    fn start(&mut self) -> Result<(), CaptureError>;
    /// Stop capturing and finalize the output file.
    fn stop(&mut self) -> Result<(), CaptureError>;
    /// Drop any half-initialised state. Never fails.
    fn reset(&mut self);
    /// Whether the running capture is still producing audio.
    fn is_alive(&mut self) -> bool;
    /// Grace period after `start` before liveness is trusted.
    fn settle_time(&self) -> Duration {
        Duration::ZERO
    }
    fn level_meter(&self) -> Arc<dyn LevelMeter>;
}

/// A disposable check that the capture device can be opened.
pub trait DeviceProbe: Send + Sync {
    fn probe(&self) -> Result<(), CaptureError>;
}

// ── arecord ──────────────────────────────────────────────────────────────

struct Recording {
    child: Child,
    writer: Option<JoinHandle<Result<u64, String>>>,
}

/// [`CaptureSink`] backed by an `arecord` child emitting raw S16_LE PCM.
///
/// PCM has no bitrate knob; the configured bitrate only feeds storage
/// estimates.
pub struct ArecordSink {
    device: Option<String>,
    meter: Arc<PeakMeter>,
    target: Option<(SinkParams, PathBuf)>,
    active: Option<Recording>,
}

impl ArecordSink {
    pub fn new(device: Option<String>) -> Self {
        Self {
            device,
            meter: Arc::new(PeakMeter::default()),
            target: None,
            active: None,
        }
    }
}

fn arecord_command(device: Option<&str>, params: &SinkParams) -> Command {
    let mut cmd = Command::new("arecord");
    cmd.args(["-q", "-f", "S16_LE"])
        .arg(format!("-c{}", params.channels))
        .arg(format!("-r{}", params.sample_rate_hz))
        .args(["-t", "raw"]);
    if let Some(card) = device {
        cmd.args(["-D", card]);
    }
    cmd
}

fn spawn_error(e: std::io::Error) -> CaptureError {
    if e.kind() == std::io::ErrorKind::NotFound {
        CaptureError::DeviceUnavailable("arecord not found in PATH".into())
    } else {
        CaptureError::CaptureStartFailed(format!("Failed to spawn arecord: {e}"))
    }
}

impl CaptureSink for ArecordSink {
    fn configure(&mut self, params: &SinkParams, output: &Path) -> Result<(), CaptureError> {
        if params.channels == 0 || params.sample_rate_hz == 0 {
            return Err(CaptureError::CaptureStartFailed(format!(
                "Invalid encoding parameters: {params:?}"
            )));
        }
        self.target = Some((*params, output.to_path_buf()));
        Ok(())
    }

    fn start(&mut self) -> Result<(), CaptureError> {
        if self.active.is_some() {
            return Err(CaptureError::CaptureStartFailed("arecord already running".into()));
        }
        let (params, path) = self
            .target
            .clone()
            .ok_or_else(|| CaptureError::CaptureStartFailed("sink not configured".into()))?;

        let spec = hound::WavSpec {
            channels: params.channels,
            sample_rate: params.sample_rate_hz,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let writer = hound::WavWriter::create(&path, spec).map_err(|e| {
            CaptureError::CaptureStartFailed(format!("Cannot create {}: {e}", path.display()))
        })?;

        let mut cmd = arecord_command(self.device.as_deref(), &params);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd.spawn().map_err(spawn_error)?;

        // Drain stderr in a background thread so we see any ALSA errors
        // and the pipe buffer doesn't fill up and block arecord.
        if let Some(stderr) = child.stderr.take() {
            std::thread::Builder::new()
                .name("arecord-stderr".into())
                .spawn(move || {
                    let reader = BufReader::new(stderr);
                    for line in reader.lines() {
                        match line {
                            Ok(l) if l.is_empty() => {}
                            Ok(l) => warn!("[arecord] {l}"),
                            Err(_) => break,
                        }
                    }
                    debug!("arecord stderr stream ended");
                })
                .ok();
        }

        let Some(stdout) = child.stdout.take() else {
            child.kill().ok();
            child.wait().ok();
            return Err(CaptureError::CaptureStartFailed("arecord stdout unavailable".into()));
        };

        self.meter.reset();
        let meter = self.meter.clone();
        let writer_thread = std::thread::Builder::new()
            .name("arecord-writer".into())
            .spawn(move || pump(stdout, writer, &meter));
        let writer_thread = match writer_thread {
            Ok(handle) => handle,
            Err(e) => {
                child.kill().ok();
                child.wait().ok();
                return Err(CaptureError::CaptureStartFailed(format!(
                    "Cannot spawn writer thread: {e}"
                )));
            }
        };

        info!(
            "arecord started (pid={}, rate={}, channels={}, card={:?}) → {}",
            child.id(),
            params.sample_rate_hz,
            params.channels,
            self.device,
            path.display()
        );
        self.active = Some(Recording {
            child,
            writer: Some(writer_thread),
        });
        Ok(())
    }

    fn stop(&mut self) -> Result<(), CaptureError> {
        let Some(mut rec) = self.active.take() else {
            return Err(CaptureError::CaptureIoFailed("arecord is not running".into()));
        };
        // Raw output has no trailer to flush; killing closes stdout and the
        // writer finalizes the WAV header on EOF.
        rec.child.kill().ok();
        rec.child.wait().ok();

        match rec.writer.take().map(JoinHandle::join) {
            Some(Ok(Ok(samples))) => {
                debug!("arecord stopped after {samples} samples");
                Ok(())
            }
            Some(Ok(Err(e))) => Err(CaptureError::CaptureIoFailed(e)),
            Some(Err(_)) => Err(CaptureError::CaptureIoFailed(
                "writer thread panicked".into(),
            )),
            None => Ok(()),
        }
    }

    fn reset(&mut self) {
        if let Some(mut rec) = self.active.take() {
            rec.child.kill().ok();
            rec.child.wait().ok();
            if let Some(handle) = rec.writer.take() {
                handle.join().ok();
            }
        }
        self.meter.reset();
    }

    fn is_alive(&mut self) -> bool {
        match self.active.as_mut() {
            Some(rec) => matches!(rec.child.try_wait(), Ok(None)),
            None => false,
        }
    }

    fn settle_time(&self) -> Duration {
        ARECORD_SETTLE
    }

    fn level_meter(&self) -> Arc<dyn LevelMeter> {
        self.meter.clone()
    }
}

impl Drop for ArecordSink {
    fn drop(&mut self) {
        self.reset();
    }
}

/// Copy PCM from `arecord` into the WAV writer until EOF, tracking peaks.
fn pump(
    mut stdout: ChildStdout,
    mut writer: hound::WavWriter<BufWriter<std::fs::File>>,
    meter: &PeakMeter,
) -> Result<u64, String> {
    let mut buf = [0u8; 4096];
    let mut pending: Vec<u8> = Vec::with_capacity(8192);
    let mut samples = 0u64;

    loop {
        let n = match stdout.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("arecord read error: {e}");
                break;
            }
        };
        pending.extend_from_slice(&buf[..n]);
        let whole = pending.len() / 2 * 2;
        let mut peak = 0i32;
        for pair in pending[..whole].chunks_exact(2) {
            let sample = i16::from_le_bytes([pair[0], pair[1]]);
            peak = peak.max((sample as i32).abs());
            writer.write_sample(sample).map_err(|e| e.to_string())?;
            samples += 1;
        }
        pending.drain(..whole);
        meter.record(peak);
    }

    writer.finalize().map_err(|e| e.to_string())?;
    Ok(samples)
}

/// [`DeviceProbe`] that opens a short-lived `arecord` session.
pub struct ArecordProbe {
    device: Option<String>,
    sample_rate_hz: u32,
}

impl ArecordProbe {
    pub fn new(device: Option<String>, sample_rate_hz: u32) -> Self {
        Self {
            device,
            sample_rate_hz,
        }
    }
}

impl DeviceProbe for ArecordProbe {
    fn probe(&self) -> Result<(), CaptureError> {
        let params = SinkParams {
            bitrate_bps: 0,
            sample_rate_hz: self.sample_rate_hz,
            channels: 1,
        };
        let mut cmd = arecord_command(self.device.as_deref(), &params);
        cmd.args(["-d", "1"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let mut child = cmd.spawn().map_err(|e| match spawn_error(e) {
            CaptureError::CaptureStartFailed(msg) => CaptureError::DeviceUnavailable(msg),
            other => other,
        })?;

        std::thread::sleep(ARECORD_SETTLE);
        let result = match child.try_wait() {
            Ok(None) => Ok(()),
            Ok(Some(status)) if status.success() => Ok(()),
            Ok(Some(status)) => Err(CaptureError::DeviceUnavailable(format!(
                "probe session exited with {status}"
            ))),
            Err(e) => Err(CaptureError::DeviceUnavailable(format!(
                "Cannot check probe session: {e}"
            ))),
        };
        child.kill().ok();
        child.wait().ok();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peak_meter_reports_max_since_last_read() {
        let meter = PeakMeter::default();
        meter.record(1200);
        meter.record(300);
        assert_eq!(meter.current_amplitude(), 1200);
        assert_eq!(meter.current_amplitude(), 0);
    }

    #[test]
    fn test_arecord_command_args() {
        let params = SinkParams {
            bitrate_bps: 32_000,
            sample_rate_hz: 16_000,
            channels: 1,
        };
        let cmd = arecord_command(Some("hw:1,0"), &params);
        let args: Vec<_> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert!(args.contains(&"-r16000".to_string()));
        assert!(args.contains(&"-c1".to_string()));
        assert_eq!(&args[args.len() - 2..], ["-D", "hw:1,0"]);
    }

    #[test]
    fn test_stop_without_start_is_an_error() {
        let mut sink = ArecordSink::new(None);
        assert!(sink.stop().is_err());
        assert!(!sink.is_alive());
    }

    #[test]
    fn test_configure_rejects_zero_rate() {
        let mut sink = ArecordSink::new(None);
        let params = SinkParams {
            bitrate_bps: 32_000,
            sample_rate_hz: 0,
            channels: 1,
        };
        assert!(sink.configure(&params, Path::new("/tmp/x.wav")).is_err());
    }
}
