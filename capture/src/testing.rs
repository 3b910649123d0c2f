//! In-process doubles for the sink and device probe, plus a controller
//! fixture on a temporary directory.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use rewind_common::config::Settings;
use rewind_common::error::CaptureError;
use rewind_common::files::{FileStore, LocalFileStore};
use rewind_common::segment::CompletedSegment;

use crate::controller::{CaptureController, ControllerHandle};
use crate::sink::{CaptureSink, DeviceProbe, LevelMeter, SinkParams};

/// Bytes a fake session writes to its file on stop.
pub const FAKE_SEGMENT_BYTES: usize = 4_096;

/// Shared counters and switches for observing a [`FakeSink`].
#[derive(Clone, Default)]
pub struct SinkProbe {
    starts: Arc<AtomicUsize>,
    stops: Arc<AtomicUsize>,
    failures_left: Arc<AtomicUsize>,
    dead: Arc<AtomicBool>,
}

impl SinkProbe {
    pub fn fail_next_starts(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn start_calls(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// Make the running session look crashed.
    pub fn kill(&self) {
        self.dead.store(true, Ordering::SeqCst);
    }
}

/// Amplitude as a function of milliseconds since the session started.
pub struct ScriptedMeter {
    origin: Mutex<Instant>,
    script: Box<dyn Fn(i64) -> i32 + Send + Sync>,
}

impl ScriptedMeter {
    fn restart(&self) {
        if let Ok(mut origin) = self.origin.lock() {
            *origin = Instant::now();
        }
    }
}

impl LevelMeter for ScriptedMeter {
    fn current_amplitude(&self) -> i32 {
        let origin = self.origin.lock().map(|o| *o).unwrap_or_else(|_| Instant::now());
        (self.script)(origin.elapsed().as_millis() as i64)
    }
}

pub struct FakeSink {
    pub probe: SinkProbe,
    meter: Arc<ScriptedMeter>,
    output: Option<PathBuf>,
    running: bool,
}

impl FakeSink {
    pub fn with_meter(script: impl Fn(i64) -> i32 + Send + Sync + 'static) -> Self {
        Self {
            probe: SinkProbe::default(),
            meter: Arc::new(ScriptedMeter {
                origin: Mutex::new(Instant::now()),
                script: Box::new(script),
            }),
            output: None,
            running: false,
        }
    }

    pub fn quiet() -> Self {
        Self::with_meter(|_| 0)
    }
}

impl CaptureSink for FakeSink {
    fn configure(&mut self, _params: &SinkParams, output: &Path) -> Result<(), CaptureError> {
        self.output = Some(output.to_path_buf());
        Ok(())
    }

    fn start(&mut self) -> Result<(), CaptureError> {
        self.probe.starts.fetch_add(1, Ordering::SeqCst);
        let left = self.probe.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.probe.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(CaptureError::CaptureStartFailed("scripted failure".into()));
        }
        let path = self
            .output
            .as_ref()
            .ok_or_else(|| CaptureError::CaptureStartFailed("not configured".into()))?;
        std::fs::write(path, b"")?;
        self.probe.dead.store(false, Ordering::SeqCst);
        self.meter.restart();
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), CaptureError> {
        if !self.running {
            return Err(CaptureError::CaptureIoFailed("not running".into()));
        }
        self.running = false;
        self.probe.stops.fetch_add(1, Ordering::SeqCst);
        if let Some(path) = &self.output {
            std::fs::write(path, vec![0u8; FAKE_SEGMENT_BYTES])?;
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.running = false;
    }

    fn is_alive(&mut self) -> bool {
        self.running && !self.probe.dead.load(Ordering::SeqCst)
    }

    fn level_meter(&self) -> Arc<dyn LevelMeter> {
        self.meter.clone()
    }
}

/// Device probe with a switchable outcome.
#[derive(Default)]
pub struct FakeProbe {
    pub broken: AtomicBool,
}

impl DeviceProbe for FakeProbe {
    fn probe(&self) -> Result<(), CaptureError> {
        if self.broken.load(Ordering::SeqCst) {
            Err(CaptureError::DeviceUnavailable("scripted".into()))
        } else {
            Ok(())
        }
    }
}

pub struct Fixture {
    pub controller: ControllerHandle,
    pub completed: mpsc::UnboundedReceiver<CompletedSegment>,
    pub files: Arc<dyn FileStore>,
    pub probe: SinkProbe,
    pub settings: watch::Sender<Settings>,
    pub task: JoinHandle<()>,
    pub tmp: tempfile::TempDir,
}

pub fn fixture(sink: FakeSink) -> Fixture {
    fixture_with(sink, Settings::default())
}

pub fn fixture_with(sink: FakeSink, settings: Settings) -> Fixture {
    let tmp = tempfile::tempdir().unwrap();
    let files: Arc<dyn FileStore> = Arc::new(LocalFileStore::new(tmp.path().join("segments")).unwrap());
    let (settings_tx, settings_rx) = watch::channel(settings);
    let (completed_tx, completed) = mpsc::unbounded_channel();
    let probe = sink.probe.clone();
    let (controller, task) =
        CaptureController::spawn(Box::new(sink), files.clone(), settings_rx, completed_tx);
    Fixture {
        controller,
        completed,
        files,
        probe,
        settings: settings_tx,
        task,
        tmp,
    }
}
