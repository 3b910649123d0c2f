//! Capture controller – the single owner of the live recording session.
//!
//! All session mutations run on one actor task fed by a command channel,
//! so start, stop, rotation and call handover never interleave. Readers
//! (scheduler, health monitor, HTTP) see the session through a `watch`
//! snapshot and the sink's level meter without going through the actor.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use rewind_common::config::Settings;
use rewind_common::error::CaptureError;
use rewind_common::files::FileStore;
use rewind_common::segment::{CallInfo, CompletedSegment};

use crate::sink::{CaptureSink, LevelMeter, SinkParams};

pub const MAX_START_ATTEMPTS: u32 = 3;
pub const INITIAL_BACKOFF: Duration = Duration::from_millis(250);
pub const MAX_BACKOFF: Duration = Duration::from_millis(2_000);
/// Call segments shorter than this are discarded as degenerate.
pub const MIN_CALL_SEGMENT_MS: i64 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureState {
    Idle,
    Starting,
    Recording,
    Rotating,
    Stopping,
}

/// What kind of session to open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionKind {
    Ambient,
    Call(CallInfo),
}

impl SessionKind {
    fn call(&self) -> Option<CallInfo> {
        match self {
            Self::Ambient => None,
            Self::Call(info) => Some(info.clone()),
        }
    }
}

/// Read-only view of the controller, published after every transition.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub state: CaptureState,
    pub current_path: Option<PathBuf>,
    pub started_at: Option<Instant>,
    /// Epoch milliseconds the current session started.
    pub started_at_ms: i64,
    pub call: Option<CallInfo>,
    /// Start of uninterrupted capture. Survives rotation and call
    /// handover; cleared by an explicit stop or a failed start.
    pub recording_since: Option<Instant>,
}

impl SessionSnapshot {
    pub fn idle() -> Self {
        Self {
            state: CaptureState::Idle,
            current_path: None,
            started_at: None,
            started_at_ms: 0,
            call: None,
            recording_since: None,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.state == CaptureState::Recording
    }

    pub fn is_call(&self) -> bool {
        self.call.is_some()
    }

    /// Milliseconds since the current session started, 0 when idle.
    pub fn elapsed_ms(&self) -> i64 {
        self.started_at
            .map(|t| t.elapsed().as_millis() as i64)
            .unwrap_or(0)
    }

    /// Milliseconds of uninterrupted capture across segments.
    pub fn recording_duration_ms(&self) -> i64 {
        self.recording_since
            .map(|t| t.elapsed().as_millis() as i64)
            .unwrap_or(0)
    }

    pub fn kind(&self) -> SessionKind {
        match &self.call {
            Some(info) => SessionKind::Call(info.clone()),
            None => SessionKind::Ambient,
        }
    }
}

/// Identifies a freshly started session.
#[derive(Debug, Clone)]
pub struct SegmentHandle {
    pub path: PathBuf,
    pub start_time: i64,
    pub call: Option<CallInfo>,
}

enum Command {
    Start {
        kind: SessionKind,
        reply: oneshot::Sender<Result<SegmentHandle, CaptureError>>,
    },
    Stop {
        reply: oneshot::Sender<Option<CompletedSegment>>,
    },
    Rotate {
        reply: oneshot::Sender<Option<CompletedSegment>>,
    },
    BeginCall {
        call: CallInfo,
        reply: oneshot::Sender<Result<SegmentHandle, CaptureError>>,
    },
    EndCall {
        reply: oneshot::Sender<Option<CompletedSegment>>,
    },
    CheckAlive {
        reply: oneshot::Sender<bool>,
    },
    Shutdown {
        reply: oneshot::Sender<Option<CompletedSegment>>,
    },
}

/// Cloneable front door to the controller actor.
#[derive(Clone)]
pub struct ControllerHandle {
    tx: mpsc::Sender<Command>,
    state: watch::Receiver<SessionSnapshot>,
    meter: Arc<dyn LevelMeter>,
}

impl ControllerHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Option<T> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).await.ok()?;
        rx.await.ok()
    }

    /// Open a new session, retrying with backoff on transient failure.
    pub async fn start(&self, kind: SessionKind) -> Result<SegmentHandle, CaptureError> {
        self.request(|reply| Command::Start { kind, reply })
            .await
            .unwrap_or_else(|| Err(controller_gone()))
    }

    /// Close the current session. `None` if nothing was recording or the
    /// segment was discarded.
    pub async fn stop(&self) -> Option<CompletedSegment> {
        self.request(|reply| Command::Stop { reply }).await.flatten()
    }

    /// Close the current ambient segment and open the next one.
    /// Ignored for calls and when idle.
    pub async fn rotate(&self) -> Option<CompletedSegment> {
        self.request(|reply| Command::Rotate { reply }).await.flatten()
    }

    /// Hand the device to a call: stop ambient capture and open a call session.
    pub async fn begin_call(&self, call: CallInfo) -> Result<SegmentHandle, CaptureError> {
        self.request(|reply| Command::BeginCall { call, reply })
            .await
            .unwrap_or_else(|| Err(controller_gone()))
    }

    /// Close the call session and return to ambient capture.
    pub async fn end_call(&self) -> Option<CompletedSegment> {
        self.request(|reply| Command::EndCall { reply }).await.flatten()
    }

    /// Ask the sink whether the live session is still producing audio.
    /// A dead session is closed as a side effect.
    pub async fn check_alive(&self) -> bool {
        self.request(|reply| Command::CheckAlive { reply })
            .await
            .unwrap_or(false)
    }

    /// Stop any session and terminate the actor.
    pub async fn shutdown(&self) -> Option<CompletedSegment> {
        self.request(|reply| Command::Shutdown { reply }).await.flatten()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.state.clone()
    }

    pub fn is_recording(&self) -> bool {
        self.state.borrow().is_recording()
    }

    pub fn elapsed_ms(&self) -> i64 {
        self.state.borrow().elapsed_ms()
    }

    /// Peak input level since the last read; 0 when not recording.
    pub fn current_amplitude(&self) -> i32 {
        if self.is_recording() {
            self.meter.current_amplitude()
        } else {
            0
        }
    }
}

fn controller_gone() -> CaptureError {
    CaptureError::DeviceUnavailable("capture controller has shut down".into())
}

struct Session {
    path: PathBuf,
    started_at: Instant,
    started_at_ms: i64,
    call: Option<CallInfo>,
}

/// The actor owning the sink and the live session.
pub struct CaptureController {
    sink: Box<dyn CaptureSink>,
    files: Arc<dyn FileStore>,
    settings: watch::Receiver<Settings>,
    completed: mpsc::UnboundedSender<CompletedSegment>,
    state: watch::Sender<SessionSnapshot>,
    session: Option<Session>,
    recording_since: Option<Instant>,
    /// Wall-clock end of the last closed session. The next one never
    /// starts before it.
    last_end_ms: i64,
    start_failure_reported: bool,
}

impl CaptureController {
    /// Spawn the actor. Completed segments are pushed to `completed`.
    pub fn spawn(
        sink: Box<dyn CaptureSink>,
        files: Arc<dyn FileStore>,
        settings: watch::Receiver<Settings>,
        completed: mpsc::UnboundedSender<CompletedSegment>,
    ) -> (ControllerHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(32);
        let (state, state_rx) = watch::channel(SessionSnapshot::idle());
        let meter = sink.level_meter();
        let actor = Self {
            sink,
            files,
            settings,
            completed,
            state,
            session: None,
            recording_since: None,
            last_end_ms: 0,
            start_failure_reported: false,
        };
        let task = tokio::spawn(actor.run(rx));
        let handle = ControllerHandle {
            tx,
            state: state_rx,
            meter,
        };
        (handle, task)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        debug!("Capture controller started");
        while let Some(cmd) = rx.recv().await {
            match cmd {
                Command::Start { kind, reply } => {
                    let result = self.start_session(kind).await;
                    reply.send(result).ok();
                }
                Command::Stop { reply } => {
                    let done = self.stop_session();
                    self.recording_since = None;
                    self.publish(CaptureState::Idle);
                    reply.send(done).ok();
                }
                Command::Rotate { reply } => {
                    reply.send(self.rotate().await).ok();
                }
                Command::BeginCall { call, reply } => {
                    self.stop_session();
                    let result = self.start_session(SessionKind::Call(call)).await;
                    reply.send(result).ok();
                }
                Command::EndCall { reply } => {
                    reply.send(self.end_call().await).ok();
                }
                Command::CheckAlive { reply } => {
                    reply.send(self.check_alive()).ok();
                }
                Command::Shutdown { reply } => {
                    let done = self.stop_session();
                    self.recording_since = None;
                    self.publish(CaptureState::Idle);
                    reply.send(done).ok();
                    break;
                }
            }
        }
        if self.session.is_some() {
            self.stop_session();
        }
        debug!("Capture controller stopped");
    }

    fn publish(&self, state: CaptureState) {
        let snapshot = match &self.session {
            Some(s) => SessionSnapshot {
                state,
                current_path: Some(s.path.clone()),
                started_at: Some(s.started_at),
                started_at_ms: s.started_at_ms,
                call: s.call.clone(),
                recording_since: self.recording_since,
            },
            None => SessionSnapshot {
                state,
                recording_since: self.recording_since,
                ..SessionSnapshot::idle()
            },
        };
        self.state.send_replace(snapshot);
    }

    // ── start ────────────────────────────────────────────────────────

    async fn start_session(&mut self, kind: SessionKind) -> Result<SegmentHandle, CaptureError> {
        if self.session.is_some() {
            warn!("Already recording, closing current session first");
            self.stop_session();
        }

        let settings = self.settings.borrow().clone();
        let params = SinkParams {
            bitrate_bps: settings.bitrate_bps,
            sample_rate_hz: settings.sample_rate_hz,
            channels: 1,
        };

        let mut delay = INITIAL_BACKOFF;
        let mut attempt = 1;
        let err = loop {
            self.publish(CaptureState::Starting);
            match self.try_start(&params, &kind).await {
                Ok(handle) => {
                    if self.start_failure_reported {
                        info!("Recording recovered after earlier start failures");
                    }
                    self.start_failure_reported = false;
                    return Ok(handle);
                }
                Err(e) if e.is_retryable() && attempt < MAX_START_ATTEMPTS => {
                    warn!("Start attempt {attempt}/{MAX_START_ATTEMPTS} failed: {e}");
                    sleep(delay).await;
                    delay = (delay * 2).min(MAX_BACKOFF);
                    attempt += 1;
                }
                Err(e) => break e,
            }
        };

        self.recording_since = None;
        self.publish(CaptureState::Idle);
        if self.start_failure_reported {
            debug!("Recording still unavailable: {err}");
        } else {
            error!("Recording could not start after {attempt} attempt(s): {err}");
            self.start_failure_reported = true;
        }
        Err(err)
    }

    /// One start attempt. On failure nothing is left behind: the sink is
    /// reset and the output path removed.
    async fn try_start(
        &mut self,
        params: &SinkParams,
        kind: &SessionKind,
    ) -> Result<SegmentHandle, CaptureError> {
        let started_at_ms = Utc::now().timestamp_millis().max(self.last_end_ms);
        let path = self.files.create_path(started_at_ms);

        if let Err(e) = self.open_sink(params, &path).await {
            self.sink.reset();
            self.files.delete(&path);
            return Err(e);
        }

        let call = kind.call();
        let now = Instant::now();
        self.recording_since.get_or_insert(now);
        self.session = Some(Session {
            path: path.clone(),
            started_at: now,
            started_at_ms,
            call: call.clone(),
        });
        self.publish(CaptureState::Recording);
        match &call {
            Some(info) => info!("Call recording started ({}) → {}", info.direction, path.display()),
            None => info!("Recording started → {}", path.display()),
        }
        Ok(SegmentHandle {
            path,
            start_time: started_at_ms,
            call,
        })
    }

    async fn open_sink(&mut self, params: &SinkParams, path: &std::path::Path) -> Result<(), CaptureError> {
        self.sink.configure(params, path)?;
        self.sink.start()?;
        let settle = self.sink.settle_time();
        if !settle.is_zero() {
            sleep(settle).await;
            if !self.sink.is_alive() {
                return Err(CaptureError::CaptureStartFailed(
                    "capture exited during start".into(),
                ));
            }
        }
        Ok(())
    }

    // ── stop / rotate ────────────────────────────────────────────────

    fn stop_session(&mut self) -> Option<CompletedSegment> {
        let Some(session) = self.session.as_ref() else {
            debug!("Stop requested while idle");
            return None;
        };
        let duration = session.started_at.elapsed().as_millis() as i64;
        self.last_end_ms = session.started_at_ms + duration;
        self.publish(CaptureState::Stopping);
        let result = self.sink.stop();

        let session = self.session.take()?;
        self.publish(CaptureState::Idle);

        if let Err(e) = result {
            error!("Error stopping recording {}: {e}", session.path.display());
            self.sink.reset();
            return None;
        }

        let done = CompletedSegment {
            path: session.path,
            start_time: session.started_at_ms,
            duration,
            call: session.call,
        };
        if duration <= 0 || (done.is_call() && duration < MIN_CALL_SEGMENT_MS) {
            info!(
                "Discarding degenerate segment {} ({duration}ms)",
                done.path.display()
            );
            self.files.delete(&done.path);
            return None;
        }

        info!(
            "Segment completed: {} ({:.1}s)",
            done.path.display(),
            duration as f64 / 1000.0
        );
        if self.completed.send(done.clone()).is_err() {
            warn!("Retention worker gone; {} left unregistered", done.path.display());
        }
        Some(done)
    }

    async fn rotate(&mut self) -> Option<CompletedSegment> {
        match &self.session {
            None => {
                debug!("Rotation skipped: not recording");
                return None;
            }
            Some(s) if s.call.is_some() => {
                debug!("Rotation skipped: call in progress");
                return None;
            }
            Some(_) => {}
        }
        let begun = Instant::now();
        self.publish(CaptureState::Rotating);
        let done = self.stop_session();
        match self.start_session(SessionKind::Ambient).await {
            Ok(_) => debug!("Rotation took {}ms", begun.elapsed().as_millis()),
            Err(e) => error!("Failed to open next segment after rotation: {e}"),
        }
        done
    }

    async fn end_call(&mut self) -> Option<CompletedSegment> {
        let in_call = self.session.as_ref().is_some_and(|s| s.call.is_some());
        let done = if in_call { self.stop_session() } else { None };
        if self.session.is_none() {
            if let Err(e) = self.start_session(SessionKind::Ambient).await {
                error!("Failed to resume ambient recording after call: {e}");
            }
        }
        done
    }

    fn check_alive(&mut self) -> bool {
        if self.session.is_none() {
            return false;
        }
        if self.sink.is_alive() {
            return true;
        }
        error!("Capture session died unexpectedly, closing it");
        self.stop_session();
        self.recording_since = None;
        self.publish(CaptureState::Idle);
        false
    }
}
