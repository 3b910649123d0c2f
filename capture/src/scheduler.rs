//! Rotation scheduler – decides when the current ambient segment ends.
//!
//! Fixed mode rotates every `segment_duration_seconds`. Adaptive mode waits
//! for the target length, then keeps recording until the input goes quiet
//! (or a hard cap is hit) so segments break between sentences rather than
//! in the middle of one.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use rewind_common::config::Settings;

use crate::controller::ControllerHandle;

/// Poll interval while waiting for the adaptive target.
pub const TARGET_POLL: Duration = Duration::from_millis(250);
/// Amplitude sampling interval while looking for a quiet window.
pub const SAMPLE_PERIOD: Duration = Duration::from_millis(100);
/// Amplitude floor under which input always counts as quiet.
pub const MIN_THRESHOLD: f64 = 800.0;
/// Quiet means below this fraction of the running average.
pub const RELATIVE_FACTOR: f64 = 0.35;
/// Consecutive quiet time needed before rotating.
pub const SILENCE_MIN_MS: u64 = 1_200;
/// Longest an adaptive segment may run past its target.
pub const MAX_EXTRA_WAIT_MS: i64 = 180_000;
const EMA_ALPHA: f64 = 0.1;
/// How long `suspend` waits for the scheduler to park.
const PARK_TIMEOUT: Duration = Duration::from_secs(2);

/// Running-average silence detector.
#[derive(Debug, Default)]
pub struct QuietWindow {
    ema: Option<f64>,
    silence_ms: u64,
}

impl QuietWindow {
    /// Feed one amplitude sample covering `period_ms`. Returns true once
    /// input has been quiet for [`SILENCE_MIN_MS`].
    pub fn observe(&mut self, amplitude: i32, period_ms: u64) -> bool {
        let sample = amplitude.max(0) as f64;
        let ema = match self.ema {
            Some(prev) => prev * (1.0 - EMA_ALPHA) + sample * EMA_ALPHA,
            None => sample,
        };
        self.ema = Some(ema);

        let threshold = MIN_THRESHOLD.max(ema * RELATIVE_FACTOR);
        if sample < threshold {
            self.silence_ms += period_ms;
        } else {
            self.silence_ms = 0;
        }
        self.silence_ms >= SILENCE_MIN_MS
    }
}

/// Longest segment the current settings can produce, in milliseconds.
pub fn longest_segment_ms(settings: &Settings) -> i64 {
    if settings.adaptive_mode_enabled {
        settings.target().as_millis() as i64 + MAX_EXTRA_WAIT_MS
    } else {
        settings.segment_duration().as_millis() as i64
    }
}

/// Suspend/resume switch shared with the interruption arbiter.
#[derive(Clone)]
pub struct SchedulerControl {
    suspended: Arc<watch::Sender<bool>>,
    parked: watch::Receiver<bool>,
}

impl SchedulerControl {
    /// Stop issuing rotations. Returns once the scheduler has parked or
    /// after a short timeout.
    pub async fn suspend(&self) {
        self.suspended.send_replace(true);
        let mut parked = self.parked.clone();
        let acked = timeout(PARK_TIMEOUT, parked.wait_for(|p| *p))
            .await
            .is_ok_and(|r| r.is_ok());
        if acked {
            debug!("Rotation scheduler parked");
        } else {
            warn!("Rotation scheduler did not acknowledge suspension");
        }
    }

    pub fn resume(&self) {
        if self.suspended.send_replace(false) {
            debug!("Rotation scheduler resumed");
        }
    }

    pub fn is_suspended(&self) -> bool {
        *self.suspended.borrow()
    }
}

enum Wake {
    Elapsed,
    /// Suspended, mode flipped, or the session changed underneath us.
    Interrupted,
    Cancelled,
}

pub struct RotationScheduler {
    controller: ControllerHandle,
    settings: watch::Receiver<Settings>,
    suspended: watch::Receiver<bool>,
    parked: watch::Sender<bool>,
    cancel: CancellationToken,
    rotations: u64,
}

impl RotationScheduler {
    pub fn spawn(
        controller: ControllerHandle,
        settings: watch::Receiver<Settings>,
        cancel: CancellationToken,
    ) -> (SchedulerControl, JoinHandle<u64>) {
        let (suspended_tx, suspended) = watch::channel(false);
        let (parked, parked_rx) = watch::channel(false);
        let scheduler = Self {
            controller,
            settings,
            suspended,
            parked,
            cancel,
            rotations: 0,
        };
        let task = tokio::spawn(scheduler.run());
        let control = SchedulerControl {
            suspended: Arc::new(suspended_tx),
            parked: parked_rx,
        };
        (control, task)
    }

    /// Returns the number of rotations issued.
    async fn run(mut self) -> u64 {
        info!("Rotation scheduler started");
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            if *self.suspended.borrow_and_update() {
                self.parked.send_replace(true);
                let resumed = tokio::select! {
                    _ = self.cancel.cancelled() => false,
                    r = self.suspended.wait_for(|s| !*s) => r.is_ok(),
                };
                self.parked.send_replace(false);
                if !resumed {
                    break;
                }
                continue;
            }

            let settings = self.settings.borrow_and_update().clone();
            let wake = if settings.adaptive_mode_enabled {
                self.adaptive_cycle(&settings).await
            } else {
                self.fixed_cycle(&settings).await
            };

            match wake {
                Wake::Elapsed => self.rotate().await,
                Wake::Interrupted => continue,
                Wake::Cancelled => break,
            }
        }
        self.parked.send_replace(true);
        info!("Rotation scheduler stopped after {} rotation(s)", self.rotations);
        self.rotations
    }

    fn session_start(&self) -> Option<Instant> {
        self.controller.snapshot().started_at
    }

    /// Wait out one fixed-length segment. A session restarted meanwhile
    /// (manual rotation, recovery) gets a fresh deadline instead.
    async fn fixed_cycle(&mut self, settings: &Settings) -> Wake {
        let started = self.session_start();
        let deadline = started.unwrap_or_else(Instant::now) + settings.segment_duration();
        match self.pause_until(deadline, false).await {
            Wake::Elapsed if started.is_none() || self.session_start() != started => {
                debug!("Session restarted during fixed wait");
                Wake::Interrupted
            }
            other => other,
        }
    }

    async fn adaptive_cycle(&mut self, settings: &Settings) -> Wake {
        let target_ms = settings.target().as_millis() as i64;

        // Phase 1: reach the target length.
        while self.controller.elapsed_ms() < target_ms {
            match self.pause(TARGET_POLL, true).await {
                Wake::Elapsed => {}
                other => return other,
            }
        }

        // Phase 2: wait for a quiet window, bounded by the hard cap.
        let mut window = QuietWindow::default();
        let period_ms = SAMPLE_PERIOD.as_millis() as u64;
        let mut last_elapsed = 0;
        loop {
            let elapsed = self.controller.elapsed_ms();
            if elapsed < last_elapsed {
                debug!("Session restarted during quiet-window search");
                return Wake::Interrupted;
            }
            last_elapsed = elapsed;

            let quiet = window.observe(self.controller.current_amplitude(), period_ms);
            if quiet {
                debug!("Quiet window found at {elapsed}ms");
                return Wake::Elapsed;
            }
            if elapsed >= target_ms + MAX_EXTRA_WAIT_MS {
                info!("No quiet window within {MAX_EXTRA_WAIT_MS}ms of target, forcing rotation");
                return Wake::Elapsed;
            }
            match self.pause(SAMPLE_PERIOD, true).await {
                Wake::Elapsed => {}
                other => return other,
            }
        }
    }

    async fn pause(&mut self, period: Duration, adaptive: bool) -> Wake {
        self.pause_until(Instant::now() + period, adaptive).await
    }

    /// Sleep until `deadline`, waking early on cancellation, suspension or
    /// a rotation-mode change.
    async fn pause_until(&mut self, deadline: Instant, adaptive: bool) -> Wake {
        let mut settings_open = true;
        let mut suspend_open = true;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Wake::Cancelled,
                _ = sleep_until(deadline) => return Wake::Elapsed,
                r = self.suspended.changed(), if suspend_open => {
                    if r.is_err() {
                        suspend_open = false;
                    } else if *self.suspended.borrow() {
                        return Wake::Interrupted;
                    }
                }
                r = self.settings.changed(), if settings_open => {
                    if r.is_err() {
                        settings_open = false;
                    } else if self.settings.borrow().adaptive_mode_enabled != adaptive {
                        info!("Rotation mode changed, restarting cycle");
                        return Wake::Interrupted;
                    }
                }
            }
        }
    }

    async fn rotate(&mut self) {
        match self.controller.rotate().await {
            Some(done) => {
                self.rotations += 1;
                debug!(
                    "Rotation #{} closed {} after {}ms",
                    self.rotations,
                    done.path.display(),
                    done.duration
                );
            }
            None => debug!("Rotation produced no segment"),
        }
    }
}
