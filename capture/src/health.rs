//! Health monitor – periodic liveness audit with bounded recovery.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::{sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use rewind_common::config::Settings;
use rewind_common::files::FileStore;
use rewind_common::protocol::HealthReport;

use crate::controller::ControllerHandle;
use crate::retention::RetentionEngine;
use crate::scheduler::longest_segment_ms;
use crate::sink::DeviceProbe;

pub const MAX_CONSECUTIVE_FAILURES: u32 = 3;
pub const MIN_RECORDING_DURATION_MS: i64 = 5_000;
pub const RECOVERY_RETRY_DELAY: Duration = Duration::from_secs(5);
/// Slack added to the longest segment when judging recent activity.
const ACTIVITY_SLACK_MS: i64 = 60_000;

pub struct HealthMonitor {
    controller: ControllerHandle,
    engine: Arc<RetentionEngine>,
    files: Arc<dyn FileStore>,
    probe: Arc<dyn DeviceProbe>,
    settings: watch::Receiver<Settings>,
    min_free_bytes: u64,
    recent_window_ms: i64,
    started: Instant,
    consecutive_failures: u32,
    latest: watch::Sender<Option<HealthReport>>,
}

impl HealthMonitor {
    pub fn new(
        controller: ControllerHandle,
        engine: Arc<RetentionEngine>,
        files: Arc<dyn FileStore>,
        probe: Arc<dyn DeviceProbe>,
        settings: watch::Receiver<Settings>,
        min_free_bytes: u64,
        recent_window: Duration,
    ) -> (Self, watch::Receiver<Option<HealthReport>>) {
        let (latest, latest_rx) = watch::channel(None);
        let monitor = Self {
            controller,
            engine,
            files,
            probe,
            settings,
            min_free_bytes,
            recent_window_ms: recent_window.as_millis() as i64,
            started: Instant::now(),
            consecutive_failures: 0,
            latest,
        };
        (monitor, latest_rx)
    }

    pub async fn run(mut self, interval: Duration, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; give capture one interval to settle.
        tick.tick().await;
        info!("Health monitor started (every {}s)", interval.as_secs());
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    self.check().await;
                }
            }
        }
        info!("Health monitor stopped");
    }

    /// One audit tick: report, count failures, recover after too many.
    pub async fn check(&mut self) -> HealthReport {
        let mut report = self.generate_report().await;

        if report.is_healthy {
            if self.consecutive_failures > 0 {
                info!("Health restored after {} failed check(s)", self.consecutive_failures);
            }
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures += 1;
            warn!(
                "Health check failed ({}/{MAX_CONSECUTIVE_FAILURES}): recording={} storage={} device={} activity={}",
                self.consecutive_failures,
                report.recording_healthy,
                report.storage_healthy,
                report.device_healthy,
                report.has_recent_activity
            );
            if self.consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                error!("Too many consecutive health failures, attempting recovery");
                self.recover(&report).await;
                self.consecutive_failures = 0;
            }
        }

        report.consecutive_failures = self.consecutive_failures;
        self.latest.send_replace(Some(report.clone()));
        report
    }

    /// Assemble a report without acting on it.
    pub async fn generate_report(&self) -> HealthReport {
        let now_ms = Utc::now().timestamp_millis();
        // Goes through the actor, so an in-flight rotation finishes first.
        let is_recording = self.controller.check_alive().await;
        let snapshot = self.controller.snapshot();
        let recording_duration_ms = if is_recording {
            snapshot.recording_duration_ms()
        } else {
            0
        };
        let recording_healthy = is_recording && recording_duration_ms > MIN_RECORDING_DURATION_MS;

        let storage_healthy = match self.files.free_space() {
            Ok(free) => free >= self.min_free_bytes,
            Err(e) => {
                warn!("Cannot read free space: {e}");
                false
            }
        };

        let device_healthy = if is_recording {
            // A live session already holds the device.
            true
        } else {
            let probe = self.probe.clone();
            match tokio::task::spawn_blocking(move || probe.probe()).await {
                Ok(Ok(())) => true,
                Ok(Err(e)) => {
                    debug!("Device probe failed: {e}");
                    false
                }
                Err(e) => {
                    error!("Device probe task failed: {e}");
                    false
                }
            }
        };

        let has_recent_activity = snapshot.is_call() || self.recent_segment_exists(now_ms).await;

        let is_healthy = recording_healthy && storage_healthy && device_healthy && has_recent_activity;
        HealthReport {
            timestamp: now_ms,
            is_recording,
            recording_duration_ms,
            recording_healthy,
            storage_healthy,
            device_healthy,
            uptime_ms: self.started.elapsed().as_millis() as i64,
            has_recent_activity,
            consecutive_failures: self.consecutive_failures,
            is_healthy,
        }
    }

    /// Whether a segment overlaps the trailing activity window. The window
    /// is never shorter than the longest segment the settings can produce.
    async fn recent_segment_exists(&self, now_ms: i64) -> bool {
        let longest = longest_segment_ms(&self.settings.borrow()) + ACTIVITY_SLACK_MS;
        let window = self.recent_window_ms.max(longest);
        // Uninterrupted capture younger than the window has had no chance
        // to complete a segment yet.
        if self.controller.snapshot().recording_duration_ms() < window
            && self.controller.is_recording()
        {
            return true;
        }
        let engine = self.engine.clone();
        let found = tokio::task::spawn_blocking(move || {
            engine.store().get_in_range(now_ms - window, now_ms)
        })
        .await;
        match found {
            Ok(Ok(segments)) => !segments.is_empty(),
            Ok(Err(e)) => {
                warn!("Cannot query recent segments: {e}");
                false
            }
            Err(e) => {
                error!("Recent-activity task failed: {e}");
                false
            }
        }
    }

    async fn recover(&self, report: &HealthReport) {
        let kind = self.controller.snapshot().kind();
        warn!("Recovery: restarting capture");
        self.controller.stop().await;

        if !report.storage_healthy {
            warn!("Recovery: storage unhealthy, running cleanup");
            let engine = self.engine.clone();
            let result = tokio::task::spawn_blocking(move || {
                engine.run_cleanup(None, Utc::now().timestamp_millis());
                engine.relieve_storage_pressure(None);
            })
            .await;
            if let Err(e) = result {
                error!("Recovery cleanup task failed: {e}");
            }
        }

        if let Err(e) = self.controller.start(kind.clone()).await {
            warn!("Recovery start failed: {e}, retrying in {}s", RECOVERY_RETRY_DELAY.as_secs());
            sleep(RECOVERY_RETRY_DELAY).await;
            match self.controller.start(kind).await {
                Ok(_) => info!("Recovery succeeded on retry"),
                Err(e) => error!("Recovery failed: {e}"),
            }
        } else {
            info!("Recovery succeeded");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::SessionKind;
    use crate::testing::{fixture, FakeProbe, FakeSink, Fixture};
    use rewind_common::index::{SegmentStore, SqliteSegmentStore};
    use std::sync::atomic::Ordering;

    fn monitor(fx: &Fixture, probe: Arc<FakeProbe>) -> (HealthMonitor, Arc<dyn SegmentStore>) {
        let store: Arc<dyn SegmentStore> = Arc::new(SqliteSegmentStore::open_in_memory().unwrap());
        let engine = Arc::new(RetentionEngine::new(
            store.clone(),
            fx.files.clone(),
            fx.settings.subscribe(),
            0,
        ));
        let (monitor, _latest) = HealthMonitor::new(
            fx.controller.clone(),
            engine,
            fx.files.clone(),
            probe,
            fx.settings.subscribe(),
            0,
            Duration::from_secs(300),
        );
        (monitor, store)
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_while_recording() {
        let fx = fixture(FakeSink::quiet());
        let (mut monitor, _store) = monitor(&fx, Arc::new(FakeProbe::default()));
        fx.controller.start(SessionKind::Ambient).await.unwrap();
        sleep(Duration::from_secs(30)).await;
        let report = monitor.check().await;
        assert!(report.is_recording);
        assert!(report.recording_healthy);
        assert!(report.has_recent_activity);
        assert!(report.is_healthy, "{report:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_session_is_not_yet_healthy() {
        let fx = fixture(FakeSink::quiet());
        let (mut monitor, _store) = monitor(&fx, Arc::new(FakeProbe::default()));
        fx.controller.start(SessionKind::Ambient).await.unwrap();
        sleep(Duration::from_secs(2)).await;
        let report = monitor.check().await;
        assert!(report.is_recording);
        assert!(!report.recording_healthy);
        assert_eq!(report.consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_after_three_failures() {
        let fx = fixture(FakeSink::quiet());
        let probe = Arc::new(FakeProbe::default());
        let (mut monitor, _store) = monitor(&fx, probe.clone());
        fx.controller.start(SessionKind::Ambient).await.unwrap();
        sleep(Duration::from_secs(10)).await;

        // The capture process dies and the device stays busy.
        fx.probe.kill();
        probe.broken.store(true, Ordering::SeqCst);

        for expected in 1..=2 {
            let report = monitor.check().await;
            assert!(!report.is_healthy);
            assert_eq!(report.consecutive_failures, expected);
            assert!(!fx.controller.is_recording());
        }
        let starts_before = fx.probe.start_calls();
        let report = monitor.check().await;
        assert_eq!(report.consecutive_failures, 0);
        assert!(fx.controller.is_recording());
        assert_eq!(fx.probe.start_calls(), starts_before + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_retries_once_then_gives_up() {
        let fx = fixture(FakeSink::quiet());
        let (mut monitor, _store) = monitor(&fx, Arc::new(FakeProbe::default()));
        // Never started: not recording, three failed ticks.
        monitor.check().await;
        monitor.check().await;
        fx.probe.fail_next_starts(100);

        let before = Instant::now();
        let starts_before = fx.probe.start_calls();
        let report = monitor.check().await;
        assert_eq!(report.consecutive_failures, 0);
        assert!(!fx.controller.is_recording());
        // Two start() calls of three attempts each, plus the retry delay.
        assert_eq!(fx.probe.start_calls(), starts_before + 6);
        assert!(before.elapsed() >= RECOVERY_RETRY_DELAY);
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_call_counts_as_recent_activity() {
        let fx = fixture(FakeSink::quiet());
        let (monitor, _store) = monitor(&fx, Arc::new(FakeProbe::default()));
        let call = rewind_common::segment::CallInfo {
            direction: rewind_common::segment::CallDirection::Incoming,
            number: None,
        };
        fx.controller.begin_call(call).await.unwrap();
        // Long call: past the activity window with nothing indexed.
        sleep(Duration::from_secs(900)).await;
        let report = monitor.generate_report().await;
        assert!(report.has_recent_activity);
        assert!(report.is_healthy, "{report:?}");
    }
}
