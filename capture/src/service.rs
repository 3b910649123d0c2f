//! Wires the five components together and owns their tasks.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use rewind_common::config::{Config, Settings};
use rewind_common::files::FileStore;
use rewind_common::index::SegmentStore;
use rewind_common::protocol::HealthReport;

use crate::arbiter::{CallEvent, CallLog, InterruptionArbiter};
use crate::controller::{CaptureController, ControllerHandle, SessionKind};
use crate::health::HealthMonitor;
use crate::reservation::DeviceReservation;
use crate::retention::{self, RetentionEngine};
use crate::scheduler::{RotationScheduler, SchedulerControl};
use crate::sink::{CaptureSink, DeviceProbe};

/// Intervals and thresholds taken from [`Config`].
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub min_free_bytes: u64,
    pub cleanup_interval: Duration,
    pub health_interval: Duration,
    pub recent_activity: Duration,
    pub saved_dir: PathBuf,
}

impl From<&Config> for ServiceOptions {
    fn from(config: &Config) -> Self {
        Self {
            min_free_bytes: config.min_free_bytes,
            cleanup_interval: Duration::from_secs(config.cleanup_interval_secs),
            health_interval: Duration::from_secs(config.health_check_interval_secs),
            recent_activity: Duration::from_secs(config.recent_activity_secs),
            saved_dir: config.saved_dir(),
        }
    }
}

/// The external collaborators the engine runs against.
pub struct Collaborators {
    pub sink: Box<dyn CaptureSink>,
    pub probe: Arc<dyn DeviceProbe>,
    pub files: Arc<dyn FileStore>,
    pub store: Arc<dyn SegmentStore>,
    pub call_events: Option<mpsc::Receiver<CallEvent>>,
    pub call_log: Arc<dyn CallLog>,
    pub reservation: Option<DeviceReservation>,
}

pub struct Service {
    pub controller: ControllerHandle,
    pub scheduler: SchedulerControl,
    pub retention: Arc<RetentionEngine>,
    pub health: watch::Receiver<Option<HealthReport>>,
    pub saved_dir: PathBuf,
    settings: watch::Sender<Settings>,
    scheduler_cancel: CancellationToken,
    health_cancel: CancellationToken,
    arbiter_cancel: CancellationToken,
    scheduler_task: JoinHandle<u64>,
    health_task: JoinHandle<()>,
    arbiter_task: JoinHandle<()>,
    controller_task: JoinHandle<()>,
    retention_task: JoinHandle<()>,
    reservation: Option<DeviceReservation>,
}

impl Service {
    /// Start every component and begin ambient capture. A failed first
    /// start is logged and left to the health monitor.
    pub async fn start(options: ServiceOptions, settings: Settings, deps: Collaborators) -> Self {
        let (settings_tx, settings_rx) = watch::channel(settings);
        let (completed_tx, completed_rx) = mpsc::unbounded_channel();

        let (controller, controller_task) =
            CaptureController::spawn(deps.sink, deps.files.clone(), settings_rx.clone(), completed_tx);

        let retention = Arc::new(RetentionEngine::new(
            deps.store,
            deps.files.clone(),
            settings_rx.clone(),
            options.min_free_bytes,
        ));
        let retention_task = tokio::spawn(retention::run_worker(
            retention.clone(),
            completed_rx,
            controller.subscribe(),
            options.cleanup_interval,
        ));

        if let Err(e) = controller.start(SessionKind::Ambient).await {
            warn!("Ambient capture not running yet: {e}");
        }

        let scheduler_cancel = CancellationToken::new();
        let (scheduler, scheduler_task) =
            RotationScheduler::spawn(controller.clone(), settings_rx.clone(), scheduler_cancel.clone());

        let arbiter_cancel = CancellationToken::new();
        let arbiter = InterruptionArbiter::new(controller.clone(), scheduler.clone(), deps.call_log);
        let arbiter_task = tokio::spawn(arbiter.run(deps.call_events, arbiter_cancel.clone()));

        let health_cancel = CancellationToken::new();
        let (monitor, health) = HealthMonitor::new(
            controller.clone(),
            retention.clone(),
            deps.files,
            deps.probe,
            settings_rx,
            options.min_free_bytes,
            options.recent_activity,
        );
        let health_task = tokio::spawn(monitor.run(options.health_interval, health_cancel.clone()));

        info!("Capture service started");
        Self {
            controller,
            scheduler,
            retention,
            health,
            saved_dir: options.saved_dir,
            settings: settings_tx,
            scheduler_cancel,
            health_cancel,
            arbiter_cancel,
            scheduler_task,
            health_task,
            arbiter_task,
            controller_task,
            retention_task,
            reservation: deps.reservation,
        }
    }

    /// Publish new settings. Loops pick them up at their next iteration.
    pub fn update_settings(&self, settings: Settings) {
        self.settings.send_replace(settings);
        info!("Settings updated");
    }

    pub fn settings(&self) -> Settings {
        self.settings.borrow().clone()
    }

    /// Stop rotation, health checks and call handling, close the live
    /// session, let retention register it, then release the device.
    pub async fn shutdown(self) {
        info!("Capture service shutting down");

        self.scheduler_cancel.cancel();
        if let Err(e) = self.scheduler_task.await {
            error!("Rotation scheduler task failed: {e}");
        }

        self.health_cancel.cancel();
        if let Err(e) = self.health_task.await {
            error!("Health monitor task failed: {e}");
        }

        self.arbiter_cancel.cancel();
        if let Err(e) = self.arbiter_task.await {
            error!("Interruption arbiter task failed: {e}");
        }

        self.controller.shutdown().await;
        if let Err(e) = self.controller_task.await {
            error!("Capture controller task failed: {e}");
        }
        drop(self.controller);

        // The worker drains once the controller's completion sender is gone.
        if let Err(e) = self.retention_task.await {
            error!("Retention worker task failed: {e}");
        }

        if let Some(reservation) = self.reservation {
            reservation.release();
        }
        info!("Capture service stopped");
    }
}
