//! Interruption arbiter – hands the capture device to phone calls.
//!
//! Telephony state arrives as a stream of [`CallEvent`]s. Going off-hook
//! parks the rotation scheduler and switches the controller to a call
//! session; returning to idle closes the call segment, restarts ambient
//! capture and resumes rotation.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use rewind_common::protocol::{CallState, CallStateRequest};
use rewind_common::segment::{CallDirection, CallInfo};

use crate::controller::ControllerHandle;
use crate::scheduler::SchedulerControl;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    Ringing { number: Option<String> },
    OffHook { number: Option<String> },
    Idle,
}

impl From<CallStateRequest> for CallEvent {
    fn from(req: CallStateRequest) -> Self {
        match req.state {
            CallState::Ringing => Self::Ringing { number: req.number },
            CallState::OffHook => Self::OffHook { number: req.number },
            CallState::Idle => Self::Idle,
        }
    }
}

/// Source of the most recent dialed number, for outgoing calls whose
/// off-hook event carries none.
pub trait CallLog: Send + Sync {
    fn last_outgoing_number(&self) -> Option<String>;
}

/// No call history available.
pub struct NoCallLog;

impl CallLog for NoCallLog {
    fn last_outgoing_number(&self) -> Option<String> {
        None
    }
}

pub struct InterruptionArbiter {
    controller: ControllerHandle,
    scheduler: SchedulerControl,
    call_log: Arc<dyn CallLog>,
    ringing_seen: bool,
    ringing_number: Option<String>,
    active_call: Option<CallInfo>,
}

impl InterruptionArbiter {
    pub fn new(
        controller: ControllerHandle,
        scheduler: SchedulerControl,
        call_log: Arc<dyn CallLog>,
    ) -> Self {
        Self {
            controller,
            scheduler,
            call_log,
            ringing_seen: false,
            ringing_number: None,
            active_call: None,
        }
    }

    /// Consume call events until cancelled. Without a source, call capture
    /// is disabled and ambient recording carries on.
    pub async fn run(mut self, events: Option<mpsc::Receiver<CallEvent>>, cancel: CancellationToken) {
        let Some(mut events) = events else {
            warn!("No call-state source available, call capture disabled");
            return;
        };
        info!("Interruption arbiter started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => {
                        warn!("Call-state source closed, call capture disabled");
                        break;
                    }
                },
            }
        }
        if self.active_call.is_some() {
            // Leave rotation usable for whoever restarts ambient capture.
            self.scheduler.resume();
        }
    }

    pub async fn handle(&mut self, event: CallEvent) {
        match event {
            CallEvent::Ringing { number } => {
                debug!("Phone ringing");
                self.ringing_seen = true;
                if number.is_some() {
                    self.ringing_number = number;
                }
            }
            CallEvent::OffHook { number } => self.call_started(number).await,
            CallEvent::Idle => self.call_ended().await,
        }
    }

    async fn call_started(&mut self, number: Option<String>) {
        if self.active_call.is_some() {
            debug!("Off-hook while already in a call, ignoring");
            return;
        }
        let direction = if self.ringing_seen {
            CallDirection::Incoming
        } else {
            CallDirection::Outgoing
        };
        let mut number = number.or_else(|| self.ringing_number.take());
        if number.is_none() && direction == CallDirection::Outgoing {
            number = self.call_log.last_outgoing_number();
        }
        let call = CallInfo { direction, number };
        info!("{direction} call started, switching to call recording");

        self.scheduler.suspend().await;
        if let Err(e) = self.controller.begin_call(call.clone()).await {
            error!("Failed to start call recording: {e}");
        }
        self.active_call = Some(call);
    }

    async fn call_ended(&mut self) {
        self.ringing_seen = false;
        self.ringing_number = None;
        let Some(call) = self.active_call.take() else {
            debug!("Idle without an active call");
            return;
        };
        match self.controller.end_call().await {
            Some(done) => info!(
                "{} call ended, saved {} ({:.1}s)",
                call.direction,
                done.path.display(),
                done.duration as f64 / 1000.0
            ),
            None => info!("{} call ended, no call segment kept", call.direction),
        }
        self.scheduler.resume();
    }
}
