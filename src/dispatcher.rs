//! Job dispatcher (C2).
//!
//! Owns the single-capacity job slot and the long-lived instrument
//! connections built once at startup by [`crate::hardware::Instruments`].
//! Routes every inbound [`JobCommand`] to the right decision:
//!
//! - `run` starts a job worker task if and only if the slot is empty;
//!   otherwise the request is rejected with a WARN log and the caller's
//!   response channel sees an error - the rejection never touches the
//!   instruments.
//! - `stop` signals the active job's [`CancellationToken`]; idempotent when
//!   no job is running.
//! - `estop` issues the emergency-stop command to the mux controller
//!   directly, bypassing the job slot, and also cancels any active job so it
//!   unwinds instead of fighting the estop.

use crate::action::{Action, JobRequest};
use crate::bus::{BusHandle, Status};
use crate::config::Settings;
use crate::error::{AppResult, DaqError};
use crate::hardware::Instruments;
use crate::messages::JobCommand;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

struct ActiveJob {
    cancel: CancellationToken,
    handle: JoinHandle<AppResult<()>>,
    action: Action,
}

/// Owns the job slot and the command loop.
pub struct Dispatcher {
    settings: Arc<Settings>,
    instruments: Instruments,
    bus: BusHandle,
    command_rx: mpsc::Receiver<JobCommand>,
    active: Option<ActiveJob>,
}

impl Dispatcher {
    /// Construct a dispatcher over an already-connected instrument set.
    pub fn new(settings: Arc<Settings>, instruments: Instruments, bus: BusHandle, command_rx: mpsc::Receiver<JobCommand>) -> Self {
        Self { settings, instruments, bus, command_rx, active: None }
    }

    /// Run the command loop until the channel closes (bus adapter shut down).
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                reaped = reap(&mut self.active) => {
                    if let Some((action, result)) = reaped {
                        self.active = None;
                        if let Err(err) = &result {
                            warn!(?action, error = %err, "job exited with error");
                        } else {
                            info!(?action, "job completed");
                        }
                        let _ = self.bus.publish_status(Status::Ready);
                    }
                }
                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle(cmd).await,
                        None => {
                            info!("command channel closed, dispatcher shutting down");
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn handle(&mut self, cmd: JobCommand) {
        match cmd {
            JobCommand::Run { request, response } => {
                let result = self.start_job(request);
                response.respond_or_log(result);
            }
            JobCommand::Stop { response } => {
                if let Some(active) = &self.active {
                    active.cancel.cancel();
                }
                let _ = response.send(Ok(()));
            }
            JobCommand::Estop { response } => {
                let result = self.instruments.mux.emergency_stop().await.map_err(|e| DaqError::InstrumentComms(e.to_string()));
                if let Some(active) = &self.active {
                    active.cancel.cancel();
                }
                let _ = response.send(result);
            }
        }
    }

    fn start_job(&mut self, request: JobRequest) -> AppResult<()> {
        if self.active.is_some() {
            warn!(action = ?request.action, "rejecting job request, slot busy");
            return Err(DaqError::Config("job slot busy".into()));
        }

        let cancel = CancellationToken::new();
        let action = request.action;
        let settings = self.settings.clone();
        let instruments = self.instruments.clone();
        let bus = self.bus.clone();
        let cancel_for_job = cancel.clone();

        let _ = bus.publish_status(Status::Busy);

        let handle = tokio::spawn(async move { crate::pipeline::run_job(request, settings, instruments, bus, cancel_for_job).await });

        self.active = Some(ActiveJob { cancel, handle, action });
        Ok(())
    }
}

/// `respond`, but logs instead of panicking if the receiver already dropped
/// (caller gave up waiting) - never a job-ending condition.
trait RespondOrLog {
    fn respond_or_log(self, result: AppResult<()>);
}

impl RespondOrLog for tokio::sync::oneshot::Sender<AppResult<()>> {
    fn respond_or_log(self, result: AppResult<()>) {
        if self.send(result).is_err() {
            warn!("dropped response: caller no longer listening");
        }
    }
}

/// Await the active job's completion, if any, yielding forever otherwise so
/// the enclosing `select!` never picks this branch when the slot is empty.
async fn reap(active: &mut Option<ActiveJob>) -> Option<(Action, AppResult<()>)> {
    match active {
        Some(job) => {
            let result = (&mut job.handle).await;
            let action = job.action;
            Some((
                action,
                result.unwrap_or_else(|join_err| Err(DaqError::Config(format!("job task panicked: {join_err}")))),
            ))
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::DiodeParams;

    fn test_settings() -> Arc<Settings> {
        Arc::new(Settings::default())
    }

    fn test_instruments() -> Instruments {
        Instruments::all_virtual(2, DiodeParams::default())
    }

    fn test_bus() -> BusHandle {
        let (tx, rx) = mpsc::channel(16);
        // Leak the receiver end for the test's lifetime so publish_status
        // calls inside start_job() don't see DataPublishDropped.
        std::mem::forget(rx);
        BusHandle::for_test(tx)
    }

    #[tokio::test]
    async fn second_run_is_rejected_while_slot_busy() {
        let bus = test_bus();
        let (_cmd_tx, cmd_rx) = mpsc::channel(4);
        let mut dispatcher = Dispatcher::new(test_settings(), test_instruments(), bus, cmd_rx);

        let request = JobRequest {
            action: Action::Home,
            args: serde_json::json!({}),
            config: serde_json::json!({}),
        };
        assert!(dispatcher.start_job(request.clone()).is_ok());
        let err = dispatcher.start_job(request).unwrap_err();
        assert!(matches!(err, DaqError::Config(_)));
    }

    #[tokio::test]
    async fn stop_on_idle_dispatcher_is_idempotent() {
        let bus = test_bus();
        let (_cmd_tx, cmd_rx) = mpsc::channel(4);
        let mut dispatcher = Dispatcher::new(test_settings(), test_instruments(), bus, cmd_rx);
        let (tx1, rx1) = tokio::sync::oneshot::channel();
        dispatcher.handle(JobCommand::Stop { response: tx1 }).await;
        assert!(rx1.await.unwrap().is_ok());
        let (tx2, rx2) = tokio::sync::oneshot::channel();
        dispatcher.handle(JobCommand::Stop { response: tx2 }).await;
        assert!(rx2.await.unwrap().is_ok());
    }
}
