//! Commands routed from the bus adapter (C1) into the job dispatcher (C2).
//!
//! Every command that expects a reply carries a `oneshot::Sender` so the bus
//! adapter can await the dispatcher's decision and publish the appropriate
//! ack/status without the dispatcher knowing anything about MQTT.

use crate::action::JobRequest;
use crate::error::AppResult;
use tokio::sync::oneshot;

/// A command handed from the bus adapter to the dispatcher's command loop.
pub enum JobCommand {
    /// Start a new job. Rejected immediately (via the response channel) if
    /// the job slot is already occupied.
    Run {
        /// The parsed, not-yet-validated job request.
        request: JobRequest,
        /// Resolves once the dispatcher has decided to accept or reject the
        /// request - not once the job finishes.
        response: oneshot::Sender<AppResult<()>>,
    },
    /// Signal the active job's cancellation token. A no-op, and always
    /// `Ok(())`, when no job is running.
    Stop {
        /// Resolves once the stop signal has been issued.
        response: oneshot::Sender<AppResult<()>>,
    },
    /// Emergency stop: bypass the job slot and the queue entirely, issuing
    /// the stop command directly to the mux/motion controller.
    Estop {
        /// Resolves once the emergency-stop command has been sent.
        response: oneshot::Sender<AppResult<()>>,
    },
}

impl JobCommand {
    /// Send `result` back over whichever response channel this command
    /// carries, dropping the result silently if the caller already gave up
    /// waiting (e.g. the bus connection dropped).
    pub fn respond(self, result: AppResult<()>) {
        let sender = match self {
            JobCommand::Run { response, .. } => response,
            JobCommand::Stop { response } => response,
            JobCommand::Estop { response } => response,
        };
        let _ = sender.send(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Action;

    #[tokio::test]
    async fn respond_delivers_result_to_caller() {
        let (tx, rx) = oneshot::channel();
        let cmd = JobCommand::Stop { response: tx };
        cmd.respond(Ok(()));
        assert!(rx.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn run_command_carries_request() {
        let (tx, rx) = oneshot::channel();
        let request = JobRequest { action: Action::Run, args: serde_json::json!({}), config: serde_json::json!({}) };
        let cmd = JobCommand::Run { request, response: tx };
        if let JobCommand::Run { request, .. } = &cmd {
            assert_eq!(request.action, Action::Run);
        } else {
            panic!("expected Run variant");
        }
        cmd.respond(Err(crate::error::DaqError::Aborted));
        assert!(rx.await.unwrap().is_err());
    }
}
