//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the entire application.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! different kinds of errors that can occur, from configuration issues to instrument
//! and motion faults.
//!
//! ## Error Hierarchy
//!
//! `DaqError` consolidates the error kinds described by the job dispatcher and
//! measurement pipeline:
//!
//! - **`Config`**: Malformed job configuration - label/layout mismatch, unknown MPPT
//!   strategy, unparsable instrument address. Always aborts the job before any
//!   instrument I/O happens.
//! - **`InstrumentComms`**: Timeout, checksum failure, or unexpected response from a
//!   driver. Drivers retry internally (see [`retry`]); this variant is only raised
//!   once retries are exhausted.
//! - **`Motion`**: Stage home failure, length-deviation out of tolerance, or a
//!   goto/keep-out violation. Fatal to the current pixel, never auto-recovered, but
//!   the job continues with the next pixel.
//! - **`SafetyTrip`**: A compliance or quadrant-lock condition was clamped. Logged at
//!   WARN and execution continues - this is not a hard error, it is recorded here so
//!   call sites can use `?` uniformly and the dispatcher can decide whether to log.
//! - **`Aborted`**: The job's cancellation token fired. Unwinding is orderly and no
//!   ERROR-level log should accompany it.
//! - **`Io`**: Wraps `std::io::Error`, covering serial port and socket I/O.
//!
//! By using `#[from]`, `DaqError` can be seamlessly created from underlying error types,
//! simplifying error handling throughout the application with the `?` operator.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Errors produced anywhere in the dispatcher, pipeline, MPPT tracker, or
/// instrument facade.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Malformed job request or configuration - abort the job, log ERROR, status -> Ready.
    #[error("configuration error: {0}")]
    Config(String),

    /// Wraps errors from the `config`/`figment` layered configuration loaders.
    #[error("configuration load error: {0}")]
    ConfigLoad(#[from] config::ConfigError),

    /// I/O error talking to a serial port or socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An instrument driver exhausted its retry budget.
    #[error("instrument communication error: {0}")]
    InstrumentComms(String),

    /// Stage motion failed in a way that is fatal to the current pixel only.
    #[error("motion error: {0}")]
    Motion(String),

    /// Mux select failed. Unlike a generic comms error this is never
    /// retried mid-job - the pipeline cannot trust any subsequent select,
    /// so it stops the remaining queue without treating the job itself as
    /// having errored out (§4.5's failure-semantics table).
    #[error("mux select error: {0}")]
    MuxSelect(String),

    /// A safety interlock clamped a setpoint (compliance trip, quadrant-lock clamp).
    /// Not fatal; carries the clamped value description for logging.
    #[error("safety trip: {0}")]
    SafetyTrip(String),

    /// The job's cancellation token fired. No ERROR log should be emitted for this.
    #[error("job cancelled")]
    Aborted,

    /// MQTT bus error (connection, subscribe, publish).
    #[error("bus error: {0}")]
    Bus(String),

    /// The outbound publish queue was full; a non-data message was dropped.
    #[error("publish queue full, dropped: {0}")]
    DataPublishDropped(String),

    /// Serial support not compiled in.
    #[error("serial support not enabled. Rebuild with --features instrument_serial")]
    SerialFeatureDisabled,
}

impl DaqError {
    /// True for errors that should abort the whole job (vs. just the current pixel).
    pub fn is_job_fatal(&self) -> bool {
        matches!(
            self,
            DaqError::Config(_)
                | DaqError::InstrumentComms(_)
                | DaqError::Bus(_)
                | DaqError::ConfigLoad(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_errors_are_job_fatal() {
        let err = DaqError::Config("label count mismatch".into());
        assert!(err.is_job_fatal());
    }

    #[test]
    fn motion_errors_are_not_job_fatal() {
        let err = DaqError::Motion("length deviation 0.6mm > 0.5mm tolerance".into());
        assert!(!err.is_job_fatal());
    }

    #[test]
    fn aborted_is_not_job_fatal() {
        assert!(!DaqError::Aborted.is_job_fatal());
    }

    #[test]
    fn display_messages_are_human_readable() {
        let err = DaqError::InstrumentComms("SMU timeout after 3 retries".into());
        assert_eq!(
            err.to_string(),
            "instrument communication error: SMU timeout after 3 retries"
        );
    }
}
