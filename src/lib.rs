//! # solarsim_daq
//!
//! Headless instrument-control orchestrator for solar-cell characterization
//! rigs: a single job-slot dispatcher sits behind an MQTT request/response
//! bus and drives a fixed instrument set (source-measure unit, light engine,
//! mux/stage controller, and the optional EQE/PSU accessories) through the
//! I-V/MPPT measurement pipeline and the calibration flows.
//!
//! ## Crate structure
//!
//! - **`action`**: the job-request envelope, the `Action` enum, and the
//!   `mppt_params` strategy-spec parser.
//! - **`bus`**: the MQTT adapter (C1) - owns the broker connection, turns
//!   inbound publishes into dispatcher commands, and exposes [`bus::BusHandle`]
//!   for outbound publishing.
//! - **`calibration`**: the calibration flows (C8) - EQE, PSU, reference-diode,
//!   spectrum, and RTD.
//! - **`config`**: layered configuration (C1's config half) - see [`config::Settings`].
//! - **`dispatcher`**: the job dispatcher (C2) - owns the job slot.
//! - **`eqe`**: the pluggable EQE wavelength-scan strategy.
//! - **`error`**: the crate-wide [`error::DaqError`] type.
//! - **`handlers`**: stateless data publishers (C7) that wrap samples with
//!   pixel/sweep identity before handing them to the bus.
//! - **`hardware`**: instrument capability traits plus their virtual and real drivers.
//! - **`messages`**: commands routed from the bus into the dispatcher.
//! - **`mppt`**: the maximum-power-point tracker (C6).
//! - **`pipeline`**: the measurement pipeline (C4/C5) - the per-pixel state machine.
//! - **`queue`**: the device queue builder (C3) - bitmask decoding and substrate-grid geometry.
//! - **`types`**: shared data types flowing between the modules above.

pub mod action;
pub mod bus;
pub mod calibration;
pub mod config;
pub mod dispatcher;
pub mod eqe;
pub mod error;
pub mod handlers;
pub mod hardware;
pub mod messages;
pub mod mppt;
pub mod pipeline;
pub mod queue;
pub mod types;
