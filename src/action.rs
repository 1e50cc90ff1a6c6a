//! Job request envelope, action enum, and the `mppt_params` strategy-spec parser.
//!
//! A request arrives over the bus as `{action, args, config}` (§3). The outer
//! envelope is deserialized eagerly with `serde_json`; `args`/`config` are
//! kept as [`serde_json::Value`] and only deserialized into their concrete
//! per-action struct on demand, so an extra unrecognized key is silently
//! ignored (serde default) while a missing-or-mistyped *required* key surfaces
//! as [`DaqError::Config`] right at the job boundary, before any instrument is
//! touched.

use crate::error::DaqError;
use serde::{Deserialize, Serialize};

/// Top-level job request, as received on `measurement/<action>`.
#[derive(Debug, Clone, Deserialize)]
pub struct JobRequest {
    /// Which operation to perform.
    pub action: Action,
    /// Action-specific arguments, deserialized lazily.
    #[serde(default)]
    pub args: serde_json::Value,
    /// Configuration overrides layered on top of the on-disk config, deserialized lazily.
    #[serde(default)]
    pub config: serde_json::Value,
}

/// The operation named by a job request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Run an I-V/MPPT measurement job.
    Run,
    /// Stop the in-progress job, if any, at its next safe point.
    Stop,
    /// Immediately halt motion and disable every output, bypassing the queue.
    Estop,
    /// EQE calibration sweep.
    CalibrateEqe,
    /// LED-driver PSU voltage-table calibration.
    CalibratePsu,
    /// Reference-diode solar simulator spectral mismatch calibration.
    CalibrateSolarsimDiodes,
    /// Spectroradiometer spectrum calibration.
    CalibrateSpectrum,
    /// RTD resistance-mode temperature-sensor calibration.
    CalibrateRtd,
    /// Quick contact-continuity check on the selected pixel, no measurement.
    ContactCheck,
    /// Home every motion axis.
    Home,
    /// Move the stage to an absolute position.
    Goto,
    /// Read back the current stage position.
    ReadStage,
}

/// Arguments recognized for [`Action::Run`] (and the calibration variants that
/// reuse the I-V-T pipeline).
#[derive(Debug, Clone, Deserialize)]
pub struct RunArgs {
    /// Pre-sweep current-source dwell (`VtDwell`) duration, seconds. `0`
    /// disables the phase. Sources current, measures voltage; publishes
    /// `vt_measurement`.
    #[serde(default)]
    pub i_dwell: f64,
    /// Constant-current setpoint during the `VtDwell` phase, amps. `0` means
    /// "measure Voc instead of sourcing current" - the last sample's voltage
    /// seeds the MPPT tracker's `Voc` before the Mppt phase runs.
    #[serde(default)]
    pub i_dwell_value: f64,
    /// Post-MPPT voltage-source dwell (`ItDwell`) duration, seconds. `0`
    /// disables the phase. Sources voltage, measures current; publishes
    /// `it_measurement`.
    #[serde(default)]
    pub v_dwell: f64,
    /// Constant-voltage setpoint during the `ItDwell` phase, volts.
    #[serde(default)]
    pub v_dwell_value: f64,
    /// MPPT duration, seconds. `0` disables the phase.
    #[serde(default)]
    pub mppt_dwell: f64,
    /// MPPT strategy spec, e.g. `"basic://7:2:30"`. Required when `mppt_dwell > 0`.
    #[serde(default)]
    pub mppt_params: String,
    /// Whether to run an I-V sweep at all.
    #[serde(default)]
    pub sweep_check: bool,
    /// Which lit/dark conditions to sweep under (0-3, see [`crate::types::sweep_conditions`]).
    #[serde(default)]
    pub lit_sweep: u8,
    /// Sweep start voltage, volts.
    #[serde(default)]
    pub sweep_start: f64,
    /// Sweep end voltage, volts.
    #[serde(default)]
    pub sweep_end: f64,
    /// Number of points in the sweep, inclusive of both endpoints.
    pub iv_steps: usize,
    /// Also run the reverse-direction sweep after each forward sweep.
    #[serde(default)]
    pub return_switch: bool,
    /// Integration time, power-line cycles.
    pub nplc: f64,
    /// Per-point source delay, ms. Negative selects instrument auto-delay.
    #[serde(default)]
    pub source_delay: f64,
    /// Current-density ceiling used to derive sweep compliance, mA/cm^2.
    #[serde(default)]
    pub jmax: f64,
    /// Absolute compliance ceiling, amps, regardless of area.
    #[serde(default)]
    pub imax: f64,
    /// Per-pixel area override, cm^2. `None` means "use the layout's own area".
    #[serde(default)]
    pub a_ovr_spin: Option<f64>,
    /// Number of times to repeat the full device queue. `0` means run forever
    /// until stopped.
    #[serde(default = "default_cycles")]
    pub cycles: u64,
    /// Hex bitmask device selection (§4.3's "Selection" input), e.g. `"0xF0"`.
    /// Mutually exclusive with `iv_stuff`/`eqe_stuff`; ignored when either is present.
    #[serde(default)]
    pub selection: String,
    /// Pre-resolved I-V device table, one row per enabled pixel. When
    /// present, takes priority over `selection` and bypasses
    /// [`crate::queue::build`] entirely.
    #[serde(default, rename = "IV_stuff")]
    pub iv_stuff: Option<Vec<DeviceTableRow>>,
    /// Pre-resolved EQE device table, same shape as `iv_stuff`.
    #[serde(default, rename = "EQE_stuff")]
    pub eqe_stuff: Option<Vec<DeviceTableRow>>,
}

fn default_cycles() -> u64 {
    1
}

/// One row of a pre-resolved device-selection table (§6's `IV_stuff`/`EQE_stuff`).
///
/// Carries the same information [`crate::queue::build`] would have derived
/// from a bitmask, already resolved by the caller - used when a client wants
/// to hand the orchestrator an exact pixel list instead of a layout + bitmask.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceTableRow {
    /// Human-readable label, e.g. "A1".
    pub label: String,
    /// Substrate label, e.g. "A".
    pub system_label: String,
    /// Layout name this row was resolved against.
    pub layout: String,
    /// 1-based pixel index within the layout.
    pub mux_index: usize,
    /// Absolute stage position, mm, one entry per axis.
    pub loc: Vec<f64>,
    /// Active area, cm^2.
    pub area: f64,
    /// Opaque mux-controller command string that selects exactly this pixel.
    pub mux_string: String,
}

impl RunArgs {
    /// Resolve this job's device table, preferring `iv_stuff` (or
    /// `eqe_stuff` when `eqe` is true) over the bitmask `selection`. Returns
    /// `None` when neither a table nor a non-empty selection was supplied,
    /// meaning the caller should fall back to [`crate::queue::build`].
    pub fn device_table(&self, eqe: bool) -> Option<&[DeviceTableRow]> {
        let table = if eqe { &self.eqe_stuff } else { &self.iv_stuff };
        table.as_deref()
    }

    /// Parse `mppt_params` into a validated strategy, if MPPT is enabled.
    pub fn mppt_strategy(&self) -> Result<Option<MpptStrategy>, DaqError> {
        if self.mppt_dwell <= 0.0 {
            return Ok(None);
        }
        Ok(Some(MpptStrategy::parse(&self.mppt_params)?))
    }

    /// Compliance current for the sweep phases, per §4.6's formula:
    /// `clamp(5 * jmax * area_cm2 / 1000, 0, imax)` when `imax > 0`, otherwise unclamped.
    pub fn sweep_compliance(&self, area_cm2: f64) -> f64 {
        let raw = 5.0 * self.jmax * area_cm2 / 1000.0;
        if self.imax > 0.0 {
            raw.clamp(0.0, self.imax)
        } else {
            raw.max(0.0)
        }
    }
}

/// Parsed, validated MPPT strategy spec. Parsing happens once at job start,
/// before any instrument I/O, so a malformed spec never costs a partially
/// executed job.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MpptStrategy {
    /// Perturb-and-observe, angle-bounded.
    Basic { d_angle_max: f64, dwell_s: f64, sweep_delay_ms: f64 },
    /// Gradient descent with momentum.
    GradientDescent {
        alpha: f64,
        min_step: f64,
        nplc: f64,
        delay_ms: f64,
        max_step: f64,
        momentum: f64,
        delta0: f64,
        jump_pct: f64,
        jump_period: f64,
        time_scale: f64,
    },
    /// Gradient descent framed by a 15s pre-soak and a 3s post-soak.
    Snaith {
        alpha: f64,
        min_step: f64,
        nplc: f64,
        delay_ms: f64,
        max_step: f64,
        momentum: f64,
        delta0: f64,
        jump_pct: f64,
        jump_period: f64,
        time_scale: f64,
    },
    /// Hold-only: sit at the seeded Vmpp for the whole dwell.
    Spo,
}

impl MpptStrategy {
    /// Parse a `scheme://a:b:c` strategy spec, rejecting anything with the
    /// wrong scheme or the wrong parameter count for that scheme.
    pub fn parse(spec: &str) -> Result<Self, DaqError> {
        let (scheme, rest) = spec
            .split_once("://")
            .ok_or_else(|| DaqError::Config(format!("malformed mppt_params, no scheme: {spec:?}")))?;
        let parts: Vec<&str> = if rest.is_empty() { Vec::new() } else { rest.split(':').collect() };
        let floats = |parts: &[&str]| -> Result<Vec<f64>, DaqError> {
            parts
                .iter()
                .map(|p| p.parse::<f64>().map_err(|_| DaqError::Config(format!("bad numeric field {p:?} in mppt_params {spec:?}"))))
                .collect()
        };

        match scheme {
            "basic" => {
                let f = floats(&parts)?;
                let [d_angle_max, dwell_s, sweep_delay_ms] = arity::<3>(&f, spec)?;
                Ok(MpptStrategy::Basic { d_angle_max, dwell_s, sweep_delay_ms })
            }
            "gd" => {
                let f = floats(&parts)?;
                let [alpha, min_step, nplc, delay_ms, max_step, momentum, delta0, jump_pct, jump_period, time_scale] =
                    arity::<10>(&f, spec)?;
                Ok(MpptStrategy::GradientDescent {
                    alpha,
                    min_step,
                    nplc,
                    delay_ms,
                    max_step,
                    momentum,
                    delta0,
                    jump_pct,
                    jump_period,
                    time_scale,
                })
            }
            "snaith" => {
                let f = floats(&parts)?;
                let [alpha, min_step, nplc, delay_ms, max_step, momentum, delta0, jump_pct, jump_period, time_scale] =
                    arity::<10>(&f, spec)?;
                Ok(MpptStrategy::Snaith {
                    alpha,
                    min_step,
                    nplc,
                    delay_ms,
                    max_step,
                    momentum,
                    delta0,
                    jump_pct,
                    jump_period,
                    time_scale,
                })
            }
            "spo" => {
                if !parts.is_empty() {
                    return Err(DaqError::Config(format!("spo takes no parameters, got {spec:?}")));
                }
                Ok(MpptStrategy::Spo)
            }
            other => Err(DaqError::Config(format!("unknown mppt strategy scheme {other:?}"))),
        }
    }
}

fn arity<const N: usize>(values: &[f64], spec: &str) -> Result<[f64; N], DaqError> {
    <[f64; N]>::try_from(values.to_vec())
        .map_err(|_| DaqError::Config(format!("mppt_params {spec:?} expects {N} fields, got {}", values.len())))
}

/// Arguments for [`Action::Goto`].
#[derive(Debug, Clone, Deserialize)]
pub struct GotoArgs {
    /// Absolute target position, mm, one entry per axis.
    pub positions_mm: Vec<f64>,
}

/// Arguments for [`Action::CalibratePsu`].
#[derive(Debug, Clone, Deserialize)]
pub struct CalibratePsuArgs {
    /// Voltage table to step through, volts, applied to every channel in order.
    pub voltages: Vec<f64>,
    /// Channels to calibrate.
    pub channels: Vec<usize>,
}

/// Arguments for [`Action::CalibrateEqe`].
#[derive(Debug, Clone, Deserialize)]
pub struct EqeCalibrationArgs {
    /// First wavelength, nm.
    pub start_nm: f64,
    /// Last wavelength, nm.
    pub end_nm: f64,
    /// Number of wavelength points, inclusive of both endpoints.
    #[serde(default = "default_eqe_points")]
    pub num_points: usize,
    /// Lock-in reference frequency to set before scanning, Hz. `None` leaves
    /// whatever frequency the lock-in was already set to.
    #[serde(default)]
    pub lock_in_frequency_hz: Option<f64>,
}

fn default_eqe_points() -> usize {
    50
}

/// Arguments shared by the reference-diode and RTD calibration flows: a
/// device selection (bitmask or pre-resolved table, same as [`RunArgs`]) plus
/// an SMU integration time and dwell duration. An empty selection resolves
/// to the synthetic `external` reference-diode queue entry (§4.8).
#[derive(Debug, Clone, Deserialize)]
pub struct CalibrationDwellArgs {
    /// Hex bitmask device selection. Empty ⇒ synthesize the external-reference entry.
    #[serde(default)]
    pub selection: String,
    /// Pre-resolved device table, takes priority over `selection`.
    #[serde(default, rename = "IV_stuff")]
    pub iv_stuff: Option<Vec<DeviceTableRow>>,
    /// Per-pixel area override, cm^2.
    #[serde(default)]
    pub a_ovr_spin: Option<f64>,
    /// SMU integration time, power-line cycles.
    #[serde(default = "default_calibration_nplc")]
    pub nplc: f64,
    /// Dwell duration per pixel, seconds.
    #[serde(default = "default_calibration_dwell")]
    pub dwell_s: f64,
}

fn default_calibration_nplc() -> f64 {
    1.0
}

fn default_calibration_dwell() -> f64 {
    1.0
}

impl CalibrationDwellArgs {
    /// Resolve this job's device table, same precedence rule as [`RunArgs::device_table`].
    pub fn device_table(&self) -> Option<&[DeviceTableRow]> {
        self.iv_stuff.as_deref()
    }
}
