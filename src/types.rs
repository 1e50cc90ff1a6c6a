//! Shared data types that flow between the device queue builder, the instrument
//! facade, the measurement pipeline, and the MPPT tracker.
//!
//! Kept in one module because `PixelDescriptor` and `Sample` are produced and
//! consumed across almost every other module in the crate - duplicating them
//! per-module would just create conversion boilerplate at every boundary.

use serde::{Deserialize, Serialize};

/// One physical device-under-test, fully resolved to an absolute stage position.
///
/// Produced by [`crate::queue::build`], consumed front-first by the measurement
/// pipeline. Immutable once built - the pipeline never mutates a descriptor, it
/// only reads it.
#[derive(Debug, Clone, PartialEq)]
pub struct PixelDescriptor {
    /// Human-readable label, e.g. "A1".
    pub label: String,
    /// Label of the substrate this pixel belongs to, e.g. "A".
    pub system_label: String,
    /// Name of the active layout this pixel was resolved against.
    pub layout: String,
    /// 1-based pixel index within the layout.
    pub pixel_index: usize,
    /// Absolute stage position in mm, one entry per axis.
    pub position: Vec<f64>,
    /// Active area in square centimeters. Always positive - zero-area pixels
    /// are filtered out during queue construction, never carried forward.
    pub area_cm2: f64,
    /// Opaque mux-controller command string that selects exactly this pixel.
    pub mux_string: String,
}

/// Sense range for an SMU measurement channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenseRange {
    /// Autorange every sample.
    Auto,
    /// Track the source range (used while sourcing current, not voltage).
    Follow,
    /// Fixed range, value is instrument-specific and not modeled here.
    Fixed,
}

/// One SMU measurement sample.
///
/// `r` is populated only when the SMU was in resistance-sense mode (RTD
/// calibration); every other measurement leaves it `None` rather than using a
/// distinct 4-tuple/5-tuple type, so the rest of the pipeline only has to deal
/// with one `Sample` shape.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Terminal voltage, volts.
    pub v: f64,
    /// Terminal current, amps.
    pub i: f64,
    /// Timestamp, seconds since the measurement call started.
    pub t: f64,
    /// Driver status/event code. 0 means nominal.
    pub status: i32,
    /// Resistance, ohms - only present in resistance-sense mode.
    pub r: Option<f64>,
}

impl Sample {
    /// Build a plain (no resistance) sample.
    pub fn new(v: f64, i: f64, t: f64, status: i32) -> Self {
        Self { v, i, t, status, r: None }
    }

    /// Instantaneous power, `v * i`.
    pub fn power(&self) -> f64 {
        self.v * self.i
    }
}

/// Which lit/dark conditions an I-V sweep runs under, keyed by `lit_sweep` (0-3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepCondition {
    /// Light engine off during this sweep.
    Dark,
    /// Light engine on during this sweep.
    Light,
}

/// Resolve the `lit_sweep` arg (0-3) into the ordered list of sweep conditions.
pub fn sweep_conditions(lit_sweep: u8) -> &'static [SweepCondition] {
    use SweepCondition::{Dark, Light};
    match lit_sweep {
        0 => &[Dark, Light],
        1 => &[Light, Dark],
        2 => &[Dark],
        3 => &[Light],
        _ => &[Light],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_conditions_cover_all_four_cases() {
        assert_eq!(sweep_conditions(0), [SweepCondition::Dark, SweepCondition::Light]);
        assert_eq!(sweep_conditions(1), [SweepCondition::Light, SweepCondition::Dark]);
        assert_eq!(sweep_conditions(2), [SweepCondition::Dark]);
        assert_eq!(sweep_conditions(3), [SweepCondition::Light]);
    }

    #[test]
    fn sample_power_is_v_times_i() {
        let s = Sample::new(0.5, 0.02, 1.0, 0);
        assert!((s.power() - 0.01).abs() < 1e-12);
    }
}
