//! Instrument capability traits.
//!
//! This module defines fine-grained capability traits mirroring the external
//! collaborators named in the orchestrator's scope: a source-measure unit, a
//! light engine, a mux/stage controller PCB, a motion stage, a monochromator,
//! a lock-in amplifier, and an LED-driver PSU. Any compliant driver - real or
//! virtual - satisfies the trait; the facade only ever holds `Arc<dyn Trait>`.
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses `#[async_trait]`)
//! - Is thread-safe (requires `Send + Sync`)
//! - Uses `anyhow::Result` for errors
//! - Focuses on one instrument's role in the measurement pipeline
//!
//! Virtualization is a construction-time choice (`virtual` config flag
//! selects a mock vs. a real driver), not a capability - both sides of that
//! choice implement the same trait and must satisfy the same pre/post
//! conditions, differing only in the numeric values they produce.

use crate::types::{Sample, SenseRange};
use anyhow::Result;
use async_trait::async_trait;

/// Capability: source-measure unit.
///
/// All methods must remain safe to call while a cancellation token is
/// pending; [`Smu::measure_until`] is the one method that must poll the
/// token itself, since it is the long-running suspension point named in the
/// concurrency model.
#[async_trait]
pub trait Smu: Send + Sync {
    /// Select two-wire vs. four-wire sensing.
    async fn configure_two_wire(&self, two_wire: bool) -> Result<()>;

    /// Set the number of power-line cycles to integrate per sample.
    async fn configure_nplc(&self, nplc: f64) -> Result<()>;

    /// Configure a constant-output (DC) measurement.
    ///
    /// `source_v` selects voltage-source mode (true) or current-source mode
    /// (false). `set_point` is the source value in the corresponding unit.
    #[allow(clippy::too_many_arguments)]
    async fn setup_dc(
        &self,
        source_v: bool,
        compliance: f64,
        set_point: f64,
        sense_range: SenseRange,
    ) -> Result<()>;

    /// Configure a linear sweep.
    #[allow(clippy::too_many_arguments)]
    async fn setup_sweep(
        &self,
        source_v: bool,
        compliance: f64,
        n_points: usize,
        step_delay_s: f64,
        start: f64,
        end: f64,
        sense_range: SenseRange,
    ) -> Result<Vec<Sample>>;

    /// Take exactly `n` samples at the current configuration.
    async fn measure(&self, n: usize) -> Result<Vec<Sample>>;

    /// Take samples for `t_dwell` seconds, invoking `cb` after each sample.
    ///
    /// Must poll the cancellation token between samples and return whatever
    /// was collected so far if it fires - this is the suspension point the
    /// concurrency model requires cancellation to be observed inside.
    async fn measure_until(
        &self,
        t_dwell: f64,
        cancel: &tokio_util::sync::CancellationToken,
        cb: &mut dyn FnMut(Sample),
    ) -> Result<Vec<Sample>>;

    /// Directly update the source setpoint without reconfiguring compliance
    /// or sense range. Used by the MPPT tracker's per-step perturbation.
    async fn set_source(&self, value: f64) -> Result<()>;

    /// Enable or disable the output stage.
    async fn output_enabled(&self, enabled: bool) -> Result<()>;

    /// Quick continuity/contact check. Returns `true` if the currently
    /// selected pixel appears to be making contact. Any resistance threshold
    /// used to decide this is internal to the driver, not part of the
    /// contract.
    async fn contact_check(&self) -> Result<bool>;
}

/// Capability: solar simulator / light engine.
#[async_trait]
pub trait LightEngine: Send + Sync {
    /// Turn illumination on at the currently active recipe/intensity.
    async fn on(&self) -> Result<()>;

    /// Turn illumination off.
    async fn off(&self) -> Result<()>;

    /// Set output intensity as a percentage of the recipe's nominal value.
    async fn set_intensity(&self, percent: f64) -> Result<()>;

    /// Switch to a named spectral recipe.
    async fn activate_recipe(&self, name: &str) -> Result<()>;

    /// Read back the current spectrum as (wavelength_nm, irradiance) pairs.
    async fn get_spectrum(&self) -> Result<Vec<(f64, f64)>>;

    /// Read lamp/module temperatures, degrees C.
    async fn get_temperatures(&self) -> Result<Vec<f64>>;

    /// Cooperative on/off consensus capability. The core orchestrator is a
    /// single tenant and need not use this; multi-tenant light controllers
    /// may require unanimous agreement from all registered voters before a
    /// state change takes effect.
    async fn vote(&self, _want_on: bool) -> Result<bool> {
        Ok(true)
    }
}

/// Capability: mux / stage controller PCB.
///
/// Raw query/response interface; [`Motion`] builds on top of the stage axis
/// commands this trait exposes.
#[async_trait]
pub trait MuxController: Send + Sync {
    /// Send `cmd` and return the response with the prompt sentinel stripped.
    async fn query(&self, cmd: &str) -> Result<String>;

    /// Select exactly the pixel named by `mux_string`, deselecting all
    /// others first if needed. Retries with recovery (reprobe, deselect-all,
    /// retry once) before surfacing an error.
    async fn select(&self, mux_string: &str) -> Result<()>;

    /// Deselect every pixel on every substrate.
    async fn deselect_all(&self) -> Result<()>;

    /// Emergency stop: brake motion and deselect, synchronously, regardless
    /// of what else is in flight. Must not be blocked by a pending select.
    async fn emergency_stop(&self) -> Result<()>;

    /// Switch the experiment relay to route the SMU or the EQE lock-in chain.
    async fn set_experiment_relay(&self, experiment: &str) -> Result<()>;
}

/// Capability: motion stage(s), addressed by axis index.
#[async_trait]
pub trait Motion: Send + Sync {
    /// Establish the connection (idempotent).
    async fn connect(&self) -> Result<()>;

    /// Home every axis, returning the measured length of each axis in mm.
    async fn home(&self) -> Result<Vec<f64>>;

    /// Move every axis to the given absolute position, mm.
    async fn goto(&self, positions_mm: &[f64]) -> Result<()>;

    /// Read current absolute position of every axis, mm.
    async fn get_position(&self) -> Result<Vec<f64>>;
}

/// Capability: monochromator, used only by the EQE calibration/measurement flow.
#[async_trait]
pub trait Monochromator: Send + Sync {
    /// Move to the given wavelength, nm.
    async fn set_wavelength(&self, nm: f64) -> Result<()>;

    /// Read back the current wavelength, nm.
    async fn get_wavelength(&self) -> Result<f64>;
}

/// Capability: lock-in amplifier, used only by the EQE flow.
#[async_trait]
pub trait LockInAmplifier: Send + Sync {
    /// Set the reference/chopper frequency, Hz.
    async fn set_frequency(&self, hz: f64) -> Result<()>;

    /// Read back magnitude and phase.
    async fn read(&self) -> Result<(f64, f64)>;
}

/// Capability: LED-driver power supply, used only by PSU calibration.
#[async_trait]
pub trait Psu: Send + Sync {
    /// Set output voltage for a channel, volts.
    async fn set_voltage(&self, channel: usize, volts: f64) -> Result<()>;

    /// Read back output current for a channel, amps.
    async fn read_current(&self, channel: usize) -> Result<f64>;

    /// Set the over-current protection threshold for a channel, amps.
    async fn set_ocp(&self, channel: usize, amps: f64) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct StubMono {
        wavelength: Mutex<f64>,
    }

    #[async_trait]
    impl Monochromator for StubMono {
        async fn set_wavelength(&self, nm: f64) -> Result<()> {
            *self.wavelength.lock().unwrap() = nm;
            Ok(())
        }

        async fn get_wavelength(&self) -> Result<f64> {
            Ok(*self.wavelength.lock().unwrap())
        }
    }

    #[tokio::test]
    async fn monochromator_round_trips_wavelength() {
        let mono = StubMono { wavelength: Mutex::new(0.0) };
        mono.set_wavelength(550.0).await.unwrap();
        assert_eq!(mono.get_wavelength().await.unwrap(), 550.0);
    }

    struct StubLight;

    #[async_trait]
    impl LightEngine for StubLight {
        async fn on(&self) -> Result<()> {
            Ok(())
        }
        async fn off(&self) -> Result<()> {
            Ok(())
        }
        async fn set_intensity(&self, _percent: f64) -> Result<()> {
            Ok(())
        }
        async fn activate_recipe(&self, _name: &str) -> Result<()> {
            Ok(())
        }
        async fn get_spectrum(&self) -> Result<Vec<(f64, f64)>> {
            Ok(vec![(550.0, 1.0)])
        }
        async fn get_temperatures(&self) -> Result<Vec<f64>> {
            Ok(vec![25.0])
        }
    }

    #[tokio::test]
    async fn light_engine_vote_defaults_to_allow() {
        let light = StubLight;
        assert!(light.vote(true).await.unwrap());
    }
}
