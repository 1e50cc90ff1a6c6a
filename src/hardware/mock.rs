//! Virtual (software-simulated) instrument drivers.
//!
//! Every capability trait in [`crate::hardware::capabilities`] has a virtual
//! implementation here. These are selected at connect time via each
//! instrument's `virtual` config flag (§4.4/§9) and must honor the same
//! pre/post-conditions as a real driver - they differ only in the measurement
//! values produced. They are also what the test suite runs against, since no
//! physical hardware is available in CI.
//!
//! [`VirtualSmu`] simulates a one-diode solar cell model with zero series
//! resistance and infinite shunt resistance:
//!
//! ```text
//! I(V) = Isc - Isat * (exp(V / Vth) - 1)
//! ```
//!
//! which gives `I(0) = Isc` and `I(Voc) = 0` exactly, so `Isat` is solved from
//! the configured `(Voc, Isc)` pair: `Isat = Isc / (exp(Voc/Vth) - 1)`.

use crate::hardware::capabilities::{LightEngine, Motion, MuxController, Smu};
use crate::types::{Sample, SenseRange};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Instant;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

const BOLTZMANN_EV_PER_KELVIN: f64 = 8.617_333_262e-5;
const ASSUMED_TEMPERATURE_K: f64 = 300.0;
const DEFAULT_IDEALITY: f64 = 1.5;

/// Diode parameters for [`VirtualSmu`]'s simulated device-under-test.
#[derive(Debug, Clone, Copy)]
pub struct DiodeParams {
    /// Open-circuit voltage, volts.
    pub voc: f64,
    /// Short-circuit current, amps.
    pub isc: f64,
    /// Diode ideality factor.
    pub ideality: f64,
}

impl Default for DiodeParams {
    fn default() -> Self {
        Self { voc: 0.62, isc: 0.020, ideality: DEFAULT_IDEALITY }
    }
}

impl DiodeParams {
    fn thermal_voltage(&self) -> f64 {
        self.ideality * BOLTZMANN_EV_PER_KELVIN * ASSUMED_TEMPERATURE_K
    }

    fn saturation_current(&self) -> f64 {
        let vth = self.thermal_voltage();
        self.isc / ((self.voc / vth).exp() - 1.0)
    }

    /// Current produced when sourcing voltage `v`.
    pub fn current_at_voltage(&self, v: f64) -> f64 {
        let vth = self.thermal_voltage();
        let isat = self.saturation_current();
        let exponent = (v / vth).clamp(-50.0, 50.0);
        self.isc - isat * (exponent.exp() - 1.0)
    }

    /// Voltage produced when sourcing current `i` (inverse of
    /// [`Self::current_at_voltage`]).
    pub fn voltage_at_current(&self, i: f64) -> f64 {
        let vth = self.thermal_voltage();
        let isat = self.saturation_current();
        let arg = ((self.isc - i) / isat + 1.0).max(1e-300);
        vth * arg.ln()
    }
}

#[derive(Debug, Clone, Copy)]
struct SourceConfig {
    source_v: bool,
    compliance: f64,
    set_point: f64,
    sense_range: SenseRange,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self { source_v: true, compliance: 0.5, set_point: 0.0, sense_range: SenseRange::Auto }
    }
}

struct VirtualSmuState {
    config: SourceConfig,
    nplc: f64,
    two_wire: bool,
    output_enabled: bool,
}

/// Virtual SMU driving a simulated one-diode cell.
pub struct VirtualSmu {
    diode: DiodeParams,
    state: Mutex<VirtualSmuState>,
}

impl VirtualSmu {
    /// Build a virtual SMU simulating a cell with the given diode parameters.
    pub fn new(diode: DiodeParams) -> Self {
        Self {
            diode,
            state: Mutex::new(VirtualSmuState {
                config: SourceConfig::default(),
                nplc: 1.0,
                two_wire: true,
                output_enabled: false,
            }),
        }
    }

    fn sample_at(&self, t: f64) -> Sample {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let cfg = state.config;
        let (v, i) = if cfg.source_v {
            let mut i = self.diode.current_at_voltage(cfg.set_point);
            if i.abs() > cfg.compliance {
                i = cfg.compliance.copysign(i);
            }
            (cfg.set_point, i)
        } else {
            let mut v = self.diode.voltage_at_current(cfg.set_point);
            if v.abs() > cfg.compliance {
                v = cfg.compliance.copysign(v);
            }
            (v, cfg.set_point)
        };
        Sample::new(v, i, t, 0)
    }

    fn sample_interval(&self) -> Duration {
        let nplc = self.state.lock().unwrap_or_else(|e| e.into_inner()).nplc.max(0.01);
        Duration::from_secs_f64((nplc / 60.0).max(0.001))
    }
}

#[async_trait]
impl Smu for VirtualSmu {
    async fn configure_two_wire(&self, two_wire: bool) -> Result<()> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).two_wire = two_wire;
        Ok(())
    }

    async fn configure_nplc(&self, nplc: f64) -> Result<()> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).nplc = nplc;
        Ok(())
    }

    async fn setup_dc(
        &self,
        source_v: bool,
        compliance: f64,
        set_point: f64,
        sense_range: SenseRange,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.config = SourceConfig { source_v, compliance, set_point, sense_range };
        Ok(())
    }

    async fn setup_sweep(
        &self,
        source_v: bool,
        compliance: f64,
        n_points: usize,
        step_delay_s: f64,
        start: f64,
        end: f64,
        sense_range: SenseRange,
    ) -> Result<Vec<Sample>> {
        if n_points < 2 {
            return Err(anyhow!("sweep requires at least 2 points, got {n_points}"));
        }
        let t0 = Instant::now();
        let mut samples = Vec::with_capacity(n_points);
        for idx in 0..n_points {
            let frac = idx as f64 / (n_points - 1) as f64;
            let set_point = start + frac * (end - start);
            {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                state.config = SourceConfig { source_v, compliance, set_point, sense_range };
            }
            if step_delay_s > 0.0 {
                tokio::time::sleep(Duration::from_secs_f64(step_delay_s)).await;
            }
            samples.push(self.sample_at(t0.elapsed().as_secs_f64()));
        }
        Ok(samples)
    }

    async fn measure(&self, n: usize) -> Result<Vec<Sample>> {
        let t0 = Instant::now();
        let interval = self.sample_interval();
        let mut samples = Vec::with_capacity(n);
        for _ in 0..n {
            samples.push(self.sample_at(t0.elapsed().as_secs_f64()));
            if interval > Duration::ZERO {
                tokio::time::sleep(interval).await;
            }
        }
        Ok(samples)
    }

    async fn measure_until(
        &self,
        t_dwell: f64,
        cancel: &CancellationToken,
        cb: &mut dyn FnMut(Sample),
    ) -> Result<Vec<Sample>> {
        let t0 = Instant::now();
        let interval = self.sample_interval();
        let mut samples = Vec::new();
        loop {
            let elapsed = t0.elapsed().as_secs_f64();
            if elapsed >= t_dwell || cancel.is_cancelled() {
                break;
            }
            let sample = self.sample_at(elapsed);
            cb(sample);
            samples.push(sample);
            if interval > Duration::ZERO {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = cancel.cancelled() => break,
                }
            }
        }
        Ok(samples)
    }

    async fn set_source(&self, value: f64) -> Result<()> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).config.set_point = value;
        Ok(())
    }

    async fn output_enabled(&self, enabled: bool) -> Result<()> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).output_enabled = enabled;
        Ok(())
    }

    async fn contact_check(&self) -> Result<bool> {
        Ok(true)
    }
}

/// Virtual light engine - tracks on/off and intensity state, no real timing cost.
pub struct VirtualLightEngine {
    on: Mutex<bool>,
    intensity_percent: Mutex<f64>,
    recipe: Mutex<String>,
}

impl Default for VirtualLightEngine {
    fn default() -> Self {
        Self {
            on: Mutex::new(false),
            intensity_percent: Mutex::new(100.0),
            recipe: Mutex::new("AM1.5G".to_string()),
        }
    }
}

#[async_trait]
impl LightEngine for VirtualLightEngine {
    async fn on(&self) -> Result<()> {
        *self.on.lock().unwrap_or_else(|e| e.into_inner()) = true;
        Ok(())
    }

    async fn off(&self) -> Result<()> {
        *self.on.lock().unwrap_or_else(|e| e.into_inner()) = false;
        Ok(())
    }

    async fn set_intensity(&self, percent: f64) -> Result<()> {
        *self.intensity_percent.lock().unwrap_or_else(|e| e.into_inner()) = percent;
        Ok(())
    }

    async fn activate_recipe(&self, name: &str) -> Result<()> {
        *self.recipe.lock().unwrap_or_else(|e| e.into_inner()) = name.to_string();
        Ok(())
    }

    async fn get_spectrum(&self) -> Result<Vec<(f64, f64)>> {
        Ok(vec![(400.0, 0.8), (550.0, 1.0), (700.0, 0.7), (1000.0, 0.2)])
    }

    async fn get_temperatures(&self) -> Result<Vec<f64>> {
        Ok(vec![24.8, 25.1])
    }
}

/// Virtual mux/stage controller PCB. Tracks the currently selected pixel and
/// simulated axis positions; every command acknowledges immediately.
pub struct VirtualPcb {
    selected: Mutex<Option<String>>,
    positions: Mutex<Vec<f64>>,
    relay: Mutex<String>,
}

impl VirtualPcb {
    /// Build a virtual controller for a stage with `axis_count` axes, all
    /// starting at 0mm.
    pub fn new(axis_count: usize) -> Self {
        Self {
            selected: Mutex::new(None),
            positions: Mutex::new(vec![0.0; axis_count]),
            relay: Mutex::new("iv".to_string()),
        }
    }
}

#[async_trait]
impl MuxController for VirtualPcb {
    async fn query(&self, cmd: &str) -> Result<String> {
        Ok(format!("ok:{cmd}"))
    }

    async fn select(&self, mux_string: &str) -> Result<()> {
        *self.selected.lock().unwrap_or_else(|e| e.into_inner()) = Some(mux_string.to_string());
        Ok(())
    }

    async fn deselect_all(&self) -> Result<()> {
        *self.selected.lock().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }

    async fn emergency_stop(&self) -> Result<()> {
        *self.selected.lock().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }

    async fn set_experiment_relay(&self, experiment: &str) -> Result<()> {
        *self.relay.lock().unwrap_or_else(|e| e.into_inner()) = experiment.to_string();
        Ok(())
    }
}

#[async_trait]
impl Motion for VirtualPcb {
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn home(&self) -> Result<Vec<f64>> {
        let mut positions = self.positions.lock().unwrap_or_else(|e| e.into_inner());
        for p in positions.iter_mut() {
            *p = 0.0;
        }
        Ok(vec![200.0; positions.len()])
    }

    async fn goto(&self, positions_mm: &[f64]) -> Result<()> {
        let mut positions = self.positions.lock().unwrap_or_else(|e| e.into_inner());
        if positions_mm.len() != positions.len() {
            return Err(anyhow!(
                "axis count mismatch: stage has {} axes, goto gave {}",
                positions.len(),
                positions_mm.len()
            ));
        }
        positions.copy_from_slice(positions_mm);
        Ok(())
    }

    async fn get_position(&self) -> Result<Vec<f64>> {
        Ok(self.positions.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diode_model_reproduces_isc_and_voc() {
        let diode = DiodeParams { voc: 0.62, isc: 0.020, ideality: 1.5 };
        assert!((diode.current_at_voltage(0.0) - 0.020).abs() < 1e-9);
        assert!(diode.current_at_voltage(0.62).abs() < 1e-9);
    }

    #[test]
    fn diode_model_inverse_round_trips() {
        let diode = DiodeParams { voc: 0.62, isc: 0.020, ideality: 1.5 };
        let v = diode.voltage_at_current(0.0);
        assert!((v - 0.62).abs() < 1e-6);
    }

    #[tokio::test]
    async fn sourcing_zero_current_reads_back_voc() {
        let smu = VirtualSmu::new(DiodeParams { voc: 0.62, isc: 0.020, ideality: 1.5 });
        smu.setup_dc(false, 3.0, 0.0, SenseRange::Auto).await.unwrap();
        let samples = smu.measure(1).await.unwrap();
        assert!((samples[0].v - 0.62).abs() < 1e-6);
    }

    #[tokio::test]
    async fn measure_until_honors_cancellation() {
        let smu = VirtualSmu::new(DiodeParams::default());
        smu.setup_dc(true, 0.5, 0.4, SenseRange::Auto).await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut count = 0;
        let samples = smu
            .measure_until(10.0, &cancel, &mut |_| count += 1)
            .await
            .unwrap();
        assert!(samples.is_empty());
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn virtual_pcb_select_and_deselect() {
        let pcb = VirtualPcb::new(2);
        pcb.select("s_A_1").await.unwrap();
        pcb.emergency_stop().await.unwrap();
        // emergency stop clears selection; a second select should still work
        pcb.select("s_A_2").await.unwrap();
    }

    #[tokio::test]
    async fn virtual_motion_rejects_axis_count_mismatch() {
        let pcb = VirtualPcb::new(2);
        assert!(pcb.goto(&[1.0, 2.0, 3.0]).await.is_err());
        assert!(pcb.goto(&[1.0, 2.0]).await.is_ok());
    }
}
