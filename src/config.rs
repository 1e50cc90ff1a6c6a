//! Layered configuration for the measurement orchestrator.
//!
//! This module defines [`Settings`], loaded from a TOML file and overridable
//! by environment variables, via the same `config`/`figment`/`serde` stack the
//! teacher used for its generic instrument registry. The schema itself is
//! fixed rather than generic: one section per physical collaborator named in
//! spec §6 (`smu`, `solarsim`, `stage`, `substrates`, `controller`,
//! `monochromator`, `lia`, `psu`, `ccd`), plus the bus connection and the
//! ambient logging/timeout knobs.
//!
//! ## Validation
//!
//! [`Settings::load`] deserializes and then calls [`Settings::validate`],
//! which rejects configs that would only fail once instrument I/O is already
//! underway: empty labels, a substrate grid with a zero axis, an
//! `active_layout` name that isn't in `layouts`, timeouts outside sane bounds.
//! A malformed config is a [`DaqError::Config`] at startup - never partway
//! through a job.

use crate::error::DaqError;
use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment, Provider,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

impl Provider for Settings {
    fn metadata(&self) -> figment::Metadata {
        figment::Metadata::named("solarsim_daq defaults")
    }

    fn data(&self) -> Result<figment::value::Map<figment::Profile, figment::value::Dict>, figment::Error> {
        Serialized::defaults(Settings::default()).data()
    }
}

/// Top-level configuration, one section per external collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Logging verbosity, passed to `tracing_subscriber`'s env filter as a fallback.
    pub log_level: String,
    /// Message-bus connection.
    pub bus: BusConfig,
    /// Source-measure unit.
    pub smu: SmuConfig,
    /// Solar simulator / light engine.
    pub solarsim: SolarSimConfig,
    /// Motion stage.
    pub stage: StageConfig,
    /// Substrate grid and pixel layouts.
    pub substrates: SubstratesConfig,
    /// Mux/stage controller PCB.
    pub controller: ControllerConfig,
    /// Monochromator, used only by EQE flows.
    pub monochromator: MonochromatorConfig,
    /// Lock-in amplifier, used only by EQE flows.
    pub lia: LiaConfig,
    /// LED-driver PSU, used only by PSU calibration.
    pub psu: PsuConfig,
    /// EQE reference photodiode transimpedance amplifier / CCD.
    pub ccd: CcdConfig,
    /// Timeouts for blocking instrument I/O.
    pub timeouts: TimeoutSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            bus: BusConfig::default(),
            smu: SmuConfig::default(),
            solarsim: SolarSimConfig::default(),
            stage: StageConfig::default(),
            substrates: SubstratesConfig::default(),
            controller: ControllerConfig::default(),
            monochromator: MonochromatorConfig::default(),
            lia: LiaConfig::default(),
            psu: PsuConfig::default(),
            ccd: CcdConfig::default(),
            timeouts: TimeoutSettings::default(),
        }
    }
}

/// MQTT broker connection (§4.1/§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Broker host.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Client ID used on the `measurement/#` subscription.
    pub client_id: String,
    /// Keep-alive interval, seconds.
    pub keep_alive_secs: u64,
    /// Bound on the outbound publish queue (§4.1: producers enqueue, never block).
    pub publish_queue_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "solarsim-daq".to_string(),
            keep_alive_secs: 30,
            publish_queue_capacity: 2048,
        }
    }
}

/// Source-measure unit connection and fixed safety ceiling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmuConfig {
    /// Instrument address (serial device path or `host:port`).
    pub address: String,
    /// Line terminator the driver expects on responses.
    pub terminator: String,
    /// Baud rate, only meaningful for a serial address.
    pub baud: u32,
    /// Use the front-panel terminals instead of the rear ones.
    pub front_terminals: bool,
    /// Default two/four-wire sensing.
    pub two_wire: bool,
    /// `absolute_current_limit` from §3/§4.6 - every computed compliance and
    /// every MPPT setpoint is hard-clamped to this value, amps.
    pub current_limit: f64,
    /// Use [`crate::hardware::mock::VirtualSmu`] instead of a real driver.
    pub r#virtual: bool,
}

impl Default for SmuConfig {
    fn default() -> Self {
        Self {
            address: "TCPIP::192.168.1.20::INSTR".to_string(),
            terminator: "\n".to_string(),
            baud: 57_600,
            front_terminals: true,
            two_wire: true,
            current_limit: 0.5,
            r#virtual: true,
        }
    }
}

/// Solar simulator / light engine connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SolarSimConfig {
    /// Instrument address.
    pub address: String,
    /// Use [`crate::hardware::mock::VirtualLightEngine`] instead of a real driver.
    pub r#virtual: bool,
    /// Blank the light source during stage motion (§4.5's `Selected` state).
    pub off_during_motion: bool,
}

impl Default for SolarSimConfig {
    fn default() -> Self {
        Self { address: "wavelabs://192.168.1.21".to_string(), r#virtual: true, off_during_motion: true }
    }
}

/// Motion stage connection and experiment-specific grid centers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    /// Controller URI (reused from [`ControllerConfig::address`] in most rigs,
    /// kept separate because some rigs split mux and motion across two PCBs).
    pub uri: String,
    /// Use [`crate::hardware::mock::VirtualPcb`] instead of a real driver.
    pub r#virtual: bool,
    /// Per-experiment-kind substrate-grid centers, mm.
    pub experiment_positions: ExperimentPositions,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            uri: "socket://192.168.1.22:23".to_string(),
            r#virtual: true,
            experiment_positions: ExperimentPositions::default(),
        }
    }
}

/// Absolute center, mm, of the substrate grid for each experiment kind (§4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentPositions {
    /// Grid center for I-V/MPPT measurements, mm, one entry per axis.
    pub iv: Vec<f64>,
    /// Grid center for EQE measurements, mm, one entry per axis.
    pub eqe: Vec<f64>,
}

impl Default for ExperimentPositions {
    fn default() -> Self {
        Self { iv: vec![0.0, 0.0], eqe: vec![0.0, 150.0] }
    }
}

/// Substrate grid dimensions and the named pixel layouts available to jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubstratesConfig {
    /// Grid shape, `[rows, cols]`.
    pub number: [usize; 2],
    /// Center-to-center spacing, mm, `[row_spacing, col_spacing]`.
    pub spacing: [f64; 2],
    /// Name of the layout in `layouts` to use when a job doesn't override it.
    pub active_layout: String,
    /// Named pixel layouts, keyed by PCB name.
    pub layouts: HashMap<String, LayoutConfig>,
    /// Substrate labels and system labels, row-major, one entry per substrate.
    /// Opaque passthrough from config to the device queue builder - kept as a
    /// map rather than a fixed struct since rig operators name substrate
    /// adapters (e.g. `"A" -> "adapter_1"`) independently of pixel layout.
    pub adapters: HashMap<String, String>,
    /// Row-major substrate labels, used as both the label and system-label
    /// list when a job falls back to the bitmask queue builder instead of
    /// supplying its own device table. Length must be `rows * cols` when
    /// non-empty.
    pub labels: Vec<String>,
}

impl Default for SubstratesConfig {
    fn default() -> Self {
        let mut layouts = HashMap::new();
        layouts.insert("4pixel".to_string(), LayoutConfig::default_4pixel());
        Self {
            number: [2, 3],
            spacing: [30.0, 30.0],
            active_layout: "4pixel".to_string(),
            layouts,
            adapters: HashMap::new(),
            labels: vec!["A".into(), "B".into(), "C".into(), "D".into(), "E".into(), "F".into()],
        }
    }
}

/// One named PCB pixel layout: per-pixel offsets and areas (§4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayoutConfig {
    /// Name of this layout, as referenced by `active_layout`.
    pub pcb_name: String,
    /// 1-based pixel indices present on this layout.
    pub pixels: Vec<usize>,
    /// Offset from substrate center, mm, one entry per axis, per pixel.
    pub positions: Vec<Vec<f64>>,
    /// Active area, cm^2, per pixel. `-1.0` defers to the job's area override,
    /// `0.0` is skipped silently by the queue builder.
    pub areas: Vec<f64>,
    /// Contact pads per substrate on this PCB.
    pub contact_pads_per_substrate: usize,
}

impl LayoutConfig {
    fn default_4pixel() -> Self {
        Self {
            pcb_name: "4pixel".to_string(),
            pixels: vec![1, 2, 3, 4],
            positions: vec![vec![-5.0, 0.0], vec![5.0, 0.0], vec![-5.0, 10.0], vec![5.0, 10.0]],
            areas: vec![0.1, 0.1, 0.1, 0.1],
            contact_pads_per_substrate: 4,
        }
    }

    /// Convert into the queue builder's [`crate::queue::Layout`].
    pub fn to_queue_layout(&self) -> crate::queue::Layout {
        crate::queue::Layout {
            pcb_name: self.pcb_name.clone(),
            pixels: self.pixels.clone(),
            positions: self.positions.clone(),
            areas: self.areas.clone(),
            contact_pads_per_substrate: self.contact_pads_per_substrate,
        }
    }
}

/// Mux/stage controller PCB connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Socket address, `host:port`.
    pub address: String,
    /// Use [`crate::hardware::mock::VirtualPcb`] instead of a real driver.
    pub r#virtual: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self { address: "192.168.1.22:23".to_string(), r#virtual: true }
    }
}

/// Monochromator connection, used only by the EQE measurement/calibration flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonochromatorConfig {
    /// Instrument address.
    pub address: String,
    /// Use a virtual driver.
    pub r#virtual: bool,
}

impl Default for MonochromatorConfig {
    fn default() -> Self {
        Self { address: "GPIB0::12::INSTR".to_string(), r#virtual: true }
    }
}

/// Lock-in amplifier connection, used only by the EQE flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LiaConfig {
    /// Instrument address.
    pub address: String,
    /// Use a virtual driver.
    pub r#virtual: bool,
}

impl Default for LiaConfig {
    fn default() -> Self {
        Self { address: "GPIB0::8::INSTR".to_string(), r#virtual: true }
    }
}

/// Per-channel voltage/over-current settings for the LED-driver PSU (§4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PsuChannelConfig {
    /// Nominal drive voltage, volts.
    pub voltage: f64,
    /// Over-current protection threshold, amps.
    pub ocp: f64,
}

/// LED-driver PSU connection, used only by PSU calibration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PsuConfig {
    /// Instrument address.
    pub address: String,
    /// Use a virtual driver.
    pub r#virtual: bool,
    /// Per-channel settings, keyed by channel index.
    pub channels: HashMap<usize, PsuChannelConfig>,
}

impl Default for PsuConfig {
    fn default() -> Self {
        let mut channels = HashMap::new();
        channels.insert(0, PsuChannelConfig { voltage: 12.0, ocp: 2.0 });
        Self { address: "192.168.1.23:8000".to_string(), r#virtual: true, channels }
    }
}

/// Reference-photodiode transimpedance/CCD settings used by spectrum calibration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CcdConfig {
    /// Maximum allowed transimpedance output voltage before clipping, volts.
    pub max_voltage: f64,
}

impl Default for CcdConfig {
    fn default() -> Self {
        Self { max_voltage: 5.0 }
    }
}

/// Timeouts governing blocking instrument I/O (§5's suspension points).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    /// Serial/socket read timeout, ms.
    pub io_timeout_ms: u64,
    /// Number of retries a driver attempts before surfacing `InstrumentComms` (§9).
    pub io_retries: u32,
    /// Motion home/goto timeout, ms.
    pub motion_timeout_ms: u64,
    /// Allowed deviation between a homed axis's measured and expected length, mm (§4.4).
    pub motion_length_deviation_mm: f64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            io_timeout_ms: 5_000,
            io_retries: 3,
            motion_timeout_ms: 30_000,
            motion_length_deviation_mm: 0.5,
        }
    }
}

impl TimeoutSettings {
    /// Validate the timeout values fall within sane bounds.
    pub fn validate(&self) -> Result<()> {
        if !(100..=60_000).contains(&self.io_timeout_ms) {
            anyhow::bail!("timeouts.io_timeout_ms = {}ms out of range 100ms-60000ms", self.io_timeout_ms);
        }
        if self.io_retries == 0 || self.io_retries > 10 {
            anyhow::bail!("timeouts.io_retries = {} out of range 1-10", self.io_retries);
        }
        if !(1_000..=300_000).contains(&self.motion_timeout_ms) {
            anyhow::bail!(
                "timeouts.motion_timeout_ms = {}ms out of range 1000ms-300000ms",
                self.motion_timeout_ms
            );
        }
        if !(0.0..=10.0).contains(&self.motion_length_deviation_mm) {
            anyhow::bail!(
                "timeouts.motion_length_deviation_mm = {}mm out of range 0mm-10mm",
                self.motion_length_deviation_mm
            );
        }
        Ok(())
    }
}

impl Settings {
    /// Load configuration from `path` (defaulting to `config/default.toml`),
    /// layered under library defaults and overridden by `DAQ_`-prefixed
    /// environment variables, then validate it.
    pub fn load(path: Option<&str>) -> Result<Self, DaqError> {
        let path = path.unwrap_or("config/default.toml");
        let figment = Figment::from(Settings::default())
            .merge(Toml::file(path))
            .merge(Env::prefixed("DAQ_").split("__"));
        let settings: Settings = figment.extract().map_err(DaqError::ConfigLoad)?;
        settings.validate().map_err(|e| DaqError::Config(format!("{e:#}")))?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        self.timeouts.validate().context("invalid [timeouts] section")?;

        if self.substrates.number[0] == 0 || self.substrates.number[1] == 0 {
            anyhow::bail!("substrates.number must have both axes > 0");
        }
        if !self.substrates.layouts.contains_key(&self.substrates.active_layout) {
            anyhow::bail!(
                "substrates.active_layout {:?} is not present in substrates.layouts",
                self.substrates.active_layout
            );
        }
        let expected_labels = self.substrates.number[0] * self.substrates.number[1];
        if !self.substrates.labels.is_empty() && self.substrates.labels.len() != expected_labels {
            anyhow::bail!(
                "substrates.labels has {} entries, expected {} ({}x{} grid)",
                self.substrates.labels.len(),
                expected_labels,
                self.substrates.number[0],
                self.substrates.number[1]
            );
        }
        for (name, layout) in &self.substrates.layouts {
            if layout.pixels.len() != layout.positions.len() || layout.pixels.len() != layout.areas.len() {
                anyhow::bail!(
                    "layout {name:?}: pixels/positions/areas length mismatch ({}, {}, {})",
                    layout.pixels.len(),
                    layout.positions.len(),
                    layout.areas.len()
                );
            }
        }

        if self.smu.current_limit <= 0.0 {
            anyhow::bail!("smu.current_limit must be positive");
        }

        let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_log_levels.contains(&self.log_level.to_lowercase().as_str()) {
            anyhow::bail!("invalid log_level: {}", self.log_level);
        }

        Ok(())
    }

    /// Resolve the named layout (or [`SubstratesConfig::active_layout`] when
    /// `name` is empty) into a [`crate::queue::Layout`].
    pub fn layout(&self, name: &str) -> Result<crate::queue::Layout, DaqError> {
        let key = if name.is_empty() { &self.substrates.active_layout } else { name };
        self.substrates
            .layouts
            .get(key)
            .map(LayoutConfig::to_queue_layout)
            .ok_or_else(|| DaqError::Config(format!("unknown layout {key:?}")))
    }

    /// Build the substrate grid for one experiment kind.
    pub fn substrate_grid(&self, kind: ExperimentKind) -> crate::queue::SubstrateGrid {
        let center = match kind {
            ExperimentKind::Solarsim => &self.stage.experiment_positions.iv,
            ExperimentKind::Eqe => &self.stage.experiment_positions.eqe,
        };
        crate::queue::SubstrateGrid {
            rows: self.substrates.number[0],
            cols: self.substrates.number[1],
            spacing_mm: self.substrates.spacing,
            center_mm: [center.first().copied().unwrap_or(0.0), center.get(1).copied().unwrap_or(0.0)],
        }
    }
}

/// Which substrate-grid center applies (§4.3: "per experiment kind").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExperimentKind {
    /// I-V/MPPT measurement grid.
    Solarsim,
    /// EQE measurement grid.
    Eqe,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_validate() {
        assert!(Settings::default().validate().is_ok());
    }

    #[test]
    fn unknown_active_layout_fails_validation() {
        let mut settings = Settings::default();
        settings.substrates.active_layout = "missing".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn zero_grid_axis_fails_validation() {
        let mut settings = Settings::default();
        settings.substrates.number = [0, 3];
        assert!(settings.validate().is_err());
    }

    #[test]
    fn layout_length_mismatch_fails_validation() {
        let mut settings = Settings::default();
        settings
            .substrates
            .layouts
            .get_mut("4pixel")
            .unwrap()
            .areas
            .push(0.1);
        assert!(settings.validate().is_err());
    }

    #[test]
    fn negative_current_limit_fails_validation() {
        let mut settings = Settings::default();
        settings.smu.current_limit = -1.0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn toml_overrides_merge_over_defaults() {
        let toml_content = r#"
            log_level = "debug"

            [smu]
            address = "GPIB0::24::INSTR"
            current_limit = 1.0
        "#;
        let figment = Figment::from(Settings::default()).merge(Toml::string(toml_content));
        let settings: Settings = figment.extract().unwrap();
        assert_eq!(settings.log_level, "debug");
        assert_eq!(settings.smu.address, "GPIB0::24::INSTR");
        assert_eq!(settings.smu.current_limit, 1.0);
        // untouched sections keep their defaults
        assert_eq!(settings.solarsim.r#virtual, true);
    }

    #[test]
    fn substrate_grid_uses_experiment_kind_center() {
        let settings = Settings::default();
        let iv_grid = settings.substrate_grid(ExperimentKind::Solarsim);
        let eqe_grid = settings.substrate_grid(ExperimentKind::Eqe);
        assert_eq!(iv_grid.center_mm, [0.0, 0.0]);
        assert_eq!(eqe_grid.center_mm, [0.0, 150.0]);
    }

    #[test]
    fn layout_resolves_by_name_or_falls_back_to_active() {
        let settings = Settings::default();
        let layout = settings.layout("").unwrap();
        assert_eq!(layout.pcb_name, "4pixel");
        assert!(settings.layout("nonexistent").is_err());
    }
}
