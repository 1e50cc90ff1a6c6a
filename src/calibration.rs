//! Calibration flows (C8).
//!
//! Each variant reuses the ordinary pipeline's device-queue resolution and
//! SMU setup, but publishes its result to a retained `calibration/<name>`
//! topic instead of `data/raw/<kind>`, and most of them tolerate an empty
//! selection by measuring against the synthetic `external` reference-diode
//! queue entry (§4.8) rather than requiring a real pixel.

use crate::action::{CalibratePsuArgs, CalibrationDwellArgs, EqeCalibrationArgs, JobRequest};
use crate::bus::BusHandle;
use crate::config::Settings;
use crate::error::{AppResult, DaqError};
use crate::eqe::{EqeScanConfig, LinearEqeScan};
use crate::hardware::Instruments;
use crate::pipeline::resolve_queue_generic;
use crate::types::SenseRange;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

fn comms(e: anyhow::Error) -> DaqError {
    DaqError::InstrumentComms(e.to_string())
}

fn parse_args<T: serde::de::DeserializeOwned>(value: &serde_json::Value, what: &str) -> AppResult<T> {
    serde_json::from_value(value.clone()).map_err(|e| DaqError::Config(format!("malformed {what} args: {e}")))
}

/// EQE spectral-responsivity calibration: scan the monochromator/lock-in
/// pair and publish the resulting spectrum retained, replacing whatever
/// calibration curve is already stored under `calibration/eqe`.
pub async fn calibrate_eqe(
    request: &JobRequest,
    _settings: &Settings,
    instruments: &Instruments,
    bus: &BusHandle,
    cancel: &CancellationToken,
) -> AppResult<()> {
    let args: EqeCalibrationArgs = parse_args(&request.args, "calibrate_eqe")?;
    let mono = instruments
        .monochromator
        .as_ref()
        .ok_or_else(|| DaqError::Config("calibrate_eqe requires a configured monochromator".into()))?;
    let lia = instruments
        .lock_in
        .as_ref()
        .ok_or_else(|| DaqError::Config("calibrate_eqe requires a configured lock-in amplifier".into()))?;

    if let Some(hz) = args.lock_in_frequency_hz {
        lia.set_frequency(hz).await.map_err(comms)?;
    }

    let config = EqeScanConfig { start_nm: args.start_nm, end_nm: args.end_nm, num_points: args.num_points };
    let samples = LinearEqeScan.scan(&config, mono.as_ref(), lia.as_ref(), cancel).await?;
    bus.publish_json("calibration/eqe", &samples, true)
}

#[derive(Serialize)]
struct PsuStep {
    voltage: f64,
    current: f64,
}

/// LED-driver PSU voltage-table calibration: step every requested channel
/// through `voltages` and record the resulting current at each step.
pub async fn calibrate_psu(request: &JobRequest, instruments: &Instruments, bus: &BusHandle) -> AppResult<()> {
    let args: CalibratePsuArgs = parse_args(&request.args, "calibrate_psu")?;
    let psu = instruments
        .psu
        .as_ref()
        .ok_or_else(|| DaqError::Config("calibrate_psu requires a configured PSU".into()))?;

    for &channel in &args.channels {
        let mut steps = Vec::with_capacity(args.voltages.len());
        for &voltage in &args.voltages {
            psu.set_voltage(channel, voltage).await.map_err(comms)?;
            let current = psu.read_current(channel).await.map_err(comms)?;
            steps.push(PsuStep { voltage, current });
        }
        bus.publish_json(format!("calibration/psu/ch{channel}"), &steps, true)?;
    }
    Ok(())
}

#[derive(Serialize)]
struct DiodeReading {
    label: String,
    voc: f64,
    isc: f64,
    spectrum: Vec<(f64, f64)>,
}

/// Reference-diode solar-simulator spectral-mismatch calibration. Measures
/// `Voc` (near-zero current dwell) and `Isc` (0 V dwell) against every queue
/// entry - an empty selection measures against the single synthetic
/// `external` pixel - and attaches the light engine's current spectrum to
/// each reading.
pub async fn calibrate_solarsim_diodes(
    request: &JobRequest,
    settings: &Settings,
    instruments: &Instruments,
    bus: &BusHandle,
    cancel: &CancellationToken,
) -> AppResult<()> {
    let args: CalibrationDwellArgs = parse_args(&request.args, "calibrate_solarsim_diodes")?;
    let queue = resolve_queue_generic(&args.selection, args.device_table(), args.a_ovr_spin, settings, false)?;

    instruments.mux.set_experiment_relay("iv").await.map_err(comms)?;
    instruments.light.on().await.map_err(comms)?;
    instruments.smu.configure_nplc(args.nplc).await.map_err(comms)?;
    instruments.smu.output_enabled(true).await.map_err(comms)?;

    let mut readings = Vec::with_capacity(queue.len());
    for pixel in &queue {
        if cancel.is_cancelled() {
            break;
        }
        if !pixel.position.is_empty() {
            instruments.motion.goto(&pixel.position).await.map_err(|e| DaqError::Motion(e.to_string()))?;
        }
        if pixel.mux_string != "s" {
            instruments.mux.select(&pixel.mux_string).await.map_err(|e| DaqError::MuxSelect(e.to_string()))?;
        }

        instruments.smu.setup_dc(false, 3.0, 0.0, SenseRange::Auto).await.map_err(comms)?;
        let voc_samples = instruments.smu.measure_until(args.dwell_s, cancel, &mut |_| {}).await.map_err(comms)?;
        let voc = voc_samples.last().map(|s| s.v).unwrap_or(0.0);

        instruments.smu.setup_dc(true, 0.5, 0.0, SenseRange::Auto).await.map_err(comms)?;
        let isc_samples = instruments.smu.measure_until(args.dwell_s, cancel, &mut |_| {}).await.map_err(comms)?;
        let isc = isc_samples.last().map(|s| s.i).unwrap_or(0.0);

        let spectrum = instruments.light.get_spectrum().await.map_err(comms)?;
        readings.push(DiodeReading { label: pixel.label.clone(), voc, isc, spectrum });
    }

    instruments.smu.output_enabled(false).await.map_err(comms)?;
    bus.publish_json("calibration/solarsim_diode", &readings, true)
}

#[derive(Serialize)]
struct SpectrumPayload {
    data: Vec<(f64, f64)>,
    timestamp: f64,
}

/// Spectrum calibration (§4.8): bypasses pixel iteration entirely. Turns the
/// light on just long enough to settle, captures one spectrum, then turns it
/// back off and publishes `{data, timestamp}` retained.
pub async fn calibrate_spectrum(instruments: &Instruments, bus: &BusHandle) -> AppResult<()> {
    const SETTLE_S: f64 = 1.0;
    let started = std::time::Instant::now();

    instruments.light.on().await.map_err(comms)?;
    tokio::time::sleep(std::time::Duration::from_secs_f64(SETTLE_S)).await;
    let data = instruments.light.get_spectrum().await.map_err(comms)?;
    instruments.light.off().await.map_err(comms)?;

    bus.publish_json("calibration/spectrum", &SpectrumPayload { data, timestamp: started.elapsed().as_secs_f64() }, true)
}

#[derive(Serialize)]
struct RtdReading {
    label: String,
    resistance_ohm: f64,
    voltage: f64,
    current: f64,
}

/// RTD resistance-mode temperature-sensor calibration. Sources a small
/// constant current and reads back the resulting voltage, deriving
/// resistance as `V / I` - the capability contract has no dedicated
/// resistance-sense mode, so this reuses the ordinary dwell-then-divide path
/// rather than a 4-wire ohmmeter primitive no driver in this crate
/// implements.
pub async fn calibrate_rtd(
    request: &JobRequest,
    settings: &Settings,
    instruments: &Instruments,
    bus: &BusHandle,
    cancel: &CancellationToken,
) -> AppResult<()> {
    const PROBE_CURRENT_A: f64 = 1e-3;

    let args: CalibrationDwellArgs = parse_args(&request.args, "calibrate_rtd")?;
    let queue = resolve_queue_generic(&args.selection, args.device_table(), args.a_ovr_spin, settings, false)?;

    instruments.smu.configure_nplc(args.nplc).await.map_err(comms)?;
    instruments.smu.output_enabled(true).await.map_err(comms)?;

    let mut readings = Vec::with_capacity(queue.len());
    for pixel in &queue {
        if cancel.is_cancelled() {
            break;
        }
        if !pixel.position.is_empty() {
            instruments.motion.goto(&pixel.position).await.map_err(|e| DaqError::Motion(e.to_string()))?;
        }
        if pixel.mux_string != "s" {
            instruments.mux.select(&pixel.mux_string).await.map_err(|e| DaqError::MuxSelect(e.to_string()))?;
        }

        instruments.smu.setup_dc(false, 3.0, PROBE_CURRENT_A, SenseRange::Follow).await.map_err(comms)?;
        let samples = instruments.smu.measure_until(args.dwell_s, cancel, &mut |_| {}).await.map_err(comms)?;
        let Some(last) = samples.last() else { continue };
        let resistance_ohm = if last.i.abs() > 1e-15 { last.v / last.i } else { f64::INFINITY };
        readings.push(RtdReading { label: pixel.label.clone(), resistance_ohm, voltage: last.v, current: last.i });
    }

    instruments.smu.output_enabled(false).await.map_err(comms)?;
    bus.publish_json("calibration/rtd", &readings, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Action;
    use crate::hardware::mock::DiodeParams;
    use tokio::sync::mpsc;

    fn test_instruments(eqe: bool, psu: bool) -> Instruments {
        Instruments::all_virtual_with_accessories(2, DiodeParams::default(), eqe, psu)
    }

    fn request(action: Action, args: serde_json::Value) -> JobRequest {
        JobRequest { action, args, config: serde_json::json!({}) }
    }

    #[tokio::test]
    async fn eqe_calibration_requires_monochromator_and_lia() {
        let instruments = test_instruments(false, false);
        let req = request(Action::CalibrateEqe, serde_json::json!({"start_nm": 400.0, "end_nm": 1000.0, "num_points": 3}));
        let (tx, _rx) = mpsc::channel(8);
        let bus = BusHandle::for_test(tx);
        let err = calibrate_eqe(&req, &Settings::default(), &instruments, &bus, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::Config(_)));
    }

    #[tokio::test]
    async fn eqe_calibration_publishes_with_accessories_present() {
        let instruments = test_instruments(true, false);
        let req = request(Action::CalibrateEqe, serde_json::json!({"start_nm": 400.0, "end_nm": 1000.0, "num_points": 3}));
        let (tx, mut rx) = mpsc::channel(8);
        let bus = BusHandle::for_test(tx);
        calibrate_eqe(&req, &Settings::default(), &instruments, &bus, &CancellationToken::new()).await.unwrap();
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn psu_calibration_requires_psu() {
        let instruments = test_instruments(false, false);
        let req = request(Action::CalibratePsu, serde_json::json!({"voltages": [1.0, 2.0], "channels": [0]}));
        let (tx, _rx) = mpsc::channel(8);
        let bus = BusHandle::for_test(tx);
        let err = calibrate_psu(&req, &instruments, &bus).await.unwrap_err();
        assert!(matches!(err, DaqError::Config(_)));
    }

    #[tokio::test]
    async fn psu_calibration_steps_every_channel() {
        let instruments = test_instruments(false, true);
        let req = request(Action::CalibratePsu, serde_json::json!({"voltages": [1.0, 2.0], "channels": [0]}));
        let (tx, mut rx) = mpsc::channel(8);
        let bus = BusHandle::for_test(tx);
        calibrate_psu(&req, &instruments, &bus).await.unwrap();
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn solarsim_diode_calibration_uses_external_entry_when_selection_empty() {
        let instruments = test_instruments(false, false);
        let req = request(Action::CalibrateSolarsimDiodes, serde_json::json!({"nplc": 0.1, "dwell_s": 0.02}));
        let (tx, mut rx) = mpsc::channel(8);
        let bus = BusHandle::for_test(tx);
        calibrate_solarsim_diodes(&req, &Settings::default(), &instruments, &bus, &CancellationToken::new())
            .await
            .unwrap();
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn spectrum_calibration_publishes_data_and_timestamp() {
        let instruments = test_instruments(false, false);
        let (tx, mut rx) = mpsc::channel(8);
        let bus = BusHandle::for_test(tx);
        calibrate_spectrum(&instruments, &bus).await.unwrap();
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn rtd_calibration_derives_resistance_from_dwell() {
        let instruments = test_instruments(false, false);
        let req = request(Action::CalibrateRtd, serde_json::json!({"nplc": 0.1, "dwell_s": 0.02}));
        let (tx, mut rx) = mpsc::channel(8);
        let bus = BusHandle::for_test(tx);
        calibrate_rtd(&req, &Settings::default(), &instruments, &bus, &CancellationToken::new()).await.unwrap();
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn cancellation_before_start_still_publishes_empty_readings() {
        let instruments = test_instruments(false, false);
        let req = request(Action::CalibrateRtd, serde_json::json!({"nplc": 0.1, "dwell_s": 1.0}));
        let (tx, mut rx) = mpsc::channel(8);
        let bus = BusHandle::for_test(tx);
        let cancel = CancellationToken::new();
        cancel.cancel();
        calibrate_rtd(&req, &Settings::default(), &instruments, &bus, &cancel).await.unwrap();
        assert!(rx.recv().await.is_some());
    }
}
