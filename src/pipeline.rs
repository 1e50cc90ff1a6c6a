//! Measurement pipeline (C4).
//!
//! Runs every action a job worker can perform once the dispatcher has handed
//! it a job slot: the I-V/MPPT state machine for [`Action::Run`]
//! (`Selected -> Compliant -> {VtDwell? -> Sweep* -> Mppt? -> ItDwell?} ->
//! Finalized`, §4.5), plus the simpler one-shot actions (home, goto, stage
//! readback, contact check) that share the same worker task. Calibration
//! actions delegate to [`crate::calibration`], which reuses this module's
//! device-queue resolution and compliance math.

use crate::action::{Action, DeviceTableRow, GotoArgs, JobRequest, MpptStrategy, RunArgs};
use crate::bus::BusHandle;
use crate::config::{ExperimentKind, Settings};
use crate::error::{AppResult, DaqError};
use crate::handlers::DataHandler;
use crate::hardware::Instruments;
use crate::mppt::Tracker;
use crate::types::{sweep_conditions, PixelDescriptor, SenseRange, SweepCondition};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Fixed voltage compliance for the pre-sweep current-source (`VtDwell`)
/// phase, per §4.5 - independent of the computed current compliance used
/// everywhere else, since this phase sources current rather than voltage.
const VOC_DWELL_COMPLIANCE_V: f64 = 3.0;

/// Entry point spawned by the dispatcher for every accepted job.
pub async fn run_job(
    request: JobRequest,
    settings: Arc<Settings>,
    instruments: Instruments,
    bus: BusHandle,
    cancel: CancellationToken,
) -> AppResult<()> {
    match request.action {
        Action::Run => run_measurement(&request, &settings, &instruments, &bus, &cancel).await,
        Action::Home => run_home(&instruments, &bus).await,
        Action::Goto => run_goto(&request, &instruments).await,
        Action::ReadStage => run_read_stage(&instruments, &bus).await,
        Action::ContactCheck => run_contact_check(&request, &settings, &instruments).await,
        Action::CalibrateEqe => crate::calibration::calibrate_eqe(&request, &settings, &instruments, &bus, &cancel).await,
        Action::CalibratePsu => crate::calibration::calibrate_psu(&request, &instruments, &bus).await,
        Action::CalibrateSolarsimDiodes => crate::calibration::calibrate_solarsim_diodes(&request, &settings, &instruments, &bus, &cancel).await,
        Action::CalibrateSpectrum => crate::calibration::calibrate_spectrum(&instruments, &bus).await,
        Action::CalibrateRtd => crate::calibration::calibrate_rtd(&request, &settings, &instruments, &bus, &cancel).await,
        Action::Stop | Action::Estop => {
            Err(DaqError::Config("stop/estop are handled by the dispatcher, never reach the pipeline".into()))
        }
    }
}

async fn run_home(instruments: &Instruments, bus: &BusHandle) -> AppResult<()> {
    let lengths = instruments.motion.home().await.map_err(|e| DaqError::Motion(e.to_string()))?;
    bus.publish_json("measurement/home_result", &lengths, false)
}

async fn run_goto(request: &JobRequest, instruments: &Instruments) -> AppResult<()> {
    let args: GotoArgs = serde_json::from_value(request.args.clone())
        .map_err(|e| DaqError::Config(format!("malformed goto args: {e}")))?;
    instruments.motion.goto(&args.positions_mm).await.map_err(|e| DaqError::Motion(e.to_string()))
}

async fn run_read_stage(instruments: &Instruments, bus: &BusHandle) -> AppResult<()> {
    let position = instruments.motion.get_position().await.map_err(|e| DaqError::Motion(e.to_string()))?;
    bus.publish_json("measurement/stage_position", &position, false)
}

async fn run_contact_check(request: &JobRequest, settings: &Settings, instruments: &Instruments) -> AppResult<()> {
    let args: RunArgs = serde_json::from_value(request.args.clone())
        .map_err(|e| DaqError::Config(format!("malformed contact_check args: {e}")))?;
    let queue = resolve_queue(&args, settings, false)?;
    let pixel = queue.first().ok_or_else(|| DaqError::Config("contact_check requires a non-empty selection".into()))?;
    instruments.motion.goto(&pixel.position).await.map_err(|e| DaqError::Motion(e.to_string()))?;
    instruments.mux.select(&pixel.mux_string).await.map_err(|e| DaqError::MuxSelect(e.to_string()))?;
    let ok = instruments.smu.contact_check().await.map_err(comms)?;
    if !ok {
        return Err(DaqError::SafetyTrip(format!("no contact detected on {}", pixel.label)));
    }
    Ok(())
}

async fn run_measurement(
    request: &JobRequest,
    settings: &Settings,
    instruments: &Instruments,
    bus: &BusHandle,
    cancel: &CancellationToken,
) -> AppResult<()> {
    let args: RunArgs = serde_json::from_value(request.args.clone())
        .map_err(|e| DaqError::Config(format!("malformed run args: {e}")))?;
    let mppt_strategy = args.mppt_strategy()?;
    let queue = resolve_queue(&args, settings, false)?;
    if queue.is_empty() {
        return Ok(());
    }

    instruments.mux.set_experiment_relay("iv").await.map_err(comms)?;
    instruments.smu.configure_two_wire(settings.smu.two_wire).await.map_err(comms)?;

    let result = run_cycles(&args, mppt_strategy, settings, instruments, bus, &queue, cancel).await;

    let _ = instruments.light.off().await;
    let _ = instruments.smu.output_enabled(false).await;
    let _ = instruments.mux.deselect_all().await;

    result
}

/// Resolve a job's device queue per §4.3: a pre-resolved device table always
/// wins, an empty bitmask selection means the synthetic external-reference
/// pixel, otherwise decode the bitmask against the active layout.
fn resolve_queue(args: &RunArgs, settings: &Settings, eqe: bool) -> Result<Vec<PixelDescriptor>, DaqError> {
    resolve_queue_generic(&args.selection, args.device_table(eqe), args.a_ovr_spin, settings, eqe)
}

/// Resolve a device queue per §4.3, shared by [`resolve_queue`] (ordinary
/// runs) and the calibration flows in [`crate::calibration`]: a pre-resolved
/// device table always wins, an empty bitmask selection means the synthetic
/// external-reference pixel, otherwise decode the bitmask against the
/// active layout.
pub(crate) fn resolve_queue_generic(
    selection: &str,
    table: Option<&[DeviceTableRow]>,
    area_override_cm2: Option<f64>,
    settings: &Settings,
    eqe: bool,
) -> Result<Vec<PixelDescriptor>, DaqError> {
    if let Some(table) = table {
        return Ok(crate::queue::from_device_table(table));
    }
    if selection.is_empty() {
        return Ok(crate::queue::external_reference_queue());
    }
    let layout = settings.layout("")?;
    let kind = if eqe { ExperimentKind::Eqe } else { ExperimentKind::Solarsim };
    let grid = settings.substrate_grid(kind);
    let labels = &settings.substrates.labels;
    let inputs = crate::queue::QueueInputs {
        grid: &grid,
        layout: &layout,
        labels,
        system_labels: labels,
        selection,
        area_override_cm2,
    };
    crate::queue::build(&inputs)
}

async fn run_cycles(
    args: &RunArgs,
    mppt_strategy: Option<MpptStrategy>,
    settings: &Settings,
    instruments: &Instruments,
    bus: &BusHandle,
    queue: &[PixelDescriptor],
    cancel: &CancellationToken,
) -> AppResult<()> {
    let mut cycle: u64 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(DaqError::Aborted);
        }
        for (idx, pixel) in queue.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(DaqError::Aborted);
            }
            let fraction = if args.cycles == 0 {
                0.0
            } else {
                let denom = (queue.len() as u64 * args.cycles) as f64;
                let numer = (cycle * queue.len() as u64 + idx as u64) as f64;
                (numer / denom).min(1.0)
            };
            let _ = bus.publish_progress(&pixel.label, fraction);

            match run_pixel(args, mppt_strategy, settings, instruments, bus, pixel, cancel).await {
                Ok(()) => {}
                Err(DaqError::MuxSelect(msg)) => {
                    let _ = bus.publish_log("warn", &format!("mux select failed for {}: {msg}; stopping remaining queue", pixel.label));
                    return Ok(());
                }
                Err(DaqError::Motion(msg)) => {
                    let _ = bus.publish_log("warn", &format!("motion failed for {}: {msg}; continuing with next pixel", pixel.label));
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
        cycle += 1;
        if args.cycles != 0 && cycle >= args.cycles {
            break;
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_pixel(
    args: &RunArgs,
    mppt_strategy: Option<MpptStrategy>,
    settings: &Settings,
    instruments: &Instruments,
    bus: &BusHandle,
    pixel: &PixelDescriptor,
    cancel: &CancellationToken,
) -> AppResult<()> {
    if settings.solarsim.off_during_motion {
        instruments.light.off().await.map_err(comms)?;
    }
    instruments.motion.goto(&pixel.position).await.map_err(|e| DaqError::Motion(e.to_string()))?;
    instruments.mux.select(&pixel.mux_string).await.map_err(|e| DaqError::MuxSelect(e.to_string()))?;

    instruments.smu.configure_nplc(args.nplc).await.map_err(comms)?;
    instruments.smu.output_enabled(true).await.map_err(comms)?;

    let compliance = effective_compliance(args, pixel.area_cm2, settings.smu.current_limit);
    let mut tracker = Tracker::new(pixel.area_cm2);
    let source_delay_s = args.source_delay.max(0.0) / 1000.0;

    let result = run_pixel_phases(args, mppt_strategy, instruments, bus, pixel, compliance, &mut tracker, source_delay_s, cancel).await;

    let _ = instruments.smu.output_enabled(false).await;
    result
}

#[allow(clippy::too_many_arguments)]
async fn run_pixel_phases(
    args: &RunArgs,
    mppt_strategy: Option<MpptStrategy>,
    instruments: &Instruments,
    bus: &BusHandle,
    pixel: &PixelDescriptor,
    compliance: f64,
    tracker: &mut Tracker,
    source_delay_s: f64,
    cancel: &CancellationToken,
) -> AppResult<()> {
    instruments.light.on().await.map_err(comms)?;

    if args.i_dwell > 0.0 {
        instruments.smu.setup_dc(false, VOC_DWELL_COMPLIANCE_V, args.i_dwell_value, SenseRange::Auto).await.map_err(comms)?;
        let handler = DataHandler::new(bus.clone(), "vt_measurement", pixel.label.clone(), None);
        let samples = instruments
            .smu
            .measure_until(args.i_dwell, cancel, &mut |s| {
                if let Err(err) = handler.handle(std::slice::from_ref(&s), false) {
                    warn!(pixel = %pixel.label, error = %err, "dropped vt_measurement sample");
                }
            })
            .await
            .map_err(comms)?;
        handler.handle(&[], true)?;
        // i_dwell_value == 0 sources no current at all, i.e. this dwell
        // measured Voc rather than holding a working point.
        if args.i_dwell_value == 0.0 {
            if let Some(last) = samples.last() {
                tracker.seed_voc(last.v);
            }
        }
    }

    if args.sweep_check {
        for condition in sweep_conditions(args.lit_sweep) {
            let sweep_label = match condition {
                SweepCondition::Light => {
                    instruments.light.on().await.map_err(comms)?;
                    "light"
                }
                SweepCondition::Dark => {
                    instruments.light.off().await.map_err(comms)?;
                    "dark"
                }
            };
            let forward = instruments
                .smu
                .setup_sweep(true, compliance, args.iv_steps, source_delay_s, args.sweep_start, args.sweep_end, SenseRange::Auto)
                .await
                .map_err(comms)?;
            let forward_handler = DataHandler::new(bus.clone(), "iv_measurement/1", pixel.label.clone(), Some(sweep_label.to_string()));
            forward_handler.handle(&forward, true)?;
            tracker.register_curve(&forward);

            if args.return_switch {
                let reverse = instruments
                    .smu
                    .setup_sweep(true, compliance, args.iv_steps, source_delay_s, args.sweep_end, args.sweep_start, SenseRange::Auto)
                    .await
                    .map_err(comms)?;
                let reverse_handler = DataHandler::new(bus.clone(), "iv_measurement/2", pixel.label.clone(), Some(sweep_label.to_string()));
                reverse_handler.handle(&reverse, true)?;
                tracker.register_curve(&reverse);
            }
        }
        instruments.light.on().await.map_err(comms)?;
    }

    if let Some(strategy) = mppt_strategy {
        tracker.pre_roll(instruments.smu.as_ref(), compliance, cancel).await?;
        let handler = DataHandler::new(bus.clone(), "mppt_measurement", pixel.label.clone(), None);
        let samples = tracker.track(instruments.smu.as_ref(), strategy, args.mppt_dwell, cancel).await?;
        handler.handle(&samples, true)?;
    }

    if args.v_dwell > 0.0 {
        instruments.smu.setup_dc(true, compliance, args.v_dwell_value, SenseRange::Auto).await.map_err(comms)?;
        let handler = DataHandler::new(bus.clone(), "it_measurement", pixel.label.clone(), None);
        instruments
            .smu
            .measure_until(args.v_dwell, cancel, &mut |s| {
                if let Err(err) = handler.handle(std::slice::from_ref(&s), false) {
                    warn!(pixel = %pixel.label, error = %err, "dropped it_measurement sample");
                }
            })
            .await
            .map_err(comms)?;
        handler.handle(&[], true)?;
    }

    Ok(())
}

/// Sweep/MPPT compliance: §4.6's `5 * jmax * area / 1000` formula, clamped to
/// `imax` when given, then hard-clamped to the SMU's absolute current limit
/// regardless of what the job asked for.
fn effective_compliance(args: &RunArgs, area_cm2: f64, current_limit: f64) -> f64 {
    args.sweep_compliance(area_cm2).min(current_limit.abs())
}

fn comms(e: anyhow::Error) -> DaqError {
    DaqError::InstrumentComms(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::capabilities::MuxController;
    use crate::hardware::mock::DiodeParams;
    use tokio::sync::mpsc;

    fn test_settings() -> Arc<Settings> {
        Arc::new(Settings::default())
    }

    fn test_instruments() -> Instruments {
        Instruments::all_virtual(2, DiodeParams::default())
    }

    fn test_bus() -> BusHandle {
        let (tx, rx) = mpsc::channel(64);
        std::mem::forget(rx);
        BusHandle::for_test(tx)
    }

    fn one_pixel_device_table() -> serde_json::Value {
        serde_json::json!([{
            "label": "A1", "system_label": "A", "layout": "4pixel", "mux_index": 1,
            "loc": [0.0, 0.0], "area": 0.1, "mux_string": "sA1"
        }])
    }

    #[tokio::test]
    async fn home_action_returns_ok() {
        let request = JobRequest { action: Action::Home, args: serde_json::json!({}), config: serde_json::json!({}) };
        assert!(run_job(request, test_settings(), test_instruments(), test_bus(), CancellationToken::new()).await.is_ok());
    }

    #[tokio::test]
    async fn goto_action_moves_every_axis() {
        let instruments = test_instruments();
        let request = JobRequest {
            action: Action::Goto,
            args: serde_json::json!({"positions_mm": [5.0, 10.0]}),
            config: serde_json::json!({}),
        };
        run_job(request, test_settings(), instruments.clone(), test_bus(), CancellationToken::new()).await.unwrap();
        assert_eq!(instruments.motion.get_position().await.unwrap(), vec![5.0, 10.0]);
    }

    #[tokio::test]
    async fn run_action_executes_full_pixel_phases() {
        let args_json = serde_json::json!({
            "i_dwell": 0.02, "i_dwell_value": 0.0,
            "v_dwell": 0.02, "v_dwell_value": 0.0,
            "mppt_dwell": 0.0, "mppt_params": "",
            "sweep_check": true, "lit_sweep": 2,
            "sweep_start": 0.0, "sweep_end": 0.6,
            "iv_steps": 5, "nplc": 0.1,
            "jmax": 40.0, "imax": 0.05, "cycles": 1,
            "IV_stuff": one_pixel_device_table(),
        });
        let request = JobRequest { action: Action::Run, args: args_json, config: serde_json::json!({}) };
        run_job(request, test_settings(), test_instruments(), test_bus(), CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn i_dwell_seeds_ssvoc_before_mppt_runs() {
        // Scenario S2: a virtual SMU reporting the diode's true Voc (0.62V)
        // under a 0A current-source dwell must publish it as `vt_measurement`
        // and hand it to the tracker before any Mppt phase, so MPPT's
        // pre-roll infers Vmpp from the seeded Voc instead of its 1.0V
        // fallback.
        let (tx, mut rx) = mpsc::channel(64);
        let bus = BusHandle::for_test(tx);
        let args_json = serde_json::json!({
            "i_dwell": 0.02, "i_dwell_value": 0.0,
            "mppt_dwell": 0.02, "mppt_params": "spo://",
            "nplc": 1.0, "cycles": 1,
            "IV_stuff": one_pixel_device_table(),
        });
        let request = JobRequest { action: Action::Run, args: args_json, config: serde_json::json!({}) };
        run_job(request, test_settings(), test_instruments(), bus, CancellationToken::new()).await.unwrap();

        let mut vt_payload = None;
        let mut mppt_payload = None;
        while let Ok(msg) = rx.try_recv() {
            if msg.topic == "data/raw/vt_measurement" {
                let payload: serde_json::Value = serde_json::from_slice(&msg.payload).unwrap();
                if !payload["data"].as_array().unwrap().is_empty() {
                    vt_payload = Some(payload);
                }
            } else if msg.topic == "data/raw/mppt_measurement" {
                mppt_payload = Some(serde_json::from_slice::<serde_json::Value>(&msg.payload).unwrap());
            }
        }
        let vt_last_v = vt_payload.unwrap()["data"].as_array().unwrap().last().unwrap()["v"].as_f64().unwrap();
        assert!((vt_last_v - 0.62).abs() < 1e-3, "expected ssvoc ~= 0.62V, got {vt_last_v}");

        let mppt_first_v = mppt_payload.unwrap()["data"].as_array().unwrap().first().unwrap()["v"].as_f64().unwrap();
        assert!((mppt_first_v - 0.7 * 0.62).abs() < 1e-3, "expected mppt to start from Vmpp ~= 0.7*ssvoc, got {mppt_first_v}");
    }

    #[tokio::test]
    async fn return_switch_publishes_forward_and_reverse_under_distinct_kinds() {
        let (tx, mut rx) = mpsc::channel(64);
        let bus = BusHandle::for_test(tx);
        let args_json = serde_json::json!({
            "sweep_check": true, "lit_sweep": 3, "return_switch": true,
            "sweep_start": 0.0, "sweep_end": 1.2, "iv_steps": 13,
            "nplc": 0.1, "cycles": 1,
            "IV_stuff": one_pixel_device_table(),
        });
        let request = JobRequest { action: Action::Run, args: args_json, config: serde_json::json!({}) };
        run_job(request, test_settings(), test_instruments(), bus, CancellationToken::new()).await.unwrap();

        let mut forward = None;
        let mut reverse = None;
        while let Ok(msg) = rx.try_recv() {
            if msg.topic == "data/raw/iv_measurement/1" {
                forward = Some(msg.payload);
            } else if msg.topic == "data/raw/iv_measurement/2" {
                reverse = Some(msg.payload);
            }
        }
        let forward: serde_json::Value = serde_json::from_slice(&forward.expect("forward sweep published")).unwrap();
        let reverse: serde_json::Value = serde_json::from_slice(&reverse.expect("reverse sweep published")).unwrap();
        assert_eq!(forward["data"].as_array().unwrap().len(), 13);
        assert_eq!(reverse["data"].as_array().unwrap().len(), 13);
        let reverse_voltages: Vec<f64> = reverse["data"].as_array().unwrap().iter().map(|s| s["v"].as_f64().unwrap()).collect();
        assert!(reverse_voltages.first().unwrap() > reverse_voltages.last().unwrap(), "reverse sweep should descend in V");
    }

    #[tokio::test]
    async fn run_action_mppt_strategy_tracks_a_point() {
        let args_json = serde_json::json!({
            "iv_steps": 2, "nplc": 1.0, "cycles": 1,
            "mppt_dwell": 0.05, "mppt_params": "spo://",
            "IV_stuff": one_pixel_device_table(),
        });
        let request = JobRequest { action: Action::Run, args: args_json, config: serde_json::json!({}) };
        run_job(request, test_settings(), test_instruments(), test_bus(), CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn cancelled_before_start_aborts() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let args_json = serde_json::json!({"iv_steps": 5, "nplc": 1.0, "cycles": 1, "IV_stuff": one_pixel_device_table()});
        let request = JobRequest { action: Action::Run, args: args_json, config: serde_json::json!({}) };
        let err = run_job(request, test_settings(), test_instruments(), test_bus(), cancel).await.unwrap_err();
        assert!(matches!(err, DaqError::Aborted));
    }

    struct FailingMux;

    #[async_trait::async_trait]
    impl MuxController for FailingMux {
        async fn query(&self, cmd: &str) -> anyhow::Result<String> {
            Ok(format!("ok:{cmd}"))
        }
        async fn select(&self, _mux_string: &str) -> anyhow::Result<()> {
            Err(anyhow::anyhow!("relay stuck"))
        }
        async fn deselect_all(&self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn emergency_stop(&self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn set_experiment_relay(&self, _experiment: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn mux_select_failure_stops_queue_without_job_error() {
        let mut instruments = test_instruments();
        instruments.mux = Arc::new(FailingMux);
        let args_json = serde_json::json!({"iv_steps": 5, "nplc": 1.0, "cycles": 1, "IV_stuff": one_pixel_device_table()});
        let request = JobRequest { action: Action::Run, args: args_json, config: serde_json::json!({}) };
        assert!(run_job(request, test_settings(), instruments, test_bus(), CancellationToken::new()).await.is_ok());
    }

    #[tokio::test]
    async fn contact_check_passes_with_virtual_smu() {
        let args_json = serde_json::json!({"iv_steps": 2, "nplc": 1.0, "IV_stuff": one_pixel_device_table()});
        let request = JobRequest { action: Action::ContactCheck, args: args_json, config: serde_json::json!({}) };
        assert!(run_job(request, test_settings(), test_instruments(), test_bus(), CancellationToken::new()).await.is_ok());
    }

    #[test]
    fn effective_compliance_clamps_to_absolute_current_limit() {
        let args: RunArgs = serde_json::from_value(serde_json::json!({"iv_steps": 2, "nplc": 1.0, "jmax": 1000.0, "imax": 0.0})).unwrap();
        assert_eq!(effective_compliance(&args, 1.0, 0.5), 0.5);
    }

    #[test]
    fn resolve_queue_prefers_device_table_over_selection() {
        let settings = Settings::default();
        let args: RunArgs = serde_json::from_value(serde_json::json!({
            "iv_steps": 2, "nplc": 1.0, "selection": "0xF0", "IV_stuff": one_pixel_device_table(),
        }))
        .unwrap();
        let queue = resolve_queue(&args, &settings, false).unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].label, "A1");
    }

    #[test]
    fn resolve_queue_falls_back_to_external_reference_when_selection_empty() {
        let settings = Settings::default();
        let args: RunArgs = serde_json::from_value(serde_json::json!({"iv_steps": 2, "nplc": 1.0})).unwrap();
        let queue = resolve_queue(&args, &settings, false).unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].label, "external");
    }

    #[test]
    fn resolve_queue_builds_from_bitmask_selection() {
        let settings = Settings::default();
        let args: RunArgs = serde_json::from_value(serde_json::json!({"iv_steps": 2, "nplc": 1.0, "selection": "0xF0"})).unwrap();
        let queue = resolve_queue(&args, &settings, false).unwrap();
        assert!(!queue.is_empty());
    }
}
