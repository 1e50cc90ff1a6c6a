//! Application entry point.
//!
//! Loads configuration, connects (or virtualizes) the fixed instrument set,
//! starts the MQTT bus adapter (C1), and runs the job dispatcher (C2) until
//! the process receives Ctrl-C or the bus connection is lost.

use anyhow::{Context, Result};
use clap::Parser;
use mimalloc::MiMalloc;
use solarsim_daq::config::Settings;
use solarsim_daq::dispatcher::Dispatcher;
use solarsim_daq::hardware::eqe_mock::{VirtualLockIn, VirtualMonochromator, VirtualPsu};
use solarsim_daq::hardware::mock::{DiodeParams, VirtualLightEngine, VirtualPcb, VirtualSmu};
use solarsim_daq::hardware::pcb::PcbDriver;
use solarsim_daq::hardware::Instruments;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Instrument-control orchestrator for solar-cell characterization rigs.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<String>,
    /// Force every instrument to its virtual (software-simulated) driver,
    /// regardless of each section's own `virtual` flag.
    #[arg(long)]
    r#virtual: bool,
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

/// Fails with a [`DaqError::Config`]-flavored message when `virtual_flag` is
/// false, since this crate ships no real driver for `component` - only the
/// controller PCB ([`PcbDriver`]) is a real driver shipped in-tree. A rig
/// that needs a real SMU/light-engine/monochromator/LIA/PSU is expected to
/// supply its own driver via a downstream crate implementing the matching
/// capability trait and construct [`Instruments`] directly instead of going
/// through this binary.
fn require_virtual(virtual_flag: bool, component: &str) -> Result<()> {
    if virtual_flag {
        Ok(())
    } else {
        anyhow::bail!(
            "{component} is configured with virtual = false, but this binary ships no real {component} driver; \
             supply one from a downstream crate or set virtual = true"
        )
    }
}

async fn build_instruments(settings: &Settings, force_virtual: bool) -> Result<Instruments> {
    let axis_count = settings.stage.experiment_positions.iv.len().max(2);

    let pcb_virtual = force_virtual || settings.stage.r#virtual;
    let (mux, motion): (Arc<dyn solarsim_daq::hardware::MuxController>, Arc<dyn solarsim_daq::hardware::Motion>) = if pcb_virtual {
        let pcb = Arc::new(VirtualPcb::new(axis_count));
        (pcb.clone(), pcb)
    } else {
        let pcb = Arc::new(
            PcbDriver::connect(&settings.stage.uri, axis_count)
                .await
                .with_context(|| format!("connecting to controller PCB at {}", settings.stage.uri))?,
        );
        (pcb.clone(), pcb)
    };

    let smu_virtual = force_virtual || settings.smu.r#virtual;
    require_virtual(smu_virtual, "smu")?;
    let smu = Arc::new(VirtualSmu::new(DiodeParams::default()));

    let light_virtual = force_virtual || settings.solarsim.r#virtual;
    require_virtual(light_virtual, "solarsim")?;
    let light = Arc::new(VirtualLightEngine::default());

    let mono_virtual = force_virtual || settings.monochromator.r#virtual;
    require_virtual(mono_virtual, "monochromator")?;
    let lia_virtual = force_virtual || settings.lia.r#virtual;
    require_virtual(lia_virtual, "lia")?;
    let psu_virtual = force_virtual || settings.psu.r#virtual;
    require_virtual(psu_virtual, "psu")?;

    Ok(Instruments {
        smu,
        light,
        mux,
        motion,
        monochromator: Some(Arc::new(VirtualMonochromator::default())),
        lock_in: Some(Arc::new(VirtualLockIn::default())),
        psu: Some(Arc::new(VirtualPsu::default())),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref()).context("loading configuration")?;
    init_tracing(&settings.log_level);
    info!(config = ?cli.config, r#virtual = cli.r#virtual, "starting solarsim_daq");

    let instruments = build_instruments(&settings, cli.r#virtual).await.context("connecting instruments")?;
    let settings = Arc::new(settings);

    let (command_tx, command_rx) = mpsc::channel(32);
    let (bus_handle, inbound_handle, publish_handle) = solarsim_daq::bus::start(&settings.bus, command_tx)
        .await
        .context("connecting to message bus")?;

    let dispatcher = Dispatcher::new(settings, instruments, bus_handle, command_rx);

    tokio::select! {
        _ = dispatcher.run() => {
            info!("dispatcher exited, command channel closed");
        }
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                error!(error = %err, "failed to listen for ctrl-c, shutting down anyway");
            } else {
                info!("received ctrl-c, shutting down");
            }
        }
    }

    inbound_handle.abort();
    publish_handle.abort();
    Ok(())
}
