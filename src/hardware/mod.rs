//! Instrument facade: capability traits plus their virtual and real drivers.
//!
//! This module provides a unified interface for controlling the fixed
//! instrument set a solar-cell characterization rig needs: a source-measure
//! unit, a solar simulator / light engine, a mux-and-stage controller PCB,
//! and (for EQE/PSU calibration only) a monochromator, lock-in amplifier,
//! and LED-driver PSU.
//!
//! Every capability is virtualizable - [`mock`] holds the software-simulated
//! drivers selected when a config section sets `virtual = true`, [`pcb`]
//! holds the one real driver shipped in-tree (the controller PCB's ASCII
//! wire protocol). Real SMU/light-engine/monochromator/LIA/PSU drivers are
//! vendor-specific and are expected to be supplied by a downstream crate
//! implementing these same traits - this crate only needs the trait.

pub mod capabilities;
pub mod eqe_mock;
pub mod mock;
pub mod pcb;

pub use capabilities::{LightEngine, LockInAmplifier, Monochromator, Motion, MuxController, Psu, Smu};

use std::sync::Arc;

/// The set of instrument handles a job worker borrows for the duration of a
/// job. Built once at job start by connecting (or virtualizing) every
/// instrument named in the job's config, released on every exit path.
#[derive(Clone)]
pub struct Instruments {
    /// Source-measure unit.
    pub smu: Arc<dyn Smu>,
    /// Solar simulator / light engine.
    pub light: Arc<dyn LightEngine>,
    /// Mux/stage controller PCB (mux selection half).
    pub mux: Arc<dyn MuxController>,
    /// Mux/stage controller PCB (motion half) - usually the same physical
    /// device as `mux`, exposed separately because the capability contracts
    /// are different.
    pub motion: Arc<dyn Motion>,
    /// Monochromator, only present when EQE is configured.
    pub monochromator: Option<Arc<dyn Monochromator>>,
    /// Lock-in amplifier, only present when EQE is configured.
    pub lock_in: Option<Arc<dyn LockInAmplifier>>,
    /// LED-driver PSU, only present when PSU calibration is configured.
    pub psu: Option<Arc<dyn Psu>>,
}

impl Instruments {
    /// Build an all-virtual instrument set, for tests and `--virtual` runs.
    /// The EQE/PSU accessories are left unpopulated - most jobs never touch
    /// them - use [`Self::all_virtual_with_accessories`] when a test needs them.
    pub fn all_virtual(axis_count: usize, diode: mock::DiodeParams) -> Self {
        Self::all_virtual_with_accessories(axis_count, diode, false, false)
    }

    /// Build an all-virtual instrument set, optionally populating the
    /// monochromator/lock-in pair (`eqe`) and the LED-driver PSU (`psu`).
    pub fn all_virtual_with_accessories(axis_count: usize, diode: mock::DiodeParams, eqe: bool, psu: bool) -> Self {
        let pcb = Arc::new(mock::VirtualPcb::new(axis_count));
        Self {
            smu: Arc::new(mock::VirtualSmu::new(diode)),
            light: Arc::new(mock::VirtualLightEngine::default()),
            mux: pcb.clone(),
            motion: pcb,
            monochromator: if eqe { Some(Arc::new(eqe_mock::VirtualMonochromator::default())) } else { None },
            lock_in: if eqe { Some(Arc::new(eqe_mock::VirtualLockIn::default())) } else { None },
            psu: if psu { Some(Arc::new(eqe_mock::VirtualPsu::default())) } else { None },
        }
    }

    /// Release every instrument handle. Real drivers disconnect in their
    /// `Drop` impls; this just drops the `Arc`s, LIFO relative to
    /// construction since the struct fields are dropped in declaration
    /// order (smu last acquired is not guaranteed first out here, but no
    /// driver in this crate depends on drop order between distinct
    /// instruments - only within the PCB's own socket).
    pub fn disconnect_all(self) {
        drop(self);
    }
}
