//! EQE inner scan (C5's EQE variant).
//!
//! The orchestrator's scope stops at *driving* a monochromator and lock-in
//! through a scan and handing the resulting spectrum to the bus - the actual
//! wavelength stepping strategy (adaptive step near the band edge, filter
//! wheel changes, grating order switches) is instrument/rig-specific and is
//! expected to be supplied by a downstream crate implementing [`EqeScan`].
//! [`LinearEqeScan`] is the reference implementation used by tests and
//! `--virtual` runs.

use crate::error::DaqError;
use crate::hardware::capabilities::{LockInAmplifier, Monochromator};
use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// One EQE sample: wavelength and the lock-in's magnitude/phase reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EqeSample {
    /// Wavelength, nm.
    pub wavelength_nm: f64,
    /// Lock-in magnitude reading.
    pub magnitude: f64,
    /// Lock-in phase reading, degrees.
    pub phase: f64,
}

/// Configuration for one EQE scan.
#[derive(Debug, Clone)]
pub struct EqeScanConfig {
    /// First wavelength, nm.
    pub start_nm: f64,
    /// Last wavelength, nm.
    pub end_nm: f64,
    /// Number of wavelength points, inclusive of both endpoints.
    pub num_points: usize,
}

/// Pluggable EQE scanning algorithm.
#[async_trait]
pub trait EqeScan: Send + Sync {
    /// Step the monochromator through `config` and sample the lock-in at
    /// each point, honoring `cancel`.
    async fn scan(
        &self,
        config: &EqeScanConfig,
        mono: &dyn Monochromator,
        lia: &dyn LockInAmplifier,
        cancel: &CancellationToken,
    ) -> Result<Vec<EqeSample>, DaqError>;
}

/// Evenly-spaced linear wavelength sweep - the reference scan strategy used
/// by `--virtual` runs and tests. A production rig with band-edge adaptive
/// stepping or grating-order switching is expected to supply its own
/// [`EqeScan`] implementation.
pub struct LinearEqeScan;

#[async_trait]
impl EqeScan for LinearEqeScan {
    async fn scan(
        &self,
        config: &EqeScanConfig,
        mono: &dyn Monochromator,
        lia: &dyn LockInAmplifier,
        cancel: &CancellationToken,
    ) -> Result<Vec<EqeSample>, DaqError> {
        if config.num_points < 2 {
            return Err(DaqError::Config(format!("eqe scan requires at least 2 points, got {}", config.num_points)));
        }
        let mut samples = Vec::with_capacity(config.num_points);
        for idx in 0..config.num_points {
            if cancel.is_cancelled() {
                break;
            }
            let frac = idx as f64 / (config.num_points - 1) as f64;
            let wavelength_nm = config.start_nm + frac * (config.end_nm - config.start_nm);
            mono.set_wavelength(wavelength_nm)
                .await
                .map_err(|e| DaqError::InstrumentComms(e.to_string()))?;
            let (magnitude, phase) = lia.read().await.map_err(|e| DaqError::InstrumentComms(e.to_string()))?;
            samples.push(EqeSample { wavelength_nm, magnitude, phase });
        }
        Ok(samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::eqe_mock::{VirtualLockIn, VirtualMonochromator};

    #[tokio::test]
    async fn linear_scan_covers_the_whole_range() {
        let mono = VirtualMonochromator::default();
        let lia = VirtualLockIn::default();
        let cancel = CancellationToken::new();
        let config = EqeScanConfig { start_nm: 350.0, end_nm: 1100.0, num_points: 4 };
        let samples = LinearEqeScan.scan(&config, &mono, &lia, &cancel).await.unwrap();
        assert_eq!(samples.len(), 4);
        assert_eq!(samples.first().unwrap().wavelength_nm, 350.0);
        assert_eq!(samples.last().unwrap().wavelength_nm, 1100.0);
    }

    #[tokio::test]
    async fn cancellation_stops_the_scan_early() {
        let mono = VirtualMonochromator::default();
        let lia = VirtualLockIn::default();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let config = EqeScanConfig { start_nm: 350.0, end_nm: 1100.0, num_points: 10 };
        let samples = LinearEqeScan.scan(&config, &mono, &lia, &cancel).await.unwrap();
        assert!(samples.is_empty());
    }

    #[tokio::test]
    async fn too_few_points_is_a_config_error() {
        let mono = VirtualMonochromator::default();
        let lia = VirtualLockIn::default();
        let cancel = CancellationToken::new();
        let config = EqeScanConfig { start_nm: 350.0, end_nm: 1100.0, num_points: 1 };
        assert!(matches!(LinearEqeScan.scan(&config, &mono, &lia, &cancel).await, Err(DaqError::Config(_))));
    }
}
