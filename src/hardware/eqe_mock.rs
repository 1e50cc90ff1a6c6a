//! Virtual monochromator, lock-in amplifier, and LED-driver PSU.
//!
//! These three only matter to the EQE measurement/calibration flow and PSU
//! calibration - a small fraction of jobs next to the I-V/MPPT core - so
//! their virtual models are deliberately simple: enough state to make the
//! calibration flows' round trips observable in tests, nothing that claims
//! to model real photodiode or LED-driver physics.

use crate::hardware::capabilities::{LockInAmplifier, Monochromator, Psu};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

/// Virtual monochromator - just remembers the last commanded wavelength.
pub struct VirtualMonochromator {
    wavelength_nm: Mutex<f64>,
}

impl Default for VirtualMonochromator {
    fn default() -> Self {
        Self { wavelength_nm: Mutex::new(400.0) }
    }
}

#[async_trait]
impl Monochromator for VirtualMonochromator {
    async fn set_wavelength(&self, nm: f64) -> Result<()> {
        *self.wavelength_nm.lock().unwrap_or_else(|e| e.into_inner()) = nm;
        Ok(())
    }

    async fn get_wavelength(&self) -> Result<f64> {
        Ok(*self.wavelength_nm.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

/// Virtual lock-in amplifier - reports a constant magnitude/phase regardless
/// of frequency, just enough for a calibration round trip to observe a value.
pub struct VirtualLockIn {
    frequency_hz: Mutex<f64>,
}

impl Default for VirtualLockIn {
    fn default() -> Self {
        Self { frequency_hz: Mutex::new(180.0) }
    }
}

#[async_trait]
impl LockInAmplifier for VirtualLockIn {
    async fn set_frequency(&self, hz: f64) -> Result<()> {
        *self.frequency_hz.lock().unwrap_or_else(|e| e.into_inner()) = hz;
        Ok(())
    }

    async fn read(&self) -> Result<(f64, f64)> {
        Ok((0.1, 0.0))
    }
}

/// Virtual LED-driver PSU - tracks a per-channel `(voltage, ocp)` pair and
/// reports current proportional to the commanded voltage, clamped to OCP.
pub struct VirtualPsu {
    channels: Mutex<HashMap<usize, (f64, f64)>>,
}

impl Default for VirtualPsu {
    fn default() -> Self {
        Self { channels: Mutex::new(HashMap::new()) }
    }
}

#[async_trait]
impl Psu for VirtualPsu {
    async fn set_voltage(&self, channel: usize, volts: f64) -> Result<()> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels.entry(channel).or_insert((0.0, f64::INFINITY)).0 = volts;
        Ok(())
    }

    async fn read_current(&self, channel: usize) -> Result<f64> {
        let channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        let (voltage, ocp) = channels.get(&channel).copied().unwrap_or((0.0, f64::INFINITY));
        Ok((voltage * 0.1).min(ocp))
    }

    async fn set_ocp(&self, channel: usize, amps: f64) -> Result<()> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels.entry(channel).or_insert((0.0, f64::INFINITY)).1 = amps;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn monochromator_round_trips_wavelength() {
        let mono = VirtualMonochromator::default();
        mono.set_wavelength(632.8).await.unwrap();
        assert_eq!(mono.get_wavelength().await.unwrap(), 632.8);
    }

    #[tokio::test]
    async fn psu_current_follows_voltage_until_ocp() {
        let psu = VirtualPsu::default();
        psu.set_ocp(0, 0.5).await.unwrap();
        psu.set_voltage(0, 1.0).await.unwrap();
        assert!((psu.read_current(0).await.unwrap() - 0.1).abs() < 1e-9);
        psu.set_voltage(0, 10.0).await.unwrap();
        assert_eq!(psu.read_current(0).await.unwrap(), 0.5);
    }
}
