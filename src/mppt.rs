//! MPPT tracker (C6).
//!
//! A [`Tracker`] is constructed fresh per SMU, reset before each pixel's
//! tracking phase, and driven by the measurement pipeline; it is never
//! shared across concurrent pipelines since the job slot forbids
//! concurrency (§3). It owns the quadrant-lock invariant and its own
//! cancellation polling - every strategy's outer loop checks the token at
//! the top, per §4.6.

use crate::action::MpptStrategy;
use crate::error::DaqError;
use crate::hardware::capabilities::Smu;
use crate::types::{Sample, SenseRange};
use rand::Rng;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

const VOC_COMPLIANCE: f64 = 3.0;
const QUADRANT_EPSILON: f64 = 1e-4;

/// Curve statistics returned by [`Tracker::register_curve`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CurveStats {
    /// Maximum power found on the curve, watts.
    pub pmax: f64,
    /// Voltage at maximum power, volts.
    pub vmpp: f64,
    /// Current at maximum power, amps.
    pub impp: f64,
    /// Open-circuit voltage, if the curve crossed the current axis.
    pub voc: Option<f64>,
    /// Short-circuit current, if the curve crossed the voltage axis.
    pub isc: Option<f64>,
}

/// Holds the tracker's accumulated knowledge of one pixel's curve, reset
/// between pixels.
pub struct Tracker {
    voc: Option<f64>,
    isc: Option<f64>,
    vmpp: Option<f64>,
    impp: Option<f64>,
    best_pmax: Option<f64>,
    quadrant_lock: Option<bool>,
    area_cm2: f64,
}

impl Tracker {
    /// Build a tracker for a pixel with the given active area.
    pub fn new(area_cm2: f64) -> Self {
        Self { voc: None, isc: None, vmpp: None, impp: None, best_pmax: None, quadrant_lock: None, area_cm2 }
    }

    /// Seed `Voc` from an already-measured value (e.g. the pipeline's
    /// `VtDwell` phase at `i_dwell_value == 0`), skipping the pre-roll's own
    /// open-circuit measurement.
    pub fn seed_voc(&mut self, voc: f64) {
        self.voc = Some(voc);
        self.quadrant_lock.get_or_insert(voc >= 0.0);
    }

    /// Clamp a voltage setpoint to respect the quadrant lock (§4.6): once
    /// locked positive, setpoints never cross below `+QUADRANT_EPSILON`, and
    /// symmetrically for a negative lock.
    fn clamp_quadrant(&self, v: f64) -> f64 {
        match self.quadrant_lock {
            Some(true) if v < QUADRANT_EPSILON => QUADRANT_EPSILON,
            Some(false) if v > -QUADRANT_EPSILON => -QUADRANT_EPSILON,
            _ => v,
        }
    }

    /// Register a raw sweep curve, updating `Vmpp`/`Impp` (and `Voc`/`Isc`
    /// when the curve crosses both axes) iff its `Pmax` beats the
    /// previously stored one.
    pub fn register_curve(&mut self, samples: &[Sample]) -> Option<CurveStats> {
        if samples.is_empty() {
            return None;
        }
        let (best_idx, pmax) = samples
            .iter()
            .enumerate()
            .map(|(idx, s)| (idx, -s.v * s.i))
            .fold((0usize, f64::NEG_INFINITY), |acc, cur| if cur.1 > acc.1 { cur } else { acc });

        let voc = zero_crossing(samples, |s| s.i);
        let isc = zero_crossing(samples, |s| s.v);

        let stats = CurveStats { pmax, vmpp: samples[best_idx].v, impp: samples[best_idx].i, voc, isc };

        if self.best_pmax.map(|prev| pmax > prev).unwrap_or(true) {
            self.best_pmax = Some(pmax);
            self.vmpp = Some(stats.vmpp);
            self.impp = Some(stats.impp);
            if let Some(voc) = voc {
                self.voc = Some(voc);
                self.quadrant_lock.get_or_insert(voc >= 0.0);
            }
            if let Some(isc) = isc {
                self.isc = Some(isc);
            }
        }
        Some(stats)
    }

    /// Common pre-roll shared by every strategy (§4.6): measure `Voc` if
    /// unknown, infer `Vmpp`/`Voc` from each other when only one is known,
    /// lock the quadrant, and configure the SMU to source at `Vmpp`.
    pub async fn pre_roll(&mut self, smu: &dyn Smu, i_limit: f64, cancel: &CancellationToken) -> Result<(), DaqError> {
        if self.voc.is_none() && self.vmpp.is_none() {
            smu.setup_dc(false, VOC_COMPLIANCE, 0.0, SenseRange::Auto)
                .await
                .map_err(|e| DaqError::InstrumentComms(e.to_string()))?;
            let mut last = None;
            let samples = smu
                .measure_until(1.0, cancel, &mut |s| last = Some(s))
                .await
                .map_err(|e| DaqError::InstrumentComms(e.to_string()))?;
            let voc = last.or_else(|| samples.last().copied()).map(|s| s.v).unwrap_or(0.0);
            self.voc = Some(voc);
        }

        match (self.voc, self.vmpp) {
            (Some(voc), None) => self.vmpp = Some(0.7 * voc),
            (None, Some(vmpp)) => self.voc = Some(vmpp / 0.7),
            _ => {}
        }

        let voc = self.voc.unwrap_or(0.0);
        self.quadrant_lock.get_or_insert(voc >= 0.0);

        let vmpp = self.clamp_quadrant(self.vmpp.unwrap_or(0.0));
        self.vmpp = Some(vmpp);

        smu.setup_dc(true, i_limit, vmpp, SenseRange::Auto)
            .await
            .map_err(|e| DaqError::InstrumentComms(e.to_string()))?;
        Ok(())
    }

    /// Run `strategy` for `duration_s` seconds (minus any pre/post soak it
    /// defines), returning every sample collected.
    pub async fn track(
        &mut self,
        smu: &dyn Smu,
        strategy: MpptStrategy,
        duration_s: f64,
        cancel: &CancellationToken,
    ) -> Result<Vec<Sample>, DaqError> {
        match strategy {
            MpptStrategy::Basic { d_angle_max, dwell_s, sweep_delay_ms } => {
                self.run_basic(smu, duration_s, d_angle_max, dwell_s, sweep_delay_ms, cancel).await
            }
            MpptStrategy::GradientDescent { .. } => self.run_gradient_descent(smu, duration_s, strategy, cancel).await,
            MpptStrategy::Snaith { .. } => self.run_snaith(smu, duration_s, strategy, cancel).await,
            MpptStrategy::Spo => self.run_spo(smu, duration_s, cancel).await,
        }
    }

    async fn run_spo(&mut self, smu: &dyn Smu, duration_s: f64, cancel: &CancellationToken) -> Result<Vec<Sample>, DaqError> {
        if cancel.is_cancelled() {
            return Ok(Vec::new());
        }
        let samples = smu
            .measure_until(duration_s, cancel, &mut |_| {})
            .await
            .map_err(|e| DaqError::InstrumentComms(e.to_string()))?;
        // spo holds at the seeded Vmpp for the whole dwell rather than
        // searching, so it reports the first sample's (V, I) as the tracked
        // point instead of whatever the hold happened to drift to last.
        if let Some(first) = samples.first() {
            self.vmpp = Some(first.v);
            self.impp = Some(first.i);
        }
        Ok(samples)
    }

    async fn run_basic(
        &mut self,
        smu: &dyn Smu,
        duration_s: f64,
        d_angle_max_deg: f64,
        dwell_s: f64,
        sweep_delay_ms: f64,
        cancel: &CancellationToken,
    ) -> Result<Vec<Sample>, DaqError> {
        let voc = self.voc.unwrap_or(1.0).max(1e-6);
        let isc = self.isc.unwrap_or(0.02).abs().max(1e-9);
        let dv = voc / 301.0;
        let mut log = Vec::new();
        let start = Instant::now();

        let initial_soak = dwell_s.min(0.2 * duration_s).max(0.0);
        let mut vmpp = self.clamp_quadrant(self.vmpp.unwrap_or(0.7 * voc));
        smu.set_source(vmpp).await.map_err(|e| DaqError::InstrumentComms(e.to_string()))?;
        let soak = smu
            .measure_until(initial_soak, cancel, &mut |_| {})
            .await
            .map_err(|e| DaqError::InstrumentComms(e.to_string()))?;
        let mut impp = soak.last().map(|s| s.i).unwrap_or(0.0);
        log.extend(soak);

        while !cancel.is_cancelled() && start.elapsed().as_secs_f64() < duration_s {
            let mpp_angle = angle(vmpp, impp, voc, isc);
            let mut explored = Vec::new();

            for direction in [1.0_f64, -1.0_f64] {
                let mut v = vmpp;
                loop {
                    v = self.clamp_quadrant(v + direction * dv);
                    if v <= 0.0 || v >= voc || cancel.is_cancelled() {
                        break;
                    }
                    smu.set_source(v).await.map_err(|e| DaqError::InstrumentComms(e.to_string()))?;
                    if sweep_delay_ms > 0.0 {
                        tokio::time::sleep(std::time::Duration::from_secs_f64(sweep_delay_ms / 1000.0)).await;
                    }
                    let sample = smu.measure(1).await.map_err(|e| DaqError::InstrumentComms(e.to_string()))?;
                    let Some(sample) = sample.into_iter().next() else { break };
                    let theta = angle(sample.v, sample.i, voc, isc);
                    explored.push(sample);
                    if (theta - mpp_angle).abs() > d_angle_max_deg.to_radians() {
                        break;
                    }
                }
            }

            if let Some(best) = explored.iter().max_by(|a, b| (-a.v * a.i).total_cmp(&(-b.v * b.i))) {
                vmpp = best.v;
                impp = best.i;
            }
            log.extend(explored);

            vmpp = self.clamp_quadrant(vmpp);
            smu.set_source(vmpp).await.map_err(|e| DaqError::InstrumentComms(e.to_string()))?;
            let remaining = (duration_s - start.elapsed().as_secs_f64()).max(0.0);
            let dwell = dwell_s.min(remaining);
            let dwell_samples = smu
                .measure_until(dwell, cancel, &mut |_| {})
                .await
                .map_err(|e| DaqError::InstrumentComms(e.to_string()))?;
            if let Some(last) = dwell_samples.last() {
                impp = last.i;
            }
            log.extend(dwell_samples);
        }

        self.vmpp = Some(vmpp);
        self.impp = Some(impp);
        Ok(log)
    }

    async fn run_gradient_descent(
        &mut self,
        smu: &dyn Smu,
        duration_s: f64,
        strategy: MpptStrategy,
        cancel: &CancellationToken,
    ) -> Result<Vec<Sample>, DaqError> {
        let MpptStrategy::GradientDescent { alpha, min_step, nplc, delay_ms, max_step, momentum, delta0, jump_pct, jump_period, time_scale } =
            strategy
        else {
            unreachable!("run_gradient_descent called with a non-GradientDescent strategy");
        };

        smu.configure_nplc(nplc).await.map_err(|e| DaqError::InstrumentComms(e.to_string()))?;

        let voc = self.voc.unwrap_or(1.0).max(1e-6);
        let mut w = self.clamp_quadrant(self.vmpp.unwrap_or(0.7 * voc));
        let mut delta = delta0;
        let mut jump_sign = 1.0_f64;
        let mut last_jump = Instant::now();
        let mut history: Vec<(f64, f64, f64)> = Vec::new();
        let mut log = Vec::new();
        let start = Instant::now();
        let mut rng = rand::thread_rng();

        while !cancel.is_cancelled() && start.elapsed().as_secs_f64() < duration_s {
            smu.set_source(w).await.map_err(|e| DaqError::InstrumentComms(e.to_string()))?;
            if delay_ms > 0.0 {
                tokio::time::sleep(std::time::Duration::from_secs_f64(delay_ms / 1000.0)).await;
            }
            let sample = smu
                .measure(1)
                .await
                .map_err(|e| DaqError::InstrumentComms(e.to_string()))?
                .into_iter()
                .next()
                .ok_or_else(|| DaqError::InstrumentComms("SMU returned no sample".into()))?;
            let t = start.elapsed().as_secs_f64();
            history.push((sample.v, sample.i, t));
            log.push(sample);
            if history.len() > 2 {
                history.remove(0);
            }

            let grad = if history.len() == 2 {
                let (v0, i0, t0) = history[0];
                let (v1, i1, t1) = history[1];
                if (v1 - v0).abs() < 1e-12 {
                    None
                } else {
                    let f0 = v0 * i0 / self.area_cm2;
                    let f1 = v1 * i1 / self.area_cm2;
                    let mut g = (f1 - f0) / (v1 - v0);
                    if time_scale > 0.0 && (t1 - t0).abs() > 1e-12 {
                        g /= (t1 - t0) * time_scale;
                    }
                    Some(g)
                }
            } else {
                None
            };

            delta = match grad {
                Some(g) => (-alpha * g + momentum * delta).clamp(-max_step, max_step),
                None => {
                    let sign: f64 = if rng.gen_bool(0.5) { 1.0 } else { -1.0 };
                    sign * min_step
                }
            };
            if delta.abs() < min_step && delta != 0.0 {
                delta = delta.signum() * min_step;
            }

            w = self.clamp_quadrant(w + delta);

            if jump_period > 0.0 && last_jump.elapsed().as_secs_f64() >= jump_period {
                w = self.clamp_quadrant(w + jump_sign * (jump_pct / 100.0) * voc);
                jump_sign = -jump_sign;
                last_jump = Instant::now();
            }
        }

        if let Some(last) = log.last() {
            self.vmpp = Some(last.v);
            self.impp = Some(last.i);
        }
        Ok(log)
    }

    async fn run_snaith(
        &mut self,
        smu: &dyn Smu,
        duration_s: f64,
        strategy: MpptStrategy,
        cancel: &CancellationToken,
    ) -> Result<Vec<Sample>, DaqError> {
        const PRE_SOAK_S: f64 = 15.0;
        const POST_SOAK_S: f64 = 3.0;

        let gd_strategy = match strategy {
            MpptStrategy::Snaith { alpha, min_step, nplc, delay_ms, max_step, momentum, delta0, jump_pct, jump_period, time_scale } => {
                MpptStrategy::GradientDescent { alpha, min_step, nplc, delay_ms, max_step, momentum, delta0, jump_pct, jump_period, time_scale }
            }
            _ => unreachable!("run_snaith called with a non-Snaith strategy"),
        };

        let mut log = Vec::new();
        let vmpp = self.clamp_quadrant(self.vmpp.unwrap_or(0.0));
        smu.set_source(vmpp).await.map_err(|e| DaqError::InstrumentComms(e.to_string()))?;
        let pre_soak = smu
            .measure_until(PRE_SOAK_S.min(duration_s), cancel, &mut |_| {})
            .await
            .map_err(|e| DaqError::InstrumentComms(e.to_string()))?;
        log.extend(pre_soak);

        let inner_duration = (duration_s - PRE_SOAK_S - POST_SOAK_S).max(0.0);
        log.extend(self.run_gradient_descent(smu, inner_duration, gd_strategy, cancel).await?);

        let post_vmpp = self.vmpp.unwrap_or(vmpp);
        smu.set_source(post_vmpp).await.map_err(|e| DaqError::InstrumentComms(e.to_string()))?;
        let post_soak = smu
            .measure_until(POST_SOAK_S, cancel, &mut |_| {})
            .await
            .map_err(|e| DaqError::InstrumentComms(e.to_string()))?;
        log.extend(post_soak);

        Ok(log)
    }
}

fn angle(v: f64, i: f64, voc: f64, isc: f64) -> f64 {
    if v.abs() < 1e-12 {
        return std::f64::consts::FRAC_PI_2 * i.signum();
    }
    (i / v * voc / isc).atan()
}

/// Find the linearly-interpolated value of the *other* field at the point
/// where `x(sample)` crosses zero (`x` selects `.i` to find `Voc`, `.v` to
/// find `Isc`), scanning consecutive samples for a sign change.
fn zero_crossing(samples: &[Sample], x: impl Fn(&Sample) -> f64) -> Option<f64> {
    let companion = |s: &Sample| if (x(s) - s.v).abs() < 1e-15 { s.i } else { s.v };
    samples.windows(2).find_map(|pair| {
        let (a, b) = (&pair[0], &pair[1]);
        let (xa, xb) = (x(a), x(b));
        if xa == 0.0 {
            return Some(companion(a));
        }
        if xa.signum() != xb.signum() {
            let frac = xa / (xa - xb);
            Some(companion(a) + frac * (companion(b) - companion(a)))
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(v: f64, i: f64) -> Sample {
        Sample::new(v, i, 0.0, 0)
    }

    #[test]
    fn register_curve_finds_argmax_power() {
        let mut tracker = Tracker::new(1.0);
        let curve = vec![sample(0.0, -0.02), sample(0.3, -0.018), sample(0.5, -0.01), sample(0.62, 0.0)];
        let stats = tracker.register_curve(&curve).unwrap();
        assert!((stats.vmpp - 0.3).abs() < 1e-9);
    }

    #[test]
    fn register_curve_keeps_best_pmax_across_calls() {
        let mut tracker = Tracker::new(1.0);
        let weaker = vec![sample(0.0, -0.01), sample(0.3, -0.005)];
        let stronger = vec![sample(0.0, -0.02), sample(0.3, -0.018)];
        tracker.register_curve(&stronger);
        let stats_before = (tracker.vmpp, tracker.impp);
        tracker.register_curve(&weaker);
        assert_eq!((tracker.vmpp, tracker.impp), stats_before);
    }

    #[test]
    fn quadrant_lock_clamps_sign_violations() {
        let mut tracker = Tracker::new(1.0);
        tracker.seed_voc(0.6);
        assert!(tracker.clamp_quadrant(-0.1) > 0.0);
        assert_eq!(tracker.clamp_quadrant(0.3), 0.3);
    }

    #[tokio::test]
    async fn spo_strategy_holds_and_updates_vmpp_impp() {
        use crate::hardware::mock::{DiodeParams, VirtualSmu};
        let smu = VirtualSmu::new(DiodeParams::default());
        smu.setup_dc(true, 0.5, 0.4, SenseRange::Auto).await.unwrap();
        let mut tracker = Tracker::new(1.0);
        tracker.seed_voc(0.62);
        let cancel = CancellationToken::new();
        let log = tracker.run_spo(&smu, 0.05, &cancel).await.unwrap();
        assert!(!log.is_empty());
        assert!(tracker.vmpp.is_some());
    }

    #[tokio::test]
    async fn basic_strategy_respects_cancellation() {
        use crate::hardware::mock::{DiodeParams, VirtualSmu};
        let smu = VirtualSmu::new(DiodeParams::default());
        let mut tracker = Tracker::new(1.0);
        tracker.seed_voc(0.62);
        tracker.isc = Some(0.02);
        tracker.vmpp = Some(0.4);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let log = tracker.run_basic(&smu, 10.0, 7.0, 0.1, 0.0, &cancel).await.unwrap();
        assert!(log.is_empty());
    }
}
