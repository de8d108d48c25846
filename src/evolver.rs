//! `Evolver`: the RKF54 inner loop.
//!
//! Evaluates dm/dt for candidate steps, applies the embedded
//! Dormand-Prince RK5(4)7 scheme with per-step error estimation, norm-drift
//! control, and energy-based rejection, and renormalizes spins.

use std::sync::Arc;

use crate::dmdt::{DmDtInputs, DmDtReport, DmDtVariant};
use crate::energy::{EnergyOutputs, EnergyProvider};
use crate::error::Result;
use crate::fixed_spin::FixedSpinMask;
use crate::rk_tableau::RkMethod;
use crate::state::{derived_keys, ReadKey, SimState, StatePool};
use crate::striped::MeshValue;
use crate::vec3::Vec3;

/// Global error order g = 5, extended order l = g + 1 = 6, for the
/// embedded 5(4) error estimate.
const GLOBAL_ERROR_ORDER: f64 = 5.0;
const EXTENDED_ERROR_ORDER: f64 = 6.0;

/// Energy-rejection constants.
const BAD_ENERGY_CUT_RATIO: f64 = 0.75;
const BAD_ENERGY_STEP_INCREASE: f64 = 1.3;
/// Ramp-up rate for `max_step_increase` back to its configured limit once
/// energy rejections stop recurring.
const MAX_STEP_INCREASE_ADJ_RATIO: f64 = 1.9;
/// Hard floor on a single step's shrink ratio: never cut by more than this
/// in one rejection.
const MAX_STEP_DECREASE: f64 = 0.03125;
/// Continuous-stage-boundary heuristic threshold.
const CONTINUOUS_STAGE_ENERGY_EPS: f64 = 256.0 * f64::EPSILON;
/// Soft reference-stepsize cap ratio for the step-bound growth formula.
const REFERENCE_STEPSIZE_RATIO: f64 = 0.85;

/// How a new stage picks its first trial step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStartMode {
    /// Always recompute from `start_dm`/`start_dt`.
    StartConditions,
    /// Always carry the prior stage's final `next_timestep` forward.
    Continuous,
    /// Decide per the `|Delta E| <= 256*eps*|Total E|` heuristic.
    Auto,
}

/// Evolver construction options.
#[derive(Debug, Clone)]
pub struct EvolverConfig {
    pub method: RkMethod,
    pub min_timestep: f64,
    pub max_timestep: f64,
    /// rad/s; negative disables (already converted from the MIF-layer
    /// deg/ns input by the host).
    pub error_rate: f64,
    /// rad; negative disables.
    pub absolute_step_error: f64,
    /// dimensionless; negative disables.
    pub relative_step_error: f64,
    pub energy_precision: f64,
    pub reject_goal: f64,
    pub min_step_headroom: f64,
    pub max_step_headroom: f64,
    pub max_step_increase_limit: f64,
    pub start_dm: f64,
    pub start_dt: Option<f64>,
    pub stage_start: StageStartMode,
}

impl Default for EvolverConfig {
    fn default() -> Self {
        Self {
            method: RkMethod::Rkf54C,
            min_timestep: 0.0,
            max_timestep: f64::INFINITY,
            error_rate: std::f64::consts::PI * 1e9 / 180.0, // 1 deg/ns
            absolute_step_error: 0.2 * std::f64::consts::PI / 180.0,
            relative_step_error: 0.01,
            energy_precision: 1e-10,
            reject_goal: 0.05,
            min_step_headroom: 0.33,
            max_step_headroom: 0.95,
            max_step_increase_limit: 4.0,
            start_dm: 0.01,
            start_dt: None,
            stage_start: StageStartMode::Auto,
        }
    }
}

impl EvolverConfig {
    pub fn validate(&self) -> Result<()> {
        use crate::error::LlgError;
        if self.min_step_headroom > self.max_step_headroom {
            return Err(LlgError::Config(
                "min_step_headroom must not be larger than max_step_headroom".into(),
            ));
        }
        if self.min_step_headroom < 0.0 || self.max_step_headroom < 0.0 {
            return Err(LlgError::Config("step headroom bounds must be non-negative".into()));
        }
        if self.reject_goal < 0.0 {
            return Err(LlgError::Config("reject_goal must be non-negative".into()));
        }
        if self.start_dt.is_none() && self.start_dm <= 0.0 {
            return Err(LlgError::Config("at least one of start_dm/start_dt is required".into()));
        }
        if self.min_timestep > self.max_timestep {
            return Err(LlgError::Config("min_timestep must not exceed max_timestep".into()));
        }
        Ok(())
    }
}

/// Result of one `Evolver::step` call. Rejection is a normal outcome, not
/// an error.
pub enum StepOutcome {
    Accepted(ReadKey<SimState>),
    Rejected { next_timestep: f64 },
}

impl StepOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, StepOutcome::Accepted(_))
    }
}

/// Which error bound was tightest in `check_error` (used to pick the
/// rejection-recovery step-size formula).
#[derive(Debug, Clone, Copy)]
enum ViolatedBound {
    RateOrRelative,
    Absolute,
}

struct ErrorCheck {
    accepted: bool,
    /// Relative stepsize adjustment ratio (multiply by `stepsize` to get
    /// the actual new stepsize); headroom not yet applied.
    ratio: f64,
    violated: Option<ViolatedBound>,
}

/// Embedded RKF54 driver: dm/dt evaluation, 7-stage RK advance, error
/// control, energy-based rejection, headroom feedback.
pub struct Evolver {
    config: EvolverConfig,
    kernel: Box<dyn DmDtVariant>,
    step_headroom: f64,
    reject_ratio: f64,
    max_step_increase: f64,
    reference_stepsize: f64,
    /// FSAL: dm/dt at stage 7 of the last accepted step, becomes stage 1 of
    /// the next.
    carried_dm_dt1: Option<MeshValue<Vec3>>,
    next_timestep: Option<f64>,
    at_stage_start: bool,
}

impl Evolver {
    pub fn new(config: EvolverConfig, kernel: Box<dyn DmDtVariant>) -> Result<Self> {
        config.validate()?;
        let step_headroom = config.max_step_headroom;
        let reject_goal = config.reject_goal;
        Ok(Self {
            config,
            kernel,
            step_headroom,
            reject_ratio: reject_goal,
            max_step_increase: 0.0, // set by init()
            reference_stepsize: f64::INFINITY,
            carried_dm_dt1: None,
            next_timestep: None,
            at_stage_start: true,
        })
    }

    /// One-time setup before the first step of a run.
    pub fn init(&mut self) {
        self.max_step_increase = self.config.max_step_increase_limit;
        self.step_headroom = self.config.max_step_headroom;
        self.reject_ratio = self.config.reject_goal;
        self.carried_dm_dt1 = None;
        self.next_timestep = None;
        self.at_stage_start = true;
    }

    /// Called by the driver at `STAGE_START`. `prev` is the just-finished
    /// stage's last state, if any.
    pub fn init_new_stage(&mut self, _current: &ReadKey<SimState>, _prev: Option<&ReadKey<SimState>>) {
        self.at_stage_start = true;
        if matches!(self.config.stage_start, StageStartMode::StartConditions) {
            self.next_timestep = None;
            self.carried_dm_dt1 = None;
        }
        // `Continuous`/`Auto` decide lazily in `step`, where `Total E` of
        // both `current` and the new stage's first trial is available.
    }

    /// Returns `(dm_dt, report, total_e, pe_pt)` for one per-stage
    /// energy/dm_dt evaluation at `state`.
    fn dm_dt_at(
        &self,
        energy: &dyn EnergyProvider,
        fixed: &FixedSpinMask,
        state: &SimState,
    ) -> Result<(MeshValue<Vec3>, DmDtReport, f64, f64)> {
        let n = state.spin.len();
        let mut energy_density = MeshValue::<f64>::zeros(n);
        let mut mxh = MeshValue::<Vec3>::zeros(n);
        let mut h = self.kernel.needs_h().then(|| MeshValue::<Vec3>::zeros(n));
        let totals = energy.get_energy_density(
            state,
            EnergyOutputs { energy_density: &mut energy_density, mxh: Some(&mut mxh), h: h.as_mut() },
        );
        let mut dm_dt = MeshValue::<Vec3>::zeros(n);
        let report = self.kernel.compute(
            state,
            DmDtInputs { mxh: &mxh, h: h.as_ref(), pe_pt: totals.pe_pt },
            fixed,
            &mut dm_dt,
        )?;
        // Every shipped kernel already zeroes fixed cells itself, but the
        // fixed-spin invariant must hold for any pluggable kernel, not just
        // the ones that remember to check. This is the one choke point every
        // RK stage's dm/dt passes through, so enforce it here structurally.
        fixed.apply(&mut dm_dt);
        Ok((dm_dt, report, totals.total_e, totals.pe_pt))
    }

    /// Choose the trial stepsize for a fresh (non-FSAL) step: the
    /// start-of-stage heuristic, or the carried-forward `next_timestep`
    /// from the previous accepted step.
    fn choose_trial_step(&mut self, current: &SimState, max_dm_dt: f64) -> f64 {
        let use_start_heuristic = self.at_stage_start
            && match self.config.stage_start {
                StageStartMode::StartConditions => true,
                StageStartMode::Continuous => false,
                StageStartMode::Auto => {
                    // Reuse the prior stage's next_timestep only when the
                    // boundary looks "continuous" in energy, i.e. this is
                    // not actually the very first step of the run.
                    self.next_timestep.is_none()
                        || current
                            .derived_data
                            .get(derived_keys::DELTA_E)
                            .zip(current.derived_data.get(derived_keys::TOTAL_E))
                            .map(|(de, total_e)| de.abs() > CONTINUOUS_STAGE_ENERGY_EPS * total_e.abs())
                            .unwrap_or(true)
                }
            };

        let h = if use_start_heuristic || self.next_timestep.is_none() {
            let start_dm = self.config.start_dm;
            let heuristic = if max_dm_dt > 0.0 {
                self.step_headroom * start_dm / max_dm_dt
            } else {
                self.config.start_dt.unwrap_or(self.config.max_timestep)
            };
            match self.config.start_dt {
                Some(start_dt) => heuristic.min(start_dt),
                None => heuristic,
            }
        } else {
            self.next_timestep.unwrap()
        };
        h.clamp(self.config.min_timestep.max(f64::MIN_POSITIVE), self.config.max_timestep)
    }

    /// Combine the rate/relative and absolute error bounds, whichever is
    /// tighter, and report a relative stepsize ratio (headroom not yet
    /// applied).
    fn check_error(&self, error: f64, stepsize: f64, max_dm_dt: f64) -> ErrorCheck {
        let mut accepted = true;
        let mut ratio = 1.0;
        let mut violated = None;
        let mut checked = false;

        if self.config.relative_step_error >= 0.0 || self.config.error_rate >= 0.0 {
            let mut rate_error = if self.config.relative_step_error < 0.0 {
                self.config.error_rate
            } else if self.config.error_rate < 0.0 {
                self.config.relative_step_error * max_dm_dt
            } else {
                (self.config.relative_step_error * max_dm_dt).min(self.config.error_rate)
            };
            rate_error *= stepsize;

            if error > rate_error {
                accepted = false;
                violated = Some(ViolatedBound::RateOrRelative);
                ratio = (rate_error / error).powf(1.0 / GLOBAL_ERROR_ORDER);
            } else {
                let test_ratio = if error > 0.0 { (rate_error / error).min(1e300) } else { 1e300 };
                ratio = test_ratio.powf(1.0 / GLOBAL_ERROR_ORDER).min(1.0 * 1e300);
            }
            checked = true;
        }

        if self.config.absolute_step_error >= 0.0 {
            let local_order = EXTENDED_ERROR_ORDER;
            let test_stepsize = if error > self.config.absolute_step_error {
                accepted = false;
                if violated.is_none() {
                    violated = Some(ViolatedBound::Absolute);
                }
                (self.config.absolute_step_error / error).powf(1.0 / local_order)
            } else {
                let test_ratio =
                    if error > 0.0 { (self.config.absolute_step_error / error).min(1e300) } else { 1e300 };
                test_ratio.powf(1.0 / local_order)
            };
            if !checked || test_stepsize < ratio {
                ratio = test_stepsize;
            }
            checked = true;
        }

        if !checked {
            // Both bounds disabled: every step is accepted, no growth cap
            // beyond the caller's own headroom/reference-stepsize logic.
            return ErrorCheck { accepted: true, ratio: 1.0, violated: None };
        }
        ErrorCheck { accepted, ratio, violated }
    }

    /// Apply headroom and the growth caps (`max_step_increase` and the
    /// reference-stepsize soft cap) to a `check_error` ratio, yielding the
    /// actual suggested next stepsize.
    fn bound_new_stepsize(&self, ratio: f64, stepsize: f64) -> f64 {
        let mut new_stepsize = ratio * self.step_headroom;
        if new_stepsize < MAX_STEP_DECREASE {
            return MAX_STEP_DECREASE * stepsize;
        }
        new_stepsize *= stepsize;
        let mut step_bound = stepsize * self.max_step_increase;
        if stepsize < self.reference_stepsize * REFERENCE_STEPSIZE_RATIO {
            step_bound = step_bound.min(self.reference_stepsize);
        } else if stepsize < self.reference_stepsize {
            let ref_bound = self.reference_stepsize
                + (self.max_step_increase - 1.0) * (stepsize - self.reference_stepsize * REFERENCE_STEPSIZE_RATIO)
                    / (1.0 - REFERENCE_STEPSIZE_RATIO);
            step_bound = step_bound.min(ref_bound);
        }
        new_stepsize.min(step_bound)
    }

    /// Rolling reject-ratio / headroom feedback loop.
    fn update_headroom(&mut self, rejected: bool) {
        let flag = if rejected { 1.0 } else { 0.0 };
        self.reject_ratio = (31.0 * self.reject_ratio + flag) / 32.0;
        if self.reject_ratio > self.config.reject_goal && rejected {
            self.step_headroom *= 0.925;
        }
        if self.reject_ratio < self.config.reject_goal && !rejected {
            self.step_headroom *= 1.075;
        }
        self.step_headroom = self.step_headroom.clamp(self.config.min_step_headroom, self.config.max_step_headroom);
    }

    /// Advance `current` by one adaptive RKF54 step, with the
    /// driver-facing accept/reject contract.
    pub fn step(
        &mut self,
        pool: &mut StatePool,
        energy: &dyn EnergyProvider,
        fixed: &FixedSpinMask,
        current: &ReadKey<SimState>,
    ) -> Result<StepOutcome> {
        let tableau = *self.config.method.tableau();
        let n = current.spin.len();
        let mesh = Arc::clone(&current.mesh);

        let (dm_dt1, max_dm_dt1, total_e_old) = match self.carried_dm_dt1.take() {
            Some(d) => {
                let old_total_e = current.derived_data.get(derived_keys::TOTAL_E).unwrap_or(0.0);
                let max1 = d.iter().fold(0.0_f64, |acc, v| acc.max(v.magnitude()));
                (d, max1, old_total_e)
            }
            None => {
                let (d, report, total_e, _pe_pt) = self.dm_dt_at(energy, fixed, current)?;
                (d, report.max_dm_dt, total_e)
            }
        };

        let h = self.choose_trial_step(current, max_dm_dt1);

        // Scratch state used to query the EnergyProvider at each trial spin
        // configuration; never published through the state pool.
        let mut scratch = current.clone_header();

        let make_trial = |scratch: &mut SimState, k: &MeshValue<Vec3>| -> (f64, f64) {
            let mut max_mag = 0.0_f64;
            let mut min_mag = f64::INFINITY;
            for i in 0..n {
                let raw = current.spin[i] + k[i] * h;
                let mag = raw.magnitude();
                max_mag = max_mag.max(mag);
                min_mag = min_mag.min(mag);
                scratch.spin[i] = raw.normalize();
            }
            (max_mag, min_mag)
        };

        let combine2 = |b1: f64, d1: &MeshValue<Vec3>, b2: f64, d2: &MeshValue<Vec3>| -> MeshValue<Vec3> {
            MeshValue::from_vec((0..n).map(|i| d1[i] * b1 + d2[i] * b2).collect())
        };

        // Stage 2.
        let k1 = MeshValue::from_vec(dm_dt1.iter().map(|&v| v * tableau.b11).collect());
        make_trial(&mut scratch, &k1);
        let (dm_dt2, _, _, _) = self.dm_dt_at(energy, fixed, &scratch)?;

        // Stage 3.
        let k2 = combine2(tableau.b21, &dm_dt1, tableau.b22, &dm_dt2);
        make_trial(&mut scratch, &k2);
        let (dm_dt3, _, _, _) = self.dm_dt_at(energy, fixed, &scratch)?;

        // Stage 4.
        let k3 = MeshValue::from_vec(
            (0..n)
                .map(|i| dm_dt1[i] * tableau.b31 + dm_dt2[i] * tableau.b32 + dm_dt3[i] * tableau.b33)
                .collect(),
        );
        make_trial(&mut scratch, &k3);
        let (dm_dt4, _, _, _) = self.dm_dt_at(energy, fixed, &scratch)?;

        // Stage 5.
        let k4 = MeshValue::from_vec(
            (0..n)
                .map(|i| {
                    dm_dt1[i] * tableau.b41 + dm_dt2[i] * tableau.b42 + dm_dt3[i] * tableau.b43
                        + dm_dt4[i] * tableau.b44
                })
                .collect(),
        );
        make_trial(&mut scratch, &k4);
        let (dm_dt5, _, _, _) = self.dm_dt_at(energy, fixed, &scratch)?;

        // Stage 6.
        let k5 = MeshValue::from_vec(
            (0..n)
                .map(|i| {
                    dm_dt1[i] * tableau.b51 + dm_dt2[i] * tableau.b52 + dm_dt3[i] * tableau.b53
                        + dm_dt4[i] * tableau.b54 + dm_dt5[i] * tableau.b55
                })
                .collect(),
        );
        make_trial(&mut scratch, &k5);
        let (dm_dt6, _, _, _) = self.dm_dt_at(energy, fixed, &scratch)?;

        // Stage 7 (candidate final spin, "Da" = k6).
        let k6 = MeshValue::from_vec(
            (0..n)
                .map(|i| {
                    dm_dt1[i] * tableau.b61 + dm_dt3[i] * tableau.b63 + dm_dt4[i] * tableau.b64
                        + dm_dt5[i] * tableau.b65 + dm_dt6[i] * tableau.b66
                })
                .collect(),
        );
        let (max_mag, min_mag) = make_trial(&mut scratch, &k6);
        let norm_error = (max_mag - 1.0).max(1.0 - min_mag);
        let (dm_dt7, report7, total_e_new, pe_pt_final) = self.dm_dt_at(energy, fixed, &scratch)?;

        // Error vector dD = sum dm_dtM * dcM (dc2 = 0), step error scalar.
        let mut max_abs_dd = 0.0_f64;
        for i in 0..n {
            let dd = dm_dt1[i] * tableau.dc1
                + dm_dt3[i] * tableau.dc3
                + dm_dt4[i] * tableau.dc4
                + dm_dt5[i] * tableau.dc5
                + dm_dt6[i] * tableau.dc6
                + dm_dt7[i] * tableau.dc7;
            max_abs_dd = max_abs_dd.max(dd.magnitude());
        }
        let error = h * max_abs_dd;

        let check = self.check_error(error, h, report7.max_dm_dt);
        if !check.accepted {
            self.update_headroom(true);
            let suggested = self.bound_new_stepsize(check.ratio, h);
            let suggested = suggested.max(self.norm_drift_floor(report7.max_dm_dt));
            tracing::debug!(violated = ?check.violated, h, suggested, "RK error bound rejected step");
            self.next_timestep = Some(suggested);
            return Ok(StepOutcome::Rejected { next_timestep: suggested });
        }

        // Energy-based rejection: a step that raises Total E by more than
        // pE/pt's own contribution plus numerical slack means
        // the trial overshot the energy landscape, even though its RK error
        // estimate passed.
        let delta_e = total_e_new - total_e_old;
        let e_numerror = total_e_new.abs().max(total_e_old.abs()) * self.config.energy_precision;
        let allowed_increase = pe_pt_final.max(0.0) * h + e_numerror;
        if delta_e > allowed_increase {
            self.update_headroom(true);
            self.max_step_increase = BAD_ENERGY_STEP_INCREASE;
            let next = (h * BAD_ENERGY_CUT_RATIO).max(self.norm_drift_floor(report7.max_dm_dt));
            tracing::debug!(delta_e, allowed_increase, h, next, "energy-based step rejection");
            self.next_timestep = Some(next);
            return Ok(StepOutcome::Rejected { next_timestep: next });
        }

        // Accepted: publish the new state through the pool.
        self.update_headroom(false);
        if self.max_step_increase < self.config.max_step_increase_limit {
            self.max_step_increase = (self.max_step_increase * MAX_STEP_INCREASE_ADJ_RATIO)
                .min(self.config.max_step_increase_limit);
        }

        let mut write = pool.get_new_simulation_state()?;
        write.spin = scratch.spin.clone();
        write.ms = current.ms.clone();
        write.ms_inverse = current.ms_inverse.clone();
        write.mesh = Arc::clone(&mesh);
        write.previous_state_id = current.id();
        write.iteration_count = current.iteration_count + 1;
        write.stage_number = current.stage_number;
        write.stage_iteration_count = current.stage_iteration_count + 1;
        write.stage_start_time = current.stage_start_time;
        write.stage_elapsed_time = current.stage_elapsed_time + h;
        write.last_timestep = h;

        write.derived_data.add(derived_keys::MAX_DM_DT, report7.max_dm_dt)?;
        write.derived_data.add(derived_keys::DE_DT, report7.de_dt)?;
        write.derived_data.add(derived_keys::PE_PT, pe_pt_final)?;
        write.derived_data.add(derived_keys::DELTA_E, delta_e)?;
        write.derived_data.add(derived_keys::TOTAL_E, total_e_new)?;
        write.derived_data.add(derived_keys::TIMESTEP_LOWER_BOUND, report7.timestep_lower_bound)?;

        let new_id = pool.next_id();
        let read = write.finalize_state(new_id);

        let raw_next = self.bound_new_stepsize(check.ratio, h);
        let next_timestep = raw_next.max(self.norm_drift_floor(report7.max_dm_dt));
        self.next_timestep = Some(next_timestep);
        self.reference_stepsize = h;
        self.carried_dm_dt1 = Some(dm_dt7);
        self.at_stage_start = false;

        tracing::debug!(
            id = new_id,
            h,
            next_timestep,
            max_dm_dt = report7.max_dm_dt,
            norm_error,
            step_headroom = self.step_headroom,
            "accepted RKF54 step"
        );

        Ok(StepOutcome::Accepted(read))
    }

    /// `timestep_lower_bound` as a normalization-drift floor on any
    /// suggested next step.
    fn norm_drift_floor(&self, max_dm_dt: f64) -> f64 {
        crate::dmdt::timestep_lower_bound(max_dm_dt, f64::EPSILON)
    }

    /// The primed suggestion for the next trial stepsize, if an accepted
    /// step has already set one. `None` before the first step of a stage,
    /// when the start-of-stage heuristic governs instead.
    pub fn next_timestep_hint(&self) -> Option<f64> {
        self.next_timestep
    }

    /// Override the primed next-step suggestion. Used by the driver's
    /// stage-stop clamp to shrink an overstepping trial or pre-shorten an
    /// "approach foreshortening" step so it lands exactly on a stage
    /// boundary.
    pub fn override_next_timestep(&mut self, h: f64) {
        self.next_timestep = Some(h);
    }
}
