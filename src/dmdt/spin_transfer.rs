//! Spin-transfer torque: an additional per-cell torque on top of the
//! standard LLG dm/dt,
//!
//! ```text
//! T_stt = eps*(alpha*m×p - p×(m×p)) + eps'*(alpha*p×(m×p) + m×p)
//! ```
//!
//! `p` is a polarization direction -- either a fixed field or, in
//! "propagating mode", the (normalized) spatial derivative of `m` along the
//! current direction. `eps`/`eps'` are per-cell fields derived upstream
//! (from fixed/free polarization magnitudes P, the Lambda asymmetry
//! factors, and a base current density -- see DESIGN.md for why that
//! derivation is treated as a host-supplied field, like Ms or alpha)
//! scaled by `J(t)` through a stage-dependent current profile.

use crate::error::{LlgError, Result};
use crate::fixed_spin::FixedSpinMask;
use crate::state::SimState;
use crate::striped::MeshValue;
use crate::vec3::Vec3;

use super::boundary::{central_difference, four_point_difference, Axis};
use super::standard_llg::StandardLlg;
use super::{max_dm_dt_of, timestep_lower_bound, DmDtInputs, DmDtReport, DmDtVariant};

/// How the polarization direction `p` is determined per cell.
pub enum Polarization {
    /// A fixed polarization direction field (e.g. from a pinned layer).
    Fixed(MeshValue<Vec3>),
    /// Propagating mode: `p[i] = normalize(dm/d(axis))`, with the current
    /// direction selecting the differencing axis.
    Propagating { axis: Axis, four_point: bool },
}

/// Current density profile: `J(t) = j0 * profile(stage, stage_elapsed_time)`.
pub trait CurrentProfile: Send + Sync {
    fn multiplier(&self, stage_number: u32, stage_elapsed_time: f64) -> f64;
}

/// Constant current (profile multiplier is always 1).
pub struct ConstantCurrent;
impl CurrentProfile for ConstantCurrent {
    fn multiplier(&self, _stage_number: u32, _stage_elapsed_time: f64) -> f64 {
        1.0
    }
}

pub struct SpinTransferTorque {
    pub base: StandardLlg,
    pub polarization: Polarization,
    /// Per-cell base (J=1) epsilon coefficient, to be scaled by the current
    /// profile's multiplier at each evaluation.
    pub eps0: MeshValue<f64>,
    /// Per-cell base (J=1) epsilon-prime coefficient.
    pub eps_prime0: MeshValue<f64>,
    pub current_profile: Box<dyn CurrentProfile>,
}

impl DmDtVariant for SpinTransferTorque {
    fn compute(
        &self,
        state: &SimState,
        inputs: DmDtInputs<'_>,
        fixed: &FixedSpinMask,
        dm_dt: &mut MeshValue<Vec3>,
    ) -> Result<DmDtReport> {
        let mut base_report =
            self.base.compute(state, DmDtInputs { mxh: inputs.mxh, h: inputs.h, pe_pt: inputs.pe_pt }, fixed, dm_dt)?;

        let j_mult = self
            .current_profile
            .multiplier(state.stage_number, state.stage_elapsed_time);

        let rect = match &self.polarization {
            Polarization::Propagating { .. } => Some(
                state
                    .mesh
                    .as_rectangular()
                    .ok_or_else(|| LlgError::Mesh("propagating-mode STT requires a rectangular mesh".to_string()))?,
            ),
            Polarization::Fixed(_) => None,
        };

        for i in 0..state.spin.len() {
            if state.ms[i] == 0.0 || fixed.contains(i) {
                continue;
            }
            let m = state.spin[i];
            let p = match &self.polarization {
                Polarization::Fixed(field) => field[i],
                Polarization::Propagating { axis, four_point } => {
                    let rect = rect.expect("validated above");
                    let d = if *four_point {
                        four_point_difference(rect, &state.spin, i, *axis)
                    } else {
                        central_difference(rect, &state.spin, i, *axis)
                    };
                    d.normalize()
                }
            };

            let eps = self.eps0[i] * j_mult;
            let eps_prime = self.eps_prime0[i] * j_mult;
            let alpha = self.base.alpha[i];

            let mxp = m.cross(p);
            let p_x_mxp = p.cross(mxp);

            let term1 = (mxp * alpha - p_x_mxp) * eps;
            let term2 = (p_x_mxp * alpha + mxp) * eps_prime;
            let correction = term1 + term2;
            dm_dt[i] += correction;
        }

        base_report.max_dm_dt = max_dm_dt_of(dm_dt);
        base_report.timestep_lower_bound = timestep_lower_bound(base_report.max_dm_dt, f64::EPSILON);
        Ok(base_report)
    }
}
