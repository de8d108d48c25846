//! Standard LLG (Landau-Lifshitz form) dm/dt kernel.
//!
//! `dm/dt = gamma * (mxH + alpha * (m x mxH))`, `gamma = gamma_G / (1+alpha^2)`.
//! Cells with `Ms=0` and fixed-spin cells have dm/dt forced to zero.

use crate::error::Result;
use crate::fixed_spin::FixedSpinMask;
use crate::state::SimState;
use crate::striped::{default_num_threads, parallel_fill_cells, MeshValue};
use crate::vec3::Vec3;
use crate::xpfloat::Xpfloat;

use super::{max_dm_dt_of, timestep_lower_bound, DmDtInputs, DmDtReport, DmDtVariant, MU0};

/// Cells per job-basket chunk for the dm/dt pass; coarse enough that the
/// atomic cursor in `JobBasket` isn't itself a bottleneck.
const DMDT_CHUNK_SIZE: usize = 64;

/// Standard LLG kernel: cellwise gamma and alpha fields, in Landau-Lifshitz
/// form.
#[derive(Debug, Clone)]
pub struct StandardLlg {
    pub alpha: MeshValue<f64>,
    /// Landau-Lifshitz form gamma, already divided by `1+alpha^2` if the
    /// host supplied a Gilbert-form `gamma_G` (see `from_gilbert`).
    pub gamma: MeshValue<f64>,
    /// Optional pure-damping mode: when false, the precession term `mxH`
    /// is dropped but the damping term is retained.
    pub do_precess: bool,
}

impl StandardLlg {
    /// Build from a Gilbert-form `gamma_G` field, dividing by `1+alpha^2`
    /// once up front.
    pub fn from_gilbert(alpha: MeshValue<f64>, gamma_g: MeshValue<f64>, do_precess: bool) -> Self {
        let gamma = MeshValue::from_vec(
            gamma_g
                .iter()
                .zip(alpha.iter())
                .map(|(&g, &a)| g / (1.0 + a * a))
                .collect(),
        );
        Self { alpha, gamma, do_precess }
    }

    /// Build directly from a Landau-Lifshitz-form `gamma_LL` field (no
    /// conversion needed).
    pub fn from_ll(alpha: MeshValue<f64>, gamma_ll: MeshValue<f64>, do_precess: bool) -> Self {
        Self { alpha, gamma: gamma_ll, do_precess }
    }

    /// Per-cell dm/dt and energy-dissipation-rate contribution, shared by
    /// this kernel and the damping-correction variants (Zhang, Baryakhtar,
    /// spin-transfer) that wrap it.
    #[inline]
    pub(crate) fn cell_dm_dt(&self, i: usize, m: Vec3, mxh: Vec3) -> (Vec3, f64) {
        let alpha = self.alpha[i];
        let gamma = self.gamma[i];
        let precession = if self.do_precess { mxh } else { Vec3::ZERO };
        let damping = m.cross(mxh) * alpha;
        ((precession + damping) * gamma, gamma * alpha)
    }
}

impl DmDtVariant for StandardLlg {
    fn compute(
        &self,
        state: &SimState,
        inputs: DmDtInputs<'_>,
        fixed: &FixedSpinMask,
        dm_dt: &mut MeshValue<Vec3>,
    ) -> Result<DmDtReport> {
        let n = state.spin.len();
        let num_threads = default_num_threads(n);

        parallel_fill_cells(dm_dt, num_threads, DMDT_CHUNK_SIZE, |i| {
            if state.ms[i] == 0.0 || fixed.contains(i) {
                Vec3::ZERO
            } else {
                self.cell_dm_dt(i, state.spin[i], inputs.mxh[i]).0
            }
        });

        // Per-cell dE/dt contribution, computed on the same job-basket pass
        // and then folded through the compensated accumulator in cell
        // order, so the result doesn't depend on thread count or scheduling.
        let mut de_dt_parts = MeshValue::<f64>::zeros(n);
        parallel_fill_cells(&mut de_dt_parts, num_threads, DMDT_CHUNK_SIZE, |i| {
            if state.ms[i] == 0.0 || fixed.contains(i) {
                0.0
            } else {
                let gamma_alpha = self.gamma[i] * self.alpha[i];
                -MU0 * gamma_alpha * inputs.mxh[i].magnitude_squared() * state.ms[i] * state.mesh.volume(i)
            }
        });
        let de_dt_acc: Xpfloat = de_dt_parts.iter().copied().sum();

        let max_dm_dt = max_dm_dt_of(dm_dt);
        Ok(DmDtReport {
            max_dm_dt,
            de_dt: de_dt_acc.value() + inputs.pe_pt,
            timestep_lower_bound: timestep_lower_bound(max_dm_dt, f64::EPSILON),
        })
    }
}
