//! `DmDtVariant`: pluggable dm/dt kernels.
//!
//! All four variants share the same postprocessing contract: produce
//! `dm_dt`, `max_dm_dt`, `dE/dt`, and `timestep_lower_bound`.

pub mod standard_llg;
pub mod zhang;
pub mod baryakhtar;
pub mod spin_transfer;
pub mod boundary;

use crate::error::Result;
use crate::state::SimState;
use crate::striped::MeshValue;
use crate::vec3::Vec3;
use crate::fixed_spin::FixedSpinMask;

pub use standard_llg::StandardLlg;
pub use zhang::ZhangDamping;
pub use baryakhtar::BaryakhtarDamping;
pub use spin_transfer::{CurrentProfile, Polarization, SpinTransferTorque};

/// Vacuum permeability (T*m/A), used to convert torque densities to dE/dt.
pub const MU0: f64 = 4.0 * std::f64::consts::PI * 1e-7;

/// Inputs every dm/dt kernel consumes besides the state itself: the mxH
/// field and pE/pt, both supplied by the `EnergyProvider` for this trial
/// state. `h`, the raw effective field, is only populated for kernels that
/// need more than `mxH` (Baryakhtar's `Hperp` Laplacian needs the field
/// itself, not just its cross product with `m`).
pub struct DmDtInputs<'a> {
    pub mxh: &'a MeshValue<Vec3>,
    pub h: Option<&'a MeshValue<Vec3>>,
    pub pe_pt: f64,
}

/// Aggregate diagnostics every variant must produce; these feed directly
/// into the candidate state's well-known derived-data keys.
#[derive(Debug, Clone, Copy, Default)]
pub struct DmDtReport {
    pub max_dm_dt: f64,
    pub de_dt: f64,
    pub timestep_lower_bound: f64,
}

/// Smallest step that would move any spin by more than `eps` relative to
/// unit magnitude, reused as the evolver's normalization-drift clamp.
#[inline]
pub fn timestep_lower_bound(max_dm_dt: f64, eps: f64) -> f64 {
    64.0 * eps / max_dm_dt.max(eps)
}

/// A dm/dt kernel, selected once at evolver construction.
pub trait DmDtVariant: Send + Sync {
    fn compute(
        &self,
        state: &SimState,
        inputs: DmDtInputs<'_>,
        fixed: &FixedSpinMask,
        dm_dt: &mut MeshValue<Vec3>,
    ) -> Result<DmDtReport>;

    /// Whether this kernel needs the raw effective field `H`, not just
    /// `mxH`. The evolver only asks the `EnergyProvider` to fill `h` when
    /// at least one kernel in use requires it.
    fn needs_h(&self) -> bool {
        false
    }
}

/// Shared max-dm/dt / timestep-lower-bound recompute, used by every variant
/// after writing its final `dm_dt` array: the contract is the same
/// regardless of which correction terms were added on top of the base
/// LLG torque.
pub(crate) fn max_dm_dt_of(dm_dt: &MeshValue<Vec3>) -> f64 {
    dm_dt.iter().fold(0.0_f64, |acc, d| acc.max(d.magnitude()))
}
