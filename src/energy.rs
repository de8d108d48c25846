//! `EnergyProvider` contract.
//!
//! The specific energy/field terms (exchange, demag, anisotropy, Zeeman,
//! DMI, ...) are external collaborators; this crate only consumes them
//! through this trait.

use crate::state::SimState;
use crate::striped::MeshValue;
use crate::vec3::Vec3;

/// Output slots an `EnergyProvider` fills in. `mxh` and `h` are optional:
/// dm/dt kernels always need `mxh`; some diagnostics additionally want the
/// raw effective field `h`.
pub struct EnergyOutputs<'a> {
    /// Energy density (J/m^3) per cell. Always written.
    pub energy_density: &'a mut MeshValue<f64>,
    /// m x H_eff per cell (A/m), i.e. torque per unit volume per unit Ms.
    pub mxh: Option<&'a mut MeshValue<Vec3>>,
    /// Raw effective field per cell (A/m).
    pub h: Option<&'a mut MeshValue<Vec3>>,
}

/// Aggregate scalars returned alongside the per-cell outputs.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnergyTotals {
    /// Partial time derivative of total energy summed over all explicitly
    /// time-varying terms (applied field profile, time-varying currents).
    pub pe_pt: f64,
    /// Total energy (J), i.e. `sum_i energy_density[i] * volume(i)`.
    pub total_e: f64,
}

/// Abstraction over the total energy, mxH field, and dE/dt of a `SimState`.
///
/// Implementations must be thread-safe, or internally serialize: the
/// evolver may call `get_energy_density` from within a parallel
/// job-basket phase.
pub trait EnergyProvider: Send + Sync {
    fn get_energy_density(&self, state: &SimState, outputs: EnergyOutputs<'_>) -> EnergyTotals;
}

pub mod test_support {
    //! A minimal Zeeman-only provider used by integration tests (S1/S2) and
    //! benchmarks, standing in for the real (out-of-scope) energy terms. Not
    //! `cfg(test)`-gated since `tests/`/`benches/` link this crate without
    //! that flag set and still need it (mirrors `mesh::UniformValue`).

    use super::*;

    /// Uniform applied field H, constant in time (`pe_pt == 0`).
    pub struct UniformZeeman {
        pub field: Vec3,
        /// mu0, in SI units (T*m/A), used to convert `m . H` to an energy density.
        pub mu0: f64,
    }

    impl EnergyProvider for UniformZeeman {
        fn get_energy_density(&self, state: &SimState, outputs: EnergyOutputs<'_>) -> EnergyTotals {
            let EnergyOutputs { energy_density, mxh, h } = outputs;
            let mut total_e = 0.0;
            for i in 0..state.spin.len() {
                let m = state.spin[i];
                let ms = state.ms[i];
                // Zeeman energy density: -mu0 * Ms * (m . H)
                let e = -self.mu0 * ms * m.dot(self.field);
                energy_density[i] = e;
                total_e += e * state.mesh.volume(i);
            }
            if let Some(mxh) = mxh {
                for i in 0..state.spin.len() {
                    mxh[i] = state.spin[i].cross(self.field);
                }
            }
            if let Some(h) = h {
                for i in 0..state.spin.len() {
                    h[i] = self.field;
                }
            }
            EnergyTotals { pe_pt: 0.0, total_e }
        }
    }
}
