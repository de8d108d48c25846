//! Output cache adapters: state-keyed caches for scalar/vector derived
//! quantities.
//!
//! `SimState::derived_data` is write-once and travels with the state
//! because the evolver computes those quantities as a byproduct of the
//! RKF54 step itself. Some diagnostics, though, are cheap to skip entirely
//! when nobody asks for them (e.g. "Max Spin Angle", an
//! all-pairs-of-neighbors reduction over the whole mesh) and are naturally
//! owned by a caller outside the evolver -- the driver, or a host's output
//! manager. Those quantities can't be written into a state's derived-data
//! bag after the fact (states are immutable once finalized), so they live
//! in a small id-keyed cache instead: recomputed at most once per distinct
//! state id, discarded (and recomputed) the moment the id changes.

use crate::mesh::RectangularMesh;
use crate::state::SimState;
use crate::striped::MeshValue;
use crate::vec3::Vec3;

/// Caches one scalar/vector quantity against the id of the `SimState` it was
/// computed from. `get_or_compute` only re-runs `compute` when the state's
/// id has changed since the last call, the same `same_state` idea a lock
/// uses, applied to a derived quantity instead.
#[derive(Debug, Clone, Default)]
pub struct OutputCache<T> {
    cached_for: Option<u32>,
    value: Option<T>,
}

impl<T: Clone> OutputCache<T> {
    pub fn new() -> Self {
        Self { cached_for: None, value: None }
    }

    /// Returns the cached value if it was computed for `state.id`, otherwise
    /// runs `compute` and caches the result.
    pub fn get_or_compute(&mut self, state: &SimState, compute: impl FnOnce(&SimState) -> T) -> T {
        if self.cached_for != Some(state.id) {
            self.value = Some(compute(state));
            self.cached_for = Some(state.id);
        }
        self.value.clone().expect("value is always set alongside cached_for")
    }

    /// Drop any cached value, forcing the next `get_or_compute` to recompute
    /// regardless of id (used when a quantity's *inputs* changed without the
    /// state id changing, e.g. a host toggling which outputs are wanted).
    pub fn invalidate(&mut self) {
        self.cached_for = None;
        self.value = None;
    }
}

/// Maximum angle (radians) between any two nearest-neighbor spins in the
/// mesh -- a "Max Spin Angle" diagnostic, reported only when a host opts in
/// via `DriverConfig::report_max_spin_angle` since it is an O(N) full-mesh
/// reduction the RKF54 inner loop doesn't otherwise need.
/// Requires a rectangular mesh for nearest-neighbor indexing; returns
/// `0.0` for a mesh with fewer than two cells along every axis.
pub fn max_spin_angle(mesh: &dyn RectangularMesh, spin: &MeshValue<Vec3>) -> f64 {
    let mut max_cos = 1.0_f64;
    for cell in 0..mesh.size() {
        let (i, j, k) = mesh.coords(cell);
        let m = spin[cell];
        let mut visit = |ni: Option<usize>| {
            if let Some(neighbor) = ni {
                let cos_angle = m.dot(spin[neighbor]).clamp(-1.0, 1.0);
                max_cos = max_cos.min(cos_angle);
            }
        };
        if i + 1 < mesh.dim_x() {
            visit(mesh.index(i + 1, j, k));
        }
        if j + 1 < mesh.dim_y() {
            visit(mesh.index(i, j + 1, k));
        }
        if k + 1 < mesh.dim_z() {
            visit(mesh.index(i, j, k + 1));
        }
    }
    max_cos.clamp(-1.0, 1.0).acos()
}

/// An `OutputCache` specialized for `max_spin_angle`. Each state carries its
/// own mesh reference, so this only needs to remember the last id and
/// value, not the mesh itself.
#[derive(Debug, Clone, Default)]
pub struct SpinAngleCache {
    cache: OutputCache<f64>,
}

impl SpinAngleCache {
    pub fn new() -> Self {
        Self { cache: OutputCache::new() }
    }

    /// Max spin angle (radians) for `state`, recomputed only if `state.id`
    /// differs from the last call. `None` if `state.mesh` isn't rectangular,
    /// since nearest-neighbor indexing requires it.
    pub fn get(&mut self, state: &SimState) -> Option<f64> {
        let mesh = state.mesh.as_rectangular()?;
        Some(self.cache.get_or_compute(state, |s| max_spin_angle(mesh, &s.spin)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::UniformRectangularMesh;
    use std::sync::Arc;

    #[test]
    fn cache_recomputes_only_when_id_changes() {
        let mut calls = 0;
        let mesh = UniformRectangularMesh::new(2, 1, 1, 1e-9, 1e-9, 1e-9);
        let mut state = SimState::blank(Arc::new(mesh));
        state.id = 1;
        let mut cache: OutputCache<f64> = OutputCache::new();

        let v1 = cache.get_or_compute(&state, |_| {
            calls += 1;
            42.0
        });
        let v2 = cache.get_or_compute(&state, |_| {
            calls += 1;
            99.0
        });
        assert_eq!(v1, 42.0);
        assert_eq!(v2, 42.0);
        assert_eq!(calls, 1);

        state.id = 2;
        let v3 = cache.get_or_compute(&state, |_| {
            calls += 1;
            7.0
        });
        assert_eq!(v3, 7.0);
        assert_eq!(calls, 2);
    }

    #[test]
    fn aligned_spins_have_zero_max_angle() {
        let mesh = UniformRectangularMesh::new(3, 3, 1, 1e-9, 1e-9, 1e-9);
        let spin = MeshValue::from_vec(vec![Vec3::new(1.0, 0.0, 0.0); 9]);
        assert!(max_spin_angle(&mesh, &spin).abs() < 1e-12);
    }

    #[test]
    fn perpendicular_neighbor_gives_quarter_turn() {
        let mesh = UniformRectangularMesh::new(2, 1, 1, 1e-9, 1e-9, 1e-9);
        let spin = MeshValue::from_vec(vec![Vec3::new(1.0, 0.0, 0.0), Vec3::new(0.0, 1.0, 0.0)]);
        let angle = max_spin_angle(&mesh, &spin);
        assert!((angle - std::f64::consts::FRAC_PI_2).abs() < 1e-9);
    }

    #[test]
    fn invalidate_forces_recompute_on_same_id() {
        let mesh = UniformRectangularMesh::new(2, 1, 1, 1e-9, 1e-9, 1e-9);
        let mut state = SimState::blank(Arc::new(mesh));
        state.id = 5;
        let mut cache: OutputCache<u32> = OutputCache::new();
        let mut calls = 0;
        cache.get_or_compute(&state, |_| {
            calls += 1;
            1
        });
        cache.invalidate();
        cache.get_or_compute(&state, |_| {
            calls += 1;
            2
        });
        assert_eq!(calls, 2);
    }
}
