//! `SimState`: an immutable-once-published snapshot of spins plus metadata
//! and a write-once derived-data bag.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{LlgError, Result};
use crate::mesh::Mesh;
use crate::state::lock::{ReadKey, WriteKey};
use crate::striped::MeshValue;
use crate::vec3::Vec3;

/// Tri-state cached predicate result for `stage_done`/`run_done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriState {
    Unknown,
    NotDone,
    Done,
}

impl TriState {
    pub fn is_done(self) -> bool {
        matches!(self, TriState::Done)
    }
}

/// Problem status recorded into derived data under the well-known key
/// `"Oxs_Driver Problem Status"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ProblemStatus {
    Invalid = 0,
    StageStart = 1,
    InsideStage = 2,
    StageEnd = 3,
    Done = 4,
}

impl ProblemStatus {
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(ProblemStatus::Invalid),
            1 => Some(ProblemStatus::StageStart),
            2 => Some(ProblemStatus::InsideStage),
            3 => Some(ProblemStatus::StageEnd),
            4 => Some(ProblemStatus::Done),
            _ => None,
        }
    }
}

/// Well-known derived-data keys.
pub mod derived_keys {
    pub const MAX_DM_DT: &str = "Max dm/dt";
    pub const DE_DT: &str = "dE/dt";
    pub const PE_PT: &str = "pE/pt";
    pub const DELTA_E: &str = "Delta E";
    pub const TOTAL_E: &str = "Total E";
    pub const TIMESTEP_LOWER_BOUND: &str = "Timestep lower bound";
    pub const PROBLEM_STATUS: &str = "Oxs_Driver Problem Status";
}

/// Append-only string-keyed map of derived scalar quantities. Each key may
/// be set exactly once per state.
#[derive(Debug, Clone, Default)]
pub struct DerivedData {
    entries: HashMap<String, f64>,
}

impl DerivedData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails with `DerivedDataError` if `key` is already present.
    pub fn add(&mut self, key: impl Into<String>, value: f64) -> Result<()> {
        let key = key.into();
        if self.entries.contains_key(&key) {
            return Err(LlgError::DerivedData(format!(
                "derived data key '{key}' already set for this state"
            )));
        }
        self.entries.insert(key, value);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.entries.get(key).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Immutable-once-finalized simulation snapshot.
#[derive(Clone)]
pub struct SimState {
    /// Unique monotonically-assigned tag; 0 means transient/not yet finalized.
    pub id: u32,
    /// Id of the state this one was computed from, or 0 if initial.
    pub previous_state_id: u32,

    pub iteration_count: u32,
    pub stage_number: u32,
    pub stage_iteration_count: u32,

    pub stage_start_time: f64,
    pub stage_elapsed_time: f64,
    pub last_timestep: f64,

    pub spin: MeshValue<Vec3>,
    pub ms: MeshValue<f64>,
    pub ms_inverse: MeshValue<f64>,

    pub mesh: Arc<dyn Mesh>,

    pub stage_done: TriState,
    pub run_done: TriState,

    pub derived_data: DerivedData,
}

impl SimState {
    /// A freshly allocated, not-yet-populated state: zeroed spins, id 0.
    /// `ms`/`ms_inverse` are left zeroed -- the caller (driver init, or
    /// `clone_header`) is responsible for populating them before the state
    /// is used for any dm/dt evaluation.
    pub fn blank(mesh: Arc<dyn Mesh>) -> Self {
        let n = mesh.size();
        Self {
            id: 0,
            previous_state_id: 0,
            iteration_count: 0,
            stage_number: 0,
            stage_iteration_count: 0,
            stage_start_time: 0.0,
            stage_elapsed_time: 0.0,
            last_timestep: 0.0,
            spin: MeshValue::zeros(n),
            ms: MeshValue::zeros(n),
            ms_inverse: MeshValue::zeros(n),
            mesh,
            stage_done: TriState::Unknown,
            run_done: TriState::Unknown,
            derived_data: DerivedData::new(),
        }
    }

    /// Copies all scalar metadata from `self` into a fresh blank state for
    /// `dst_mesh`, leaving the spin array untouched (caller fills it in),
    /// clearing derived data, and resetting stage/run predicates and
    /// timestep/counters to placeholder values.
    ///
    /// `previous_state_id` on the result is set to `self.id`.
    pub fn clone_header(&self) -> SimState {
        SimState {
            id: 0,
            previous_state_id: self.id,
            iteration_count: self.iteration_count,
            stage_number: self.stage_number,
            stage_iteration_count: self.stage_iteration_count,
            stage_start_time: self.stage_start_time,
            stage_elapsed_time: self.stage_elapsed_time,
            last_timestep: f64::NAN, // placeholder: not yet computed
            spin: self.spin.clone(),
            ms: self.ms.clone(),
            ms_inverse: self.ms_inverse.clone(),
            mesh: Arc::clone(&self.mesh),
            stage_done: TriState::Unknown,
            run_done: TriState::Unknown,
            derived_data: DerivedData::new(),
        }
    }

    /// Maximum deviation of any spin's magnitude from 1, used both as the
    /// normalization-drift diagnostic and by tests.
    pub fn max_spin_norm_error(&self) -> f64 {
        self.spin
            .iter()
            .fold(0.0_f64, |acc, s| acc.max((s.magnitude() - 1.0).abs()))
    }

    pub fn problem_status(&self) -> Option<ProblemStatus> {
        self.derived_data
            .get(derived_keys::PROBLEM_STATUS)
            .and_then(|v| ProblemStatus::from_i32(v as i32))
    }
}

impl WriteKey<SimState> {
    /// Assign `id` to both the lock's identity and the state's own `id`
    /// field, then finalize. Production code should prefer this over the
    /// generic `WriteKey::finalize` so that
    /// `SimState::id` (read by `Checkpoint` and by callers that only have a
    /// `&SimState`, not a `ReadKey`) stays in sync with the lock identity
    /// that `ReadKey::id()`/`same_state` consult.
    pub fn finalize_state(mut self, id: u32) -> ReadKey<SimState> {
        self.id = id;
        self.finalize(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::UniformRectangularMesh;

    fn mesh() -> Arc<dyn Mesh> {
        Arc::new(UniformRectangularMesh::new(4, 4, 1, 1e-9, 1e-9, 1e-9))
    }

    #[test]
    fn derived_data_rejects_write_twice() {
        let mut dd = DerivedData::new();
        dd.add("Max dm/dt", 1.0).unwrap();
        assert!(dd.add("Max dm/dt", 2.0).is_err());
        assert_eq!(dd.get("Max dm/dt"), Some(1.0));
    }

    #[test]
    fn clone_header_preserves_counters_but_clears_derived_data() {
        let mut s = SimState::blank(mesh());
        s.id = 7;
        s.iteration_count = 3;
        s.derived_data.add("Total E", 1.0).unwrap();

        let next = s.clone_header();
        assert_eq!(next.id, 0);
        assert_eq!(next.previous_state_id, 7);
        assert_eq!(next.iteration_count, 3);
        assert!(next.derived_data.is_empty());
        assert_eq!(next.stage_done, TriState::Unknown);
    }

    #[test]
    fn blank_state_spins_are_zero_not_unit() {
        let s = SimState::blank(mesh());
        // max_spin_norm_error of all-zero spins is 1 (|0|-1| == 1), confirming
        // callers must explicitly normalize before treating a state as valid.
        assert!((s.max_spin_norm_error() - 1.0).abs() < 1e-15);
    }
}
