//! `Driver`: the stage/step sequencing state machine.
//!
//! Drives the `Evolver` one step at a time, applies the driver-level and
//! child-specific stopping criteria, walks the `{STAGE_START, INSIDE_STAGE,
//! STAGE_END, DONE}` problem-status machine, emits `Step`/`StageDone`/
//! `RunDone` events, and triggers checkpoints on a wall-clock interval.

use std::sync::Arc;
use std::time::Instant;

use crate::checkpoint::Checkpoint;
use crate::error::{LlgError, Result};
use crate::evolver::{Evolver, StepOutcome};
use crate::mesh::{FillMeshValue, Mesh};
use crate::output_cache::SpinAngleCache;
use crate::state::{derived_keys, ProblemStatus, ReadKey, SimState, StatePool, TriState};
use crate::striped::MeshValue;
use crate::vec3::Vec3;
use crate::warning_sink::WarningSink;

use crate::energy::EnergyProvider;
use crate::fixed_spin::FixedSpinMask;

/// "Foreshortening" constants for the stage-stop clamp applied before each step.
const STAGE_STOP_SLACK_EPS: f64 = 2.0 * f64::EPSILON;
const APPROACH_FORESHORTEN_FRACTION: f64 = 0.25;

/// Driver-level vs. child-specific stage-done check split. `Oxs_TimeDriver`'s
/// own concrete behavior lives in `TimeStopCriteria` below; a host wanting a
/// different child driver implements this trait directly.
pub trait StageStopCriteria: Send + Sync {
    /// The child-specific opinion on whether `state`'s stage is finished,
    /// or `None` to defer entirely to the driver-level iteration checks.
    fn stage_done(&self, state: &SimState) -> Option<bool>;

    /// The configured stop time for `stage`, if this criteria is
    /// time-based and a threshold was set (used for stage-stop-time
    /// foreshortening even when `stage_done` itself returns `None`).
    fn stopping_time(&self, stage: u32) -> Option<f64>;
}

/// Time- and dm/dt-based stage stopping, modeled on `Oxs_TimeDriver`'s
/// child/time-driver specific check.
#[derive(Debug, Clone, Default)]
pub struct TimeStopCriteria {
    /// Per-stage stop time in seconds, indexed by `stage_number`; a missing
    /// entry or a negative value disables the time check for that stage.
    pub stopping_time: Vec<f64>,
    /// Per-stage `max dm/dt` stop threshold in rad/s; a missing entry or a
    /// negative value disables the dm/dt check for that stage.
    pub stopping_dm_dt: Vec<f64>,
}

impl TimeStopCriteria {
    fn lookup(values: &[f64], stage: u32) -> Option<f64> {
        values.get(stage as usize).copied().filter(|v| *v >= 0.0)
    }
}

impl StageStopCriteria for TimeStopCriteria {
    fn stage_done(&self, state: &SimState) -> Option<bool> {
        let mut opinion = None;
        if let Some(stop_time) = Self::lookup(&self.stopping_time, state.stage_number) {
            opinion = Some(state.stage_elapsed_time >= stop_time);
        }
        if let Some(stop_dm_dt) = Self::lookup(&self.stopping_dm_dt, state.stage_number) {
            if let Some(max_dm_dt) = state.derived_data.get(derived_keys::MAX_DM_DT) {
                opinion = Some(opinion.unwrap_or(false) || max_dm_dt <= stop_dm_dt);
            }
        }
        opinion
    }

    fn stopping_time(&self, stage: u32) -> Option<f64> {
        Self::lookup(&self.stopping_time, stage)
    }
}

/// Driver construction options.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Total accepted-step limit across the whole run; 0 disables.
    pub total_iteration_limit: u32,
    /// Per-stage accepted-step limit, indexed by stage number; 0 (or a
    /// missing entry) disables that stage's limit.
    pub stage_iteration_limit: Vec<u32>,
    /// Total number of stages in this run; `is_run_done` checks "on the
    /// last stage and `is_stage_done`" against `stage_count - 1`. This
    /// driver-level count wins over a child stage object's own opinion.
    pub stage_count: u32,
    /// Stage-number increment applied at `STAGE_END`.
    pub stage_increment: u32,
    /// Whether to additionally maintain the "Max Spin Angle" output-cache
    /// diagnostic after each accepted step.
    pub report_max_spin_angle: bool,
    /// At most this many accepted-step/stage/run events delivered per
    /// `run()` call, so scheduled events can be delivered between calls.
    /// Default 1.
    pub max_steps: u32,
    /// At most this many evolver step attempts (accepted or rejected) per
    /// `run()` call. Default 2.
    pub max_attempts: u32,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            total_iteration_limit: 0,
            stage_iteration_limit: Vec::new(),
            stage_count: 1,
            stage_increment: 1,
            report_max_spin_angle: false,
            max_steps: 1,
            max_attempts: 2,
        }
    }
}

impl DriverConfig {
    fn stage_limit(&self, stage: u32) -> Option<u32> {
        self.stage_iteration_limit.get(stage as usize).copied().filter(|&n| n > 0)
    }
}

/// An event the driver appended during one `run()` call: at most `Step`,
/// then `StageDone`, then `RunDone`, in that order.
#[derive(Clone)]
pub enum DriverEvent {
    Step(ReadKey<SimState>),
    StageDone(ReadKey<SimState>),
    RunDone(ReadKey<SimState>),
}

/// The driver state machine.
pub struct Driver {
    config: DriverConfig,
    criteria: Box<dyn StageStopCriteria>,
    checkpoint: Option<Checkpoint>,
    status: ProblemStatus,
    current: ReadKey<SimState>,
    last_checkpoint_id: u32,
    last_checkpoint_at: Instant,
    spin_angle: SpinAngleCache,
    checkpoint_warnings: WarningSink,
}

impl Driver {
    /// Acquire the run's initial state: restore from `checkpoint` if a
    /// restart is available, otherwise fill `m0`, normalize every spin to
    /// unit magnitude, and start counters at zero. `Ms[i] == 0` marks a
    /// non-magnetic cell; `Ms[i] < 0` is rejected outright.
    pub fn new(
        config: DriverConfig,
        criteria: Box<dyn StageStopCriteria>,
        checkpoint: Option<Checkpoint>,
        pool: &mut StatePool,
        mesh: &Arc<dyn Mesh>,
        m0: &dyn FillMeshValue<Vec3>,
        ms: MeshValue<f64>,
    ) -> Result<Self> {
        validate_ms(&ms)?;
        let ms_inverse =
            MeshValue::from_vec(ms.iter().map(|&v| if v != 0.0 { 1.0 / v } else { 0.0 }).collect());

        let restored = match &checkpoint {
            Some(ckpt) => ckpt.restore(pool, &ms, &ms_inverse)?,
            None => None,
        };

        let current = match restored {
            Some(read) => read,
            None => {
                let mut write = pool.get_new_simulation_state()?;
                m0.fill_mesh_value(mesh.as_ref(), &mut write.spin);
                for i in 0..write.spin.len() {
                    write.spin[i] = write.spin[i].normalize();
                }
                write.ms = ms;
                write.ms_inverse = ms_inverse;
                write.mesh = Arc::clone(mesh);
                write.iteration_count = 0;
                write.stage_number = 0;
                write.stage_iteration_count = 0;
                write.stage_start_time = 0.0;
                write.stage_elapsed_time = 0.0;
                write.last_timestep = 0.0;
                write.derived_data.add(
                    derived_keys::PROBLEM_STATUS,
                    ProblemStatus::StageStart as i32 as f64,
                )?;
                let id = pool.next_id();
                write.finalize_state(id)
            }
        };

        let status = current.problem_status().unwrap_or(ProblemStatus::StageStart);
        Ok(Self {
            config,
            criteria,
            checkpoint,
            status,
            current,
            last_checkpoint_id: 0,
            last_checkpoint_at: Instant::now(),
            spin_angle: SpinAngleCache::new(),
            checkpoint_warnings: WarningSink::default(),
        })
    }

    pub fn current(&self) -> &ReadKey<SimState> {
        &self.current
    }

    pub fn status(&self) -> ProblemStatus {
        self.status
    }

    /// "Max Spin Angle" (radians) of the current state, maintained lazily
    /// when `config.report_max_spin_angle` is set. Kept as an output-cache
    /// side channel rather than a derived-data entry since the evolver has
    /// already finalized (and thus frozen) the state by the time the
    /// driver sees it.
    pub fn max_spin_angle(&mut self) -> Option<f64> {
        self.spin_angle.get(&self.current)
    }

    /// Advance the run by at most one accepted step. Appends `Step`,
    /// `StageDone`, and `RunDone` events to `events`, in that order, as
    /// they occur.
    #[tracing::instrument(skip_all, fields(status = ?self.status))]
    pub fn run(
        &mut self,
        pool: &mut StatePool,
        evolver: &mut Evolver,
        energy: &dyn EnergyProvider,
        fixed: &FixedSpinMask,
        events: &mut Vec<DriverEvent>,
    ) -> Result<()> {
        let mut step_events = 0u32;
        let mut step_calls = 0u32;

        while step_events < self.config.max_steps
            && step_calls < self.config.max_attempts
            && self.status != ProblemStatus::Done
        {
            let mut step_taken = false;

            match self.status {
                ProblemStatus::InsideStage => {
                    self.apply_stage_stop_clamp(evolver);
                    match evolver.step(pool, energy, fixed, &self.current)? {
                        StepOutcome::Accepted(next) => {
                            self.current = next;
                            if self.config.report_max_spin_angle {
                                self.spin_angle.get(&self.current);
                            }
                            step_taken = true;
                            events.push(DriverEvent::Step(self.current.clone()));
                            step_events += 1;
                        }
                        StepOutcome::Rejected { .. } => {}
                    }
                    step_calls += 1;
                }
                ProblemStatus::StageEnd => {
                    self.advance_to_next_stage(pool)?;
                    evolver.init_new_stage(&self.current, None);
                    self.status = ProblemStatus::StageStart;
                    step_taken = true;
                }
                ProblemStatus::StageStart => {
                    evolver.init_new_stage(&self.current, None);
                    step_taken = true;
                }
                ProblemStatus::Done | ProblemStatus::Invalid => {
                    return Err(LlgError::Internal(format!(
                        "Driver::run entered with unreachable status {:?}",
                        self.status
                    )));
                }
            }

            if step_taken {
                self.status = ProblemStatus::InsideStage;
                if self.is_stage_done() {
                    self.status = ProblemStatus::StageEnd;
                    events.push(DriverEvent::StageDone(self.current.clone()));
                    if self.is_run_done() {
                        self.status = ProblemStatus::Done;
                        events.push(DriverEvent::RunDone(self.current.clone()));
                    }
                }
                tracing::debug!(status = ?self.status, id = self.current.id(), "driver status transition");
            }

            self.maybe_checkpoint();
        }

        Ok(())
    }

    /// Memoized in `TriState`: a cached `stage_done` wins if already
    /// resolved; otherwise the driver-level iteration checks, then the
    /// child-specific criteria.
    fn is_stage_done(&self) -> bool {
        match self.current.stage_done {
            TriState::Done => return true,
            TriState::NotDone => return false,
            TriState::Unknown => {}
        }
        if self.config.total_iteration_limit > 0
            && self.current.iteration_count >= self.config.total_iteration_limit
        {
            return true;
        }
        if let Some(limit) = self.config.stage_limit(self.current.stage_number) {
            if self.current.stage_iteration_count + 1 >= limit {
                return true;
            }
        }
        self.criteria.stage_done(&self.current).unwrap_or(false)
    }

    /// Total-iteration limit, or last stage plus `is_stage_done`, or the
    /// child-specific criteria.
    fn is_run_done(&self) -> bool {
        match self.current.run_done {
            TriState::Done => return true,
            TriState::NotDone => return false,
            TriState::Unknown => {}
        }
        if self.config.total_iteration_limit > 0
            && self.current.iteration_count >= self.config.total_iteration_limit
        {
            return true;
        }
        let on_last_stage = self.config.stage_count == 0
            || self.current.stage_number + 1 >= self.config.stage_count;
        on_last_stage && self.is_stage_done()
    }

    /// `STAGE_END` handling: clone the current header into a fresh pool
    /// slot, bump stage number by `stage_increment`, reset stage-local
    /// counters and timers, and finalize.
    fn advance_to_next_stage(&mut self, pool: &mut StatePool) -> Result<()> {
        let header = self.current.clone_header();
        let mut write = pool.get_new_simulation_state()?;
        let elapsed = self.current.stage_elapsed_time;
        *write = header;
        write.stage_number += self.config.stage_increment;
        write.stage_iteration_count = 0;
        write.stage_start_time += elapsed;
        write.stage_elapsed_time = 0.0;
        write.derived_data.add(
            derived_keys::PROBLEM_STATUS,
            ProblemStatus::StageStart as i32 as f64,
        )?;
        let id = pool.next_id();
        self.current = write.finalize_state(id);
        Ok(())
    }

    /// Stage-stop clamp: if the evolver's primed next step would overstep a
    /// configured stage-stop time, shrink it to land exactly on the
    /// boundary. If it would land just short of the boundary (within the
    /// last 25% of a step), don't jump the remaining distance in one go --
    /// partially shrink instead, so the step after this one is the one that
    /// lands on the boundary via the overstep case below.
    fn apply_stage_stop_clamp(&self, evolver: &mut Evolver) {
        let Some(stop_time) = self.criteria.stopping_time(self.current.stage_number) else {
            return;
        };
        let Some(h) = evolver.next_timestep_hint() else {
            return;
        };
        let remaining = stop_time - self.current.stage_elapsed_time;
        let slack = STAGE_STOP_SLACK_EPS * stop_time.abs().max(1.0);
        if remaining <= slack {
            // Already at (or numerically past) the boundary: nothing to do,
            // the stage-done check will catch it next iteration.
            return;
        }
        if remaining <= h {
            // This step would overstep the boundary outright: clamp it to
            // land exactly on the boundary.
            evolver.override_next_timestep(remaining);
        } else if remaining < (1.0 + APPROACH_FORESHORTEN_FRACTION) * h {
            // Approach window (h, 1.25h): a direct jump to `remaining` here
            // would be a last-step jump of up to 25% over the natural step
            // size, which this mechanism exists to avoid. Partially shrink
            // instead -- this undershoots the boundary by roughly a quarter
            // to a half of a step, deferring the exact landing to the next
            // call's overstep branch.
            evolver.override_next_timestep(0.5 * h + 0.25 * remaining);
        }
    }

    /// Write a checkpoint if one is configured, the current state id has
    /// changed since the last checkpoint, and the wall-clock interval has
    /// elapsed. I/O failures are logged through the checkpoint's own
    /// warning sink, never propagated -- a failing checkpoint target must
    /// not abort an otherwise-healthy run.
    fn maybe_checkpoint(&mut self) {
        let Some(ckpt) = &self.checkpoint else { return };
        let interval = ckpt.config().interval_secs;
        if interval < 0.0 {
            return;
        }
        if self.current.id() == self.last_checkpoint_id {
            return;
        }
        if self.last_checkpoint_at.elapsed().as_secs_f64() < interval {
            return;
        }
        match ckpt.write(&self.current) {
            Ok(()) => {
                self.last_checkpoint_id = self.current.id();
                self.last_checkpoint_at = Instant::now();
            }
            Err(e) => {
                self.checkpoint_warnings.warn("checkpoint_write", &e.to_string());
            }
        }
    }

    /// Apply the checkpoint's cleanup policy for this run's final status.
    /// Callers invoke this once after the run loop concludes.
    pub fn finish(&self) -> Result<()> {
        if let Some(ckpt) = &self.checkpoint {
            ckpt.cleanup(Some(self.status))?;
        }
        Ok(())
    }
}

/// `Ms[i] < 0` is rejected at construction time. An all-zero `Ms` field
/// means every cell is non-magnetic, which can never produce a moving
/// simulation -- also fatal at init.
fn validate_ms(ms: &MeshValue<f64>) -> Result<()> {
    if ms.iter().any(|&v| v < 0.0) {
        return Err(LlgError::Numeric("Ms field contains a negative value".to_string()));
    }
    if ms.len() > 0 && ms.iter().all(|&v| v == 0.0) {
        return Err(LlgError::Numeric("Ms field is all zero: no magnetic cells".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dmdt::StandardLlg;
    use crate::energy::test_support::UniformZeeman;
    use crate::evolver::EvolverConfig;
    use crate::mesh::{UniformRectangularMesh, UniformValue};
    use crate::striped::MeshValue;

    fn make_driver_and_pool(
        n: usize,
        total_iteration_limit: u32,
    ) -> (StatePool, Driver, Evolver) {
        let mesh: Arc<dyn Mesh> = Arc::new(UniformRectangularMesh::new(n, 1, 1, 5e-9, 5e-9, 5e-9));
        let mut pool = StatePool::new(Arc::clone(&mesh));
        pool.reserve_state_requests(16);

        let ms = MeshValue::from_vec(vec![8e5; n]);
        let config = DriverConfig {
            total_iteration_limit,
            stage_count: 1,
            ..DriverConfig::default()
        };
        let criteria: Box<dyn StageStopCriteria> = Box::new(TimeStopCriteria::default());
        let m0 = UniformValue(Vec3::new(1.0, 0.0, 0.0));
        let driver = Driver::new(config, criteria, None, &mut pool, &mesh, &m0, ms).unwrap();

        let alpha = MeshValue::from_vec(vec![0.5; n]);
        let gamma = MeshValue::from_vec(vec![-2.21e5; n]);
        let kernel = StandardLlg::from_ll(alpha, gamma, true);
        let mut evolver_config = EvolverConfig::default();
        evolver_config.start_dt = Some(1e-13);
        let mut evolver = Evolver::new(evolver_config, Box::new(kernel)).unwrap();
        evolver.init();

        (pool, driver, evolver)
    }

    #[test]
    fn initial_state_has_unit_spins_and_stage_start_status() {
        let (_pool, driver, _evolver) = make_driver_and_pool(4, 0);
        assert_eq!(driver.status(), ProblemStatus::StageStart);
        for i in 0..4 {
            assert!((driver.current().spin[i].magnitude() - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn run_advances_through_stage_start_into_inside_stage() {
        let (mut pool, mut driver, mut evolver) = make_driver_and_pool(4, 0);
        let energy = UniformZeeman { field: Vec3::new(1e5, 0.0, 0.0), mu0: crate::dmdt::MU0 };
        let fixed = FixedSpinMask::empty();
        let mut events = Vec::new();

        // First call: STAGE_START -> init_new_stage, no accepted step yet.
        driver.run(&mut pool, &mut evolver, &energy, &fixed, &mut events).unwrap();
        assert_eq!(driver.status(), ProblemStatus::InsideStage);
        assert!(events.is_empty());

        // Second call: an actual RKF54 step.
        events.clear();
        driver.run(&mut pool, &mut evolver, &energy, &fixed, &mut events).unwrap();
        assert!(matches!(events.first(), Some(DriverEvent::Step(_))));
        assert!(driver.current().iteration_count >= 1);
    }

    #[test]
    fn total_iteration_limit_ends_the_run() {
        let (mut pool, mut driver, mut evolver) = make_driver_and_pool(4, 1);
        let energy = UniformZeeman { field: Vec3::new(1e5, 0.0, 0.0), mu0: crate::dmdt::MU0 };
        let fixed = FixedSpinMask::empty();
        let mut events = Vec::new();

        for _ in 0..10 {
            if driver.status() == ProblemStatus::Done {
                break;
            }
            driver.run(&mut pool, &mut evolver, &energy, &fixed, &mut events).unwrap();
        }
        assert_eq!(driver.status(), ProblemStatus::Done);
        assert!(events.iter().any(|e| matches!(e, DriverEvent::RunDone(_))));
    }

    #[test]
    fn rejects_negative_ms_at_construction() {
        let mesh: Arc<dyn Mesh> = Arc::new(UniformRectangularMesh::new(2, 1, 1, 1e-9, 1e-9, 1e-9));
        let mut pool = StatePool::new(Arc::clone(&mesh));
        pool.reserve_state_requests(4);
        let ms = MeshValue::from_vec(vec![8e5, -1.0]);
        let criteria: Box<dyn StageStopCriteria> = Box::new(TimeStopCriteria::default());
        let m0 = UniformValue(Vec3::new(1.0, 0.0, 0.0));
        let result = Driver::new(DriverConfig::default(), criteria, None, &mut pool, &mesh, &m0, ms);
        assert!(result.is_err());
    }

    #[test]
    fn rejects_all_zero_ms_at_construction() {
        let mesh: Arc<dyn Mesh> = Arc::new(UniformRectangularMesh::new(2, 1, 1, 1e-9, 1e-9, 1e-9));
        let mut pool = StatePool::new(Arc::clone(&mesh));
        pool.reserve_state_requests(4);
        let ms = MeshValue::from_vec(vec![0.0, 0.0]);
        let criteria: Box<dyn StageStopCriteria> = Box::new(TimeStopCriteria::default());
        let m0 = UniformValue(Vec3::new(1.0, 0.0, 0.0));
        let result = Driver::new(DriverConfig::default(), criteria, None, &mut pool, &mesh, &m0, ms);
        assert!(result.is_err());
    }

    #[test]
    fn stage_stop_time_lands_exactly_on_boundary() {
        let mesh: Arc<dyn Mesh> = Arc::new(UniformRectangularMesh::new(2, 1, 1, 5e-9, 5e-9, 5e-9));
        let mut pool = StatePool::new(Arc::clone(&mesh));
        pool.reserve_state_requests(64);
        let ms = MeshValue::from_vec(vec![8e5; 2]);
        let stop_time = 1.5e-11;
        let config = DriverConfig { stage_count: 2, ..DriverConfig::default() };
        let criteria: Box<dyn StageStopCriteria> =
            Box::new(TimeStopCriteria { stopping_time: vec![stop_time], stopping_dm_dt: vec![] });
        let m0 = UniformValue(Vec3::new(1.0, 0.0, 0.0));
        let mut driver = Driver::new(config, criteria, None, &mut pool, &mesh, &m0, ms).unwrap();

        let alpha = MeshValue::from_vec(vec![0.5; 2]);
        let gamma = MeshValue::from_vec(vec![-2.21e5; 2]);
        let kernel = StandardLlg::from_ll(alpha, gamma, true);
        let mut evolver_config = EvolverConfig::default();
        evolver_config.start_dt = Some(1e-12);
        let mut evolver = Evolver::new(evolver_config, Box::new(kernel)).unwrap();
        evolver.init();

        let energy = UniformZeeman { field: Vec3::new(1e5, 0.0, 1e4), mu0: crate::dmdt::MU0 };
        let fixed = FixedSpinMask::empty();
        let mut events = Vec::new();

        for _ in 0..10_000 {
            if driver.status() == ProblemStatus::StageEnd || driver.status() == ProblemStatus::Done {
                break;
            }
            events.clear();
            driver.run(&mut pool, &mut evolver, &energy, &fixed, &mut events).unwrap();
            if events.iter().any(|e| matches!(e, DriverEvent::StageDone(_))) {
                break;
            }
        }
        assert!(driver.current().stage_elapsed_time <= stop_time);
    }
}
