//! Checkpoint subsystem: crash-safe periodic serialization of the current
//! simulation state.
//!
//! Writes `state.id`, counters, times, problem status, and the full spin
//! array to a temporary file, fsyncs it, then atomically renames it onto
//! the final path. `Ms`/`Ms_inverse`/the mesh are not part of the
//! checkpoint: they are host-supplied metadata fixed for the run, not
//! part of the evolving trajectory, so a restored state still needs them
//! refilled by the caller before it can be stepped.

use std::fs::{self, File};
use std::io::{self, Read as IoRead, Write as IoWrite};
use std::path::{Path, PathBuf};

use crate::error::{LlgError, Result};
use crate::state::{derived_keys, ProblemStatus, ReadKey, SimState, StatePool, WriteKey};
use crate::striped::MeshValue;
use crate::vec3::Vec3;

const MAGIC: &[u8; 8] = b"LLGCKPT1";
const VERSION: u32 = 1;

/// What happens to the checkpoint file at the end of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupPolicy {
    /// Remove the file on any clean shutdown.
    Normal,
    /// Remove only if the final problem status was `Done`.
    DoneOnly,
    /// Never remove it.
    Never,
}

#[derive(Debug, Clone)]
pub struct CheckpointConfig {
    pub path: PathBuf,
    /// Seconds between checkpoints; negative disables checkpointing.
    pub interval_secs: f64,
    pub cleanup: CleanupPolicy,
    /// If true and `path` doesn't exist, `Checkpoint::new` fails instead of
    /// treating a missing file as "no checkpoint to restore".
    pub restart_required: bool,
}

pub struct Checkpoint {
    config: CheckpointConfig,
}

impl Checkpoint {
    pub fn new(config: CheckpointConfig) -> Result<Self> {
        if config.restart_required && !config.path.exists() {
            return Err(LlgError::Checkpoint(format!(
                "mandatory restart checkpoint file not found: {}",
                config.path.display()
            )));
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &CheckpointConfig {
        &self.config
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.config.path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".tmp");
        self.config.path.with_file_name(name)
    }

    /// Write `state` to `path.tmp`, fsync it, then rename onto `path`.
    pub fn write(&self, state: &SimState) -> Result<()> {
        let tmp_path = self.tmp_path();
        self.write_atomic(&tmp_path, state)
            .map_err(|e| LlgError::Checkpoint(format!("writing {}: {e}", tmp_path.display())))?;
        fs::rename(&tmp_path, &self.config.path).map_err(|e| {
            LlgError::Checkpoint(format!(
                "renaming {} -> {}: {e}",
                tmp_path.display(),
                self.config.path.display()
            ))
        })
    }

    fn write_atomic(&self, tmp_path: &Path, state: &SimState) -> io::Result<()> {
        let mut file = File::create(tmp_path)?;
        write_binary(&mut file, state)?;
        file.sync_all()
    }

    /// Restore a state from `config.path` into a fresh pool slot. `Ok(None)`
    /// means the file is missing and restart isn't mandatory.
    ///
    /// `Ms`/`Ms_inverse` are not part of the checkpoint (see module docs), so
    /// the caller supplies them here, before the restored slot is finalized
    /// -- a `SimState` is immutable the moment it's finalized, so there is
    /// no later point at which they could still be patched in.
    pub fn restore(
        &self,
        pool: &mut StatePool,
        ms: &MeshValue<f64>,
        ms_inverse: &MeshValue<f64>,
    ) -> Result<Option<ReadKey<SimState>>> {
        let file = match File::open(&self.config.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound && !self.config.restart_required => {
                return Ok(None);
            }
            Err(e) => {
                return Err(LlgError::Checkpoint(format!("opening {}: {e}", self.config.path.display())));
            }
        };
        let mut write = pool.get_new_simulation_state()?;
        let id = read_binary(file, &mut write)
            .map_err(|e| LlgError::Checkpoint(format!("reading {}: {e}", self.config.path.display())))?;
        write.ms = ms.clone();
        write.ms_inverse = ms_inverse.clone();
        Ok(Some(write.finalize_state(id)))
    }

    /// Apply the cleanup policy at the end of a run. Callers invoke this
    /// explicitly once a run concludes, since `Drop` can't report I/O
    /// errors.
    pub fn cleanup(&self, final_status: Option<ProblemStatus>) -> Result<()> {
        let should_remove = match self.config.cleanup {
            CleanupPolicy::Normal => true,
            CleanupPolicy::DoneOnly => final_status == Some(ProblemStatus::Done),
            CleanupPolicy::Never => false,
        };
        if !should_remove {
            return Ok(());
        }
        match fs::remove_file(&self.config.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(LlgError::Checkpoint(format!("removing {}: {e}", self.config.path.display()))),
        }
    }
}

fn write_binary(w: &mut impl IoWrite, state: &SimState) -> io::Result<()> {
    w.write_all(MAGIC)?;
    w.write_all(&VERSION.to_le_bytes())?;
    w.write_all(&state.id.to_le_bytes())?;
    w.write_all(&state.previous_state_id.to_le_bytes())?;
    w.write_all(&state.iteration_count.to_le_bytes())?;
    w.write_all(&state.stage_number.to_le_bytes())?;
    w.write_all(&state.stage_iteration_count.to_le_bytes())?;
    w.write_all(&state.stage_start_time.to_le_bytes())?;
    w.write_all(&state.stage_elapsed_time.to_le_bytes())?;
    w.write_all(&state.last_timestep.to_le_bytes())?;
    let status = state.problem_status().map(|s| s as i32).unwrap_or(ProblemStatus::Invalid as i32);
    w.write_all(&status.to_le_bytes())?;
    w.write_all(&(state.spin.len() as u64).to_le_bytes())?;
    for s in state.spin.iter() {
        w.write_all(&s.x.to_le_bytes())?;
        w.write_all(&s.y.to_le_bytes())?;
        w.write_all(&s.z.to_le_bytes())?;
    }
    Ok(())
}

/// Reads a checkpoint into `write`'s counters/times/spin array, returning the
/// state id recorded in the file (the caller re-finalizes under this id).
fn read_binary(mut r: impl IoRead, write: &mut WriteKey<SimState>) -> io::Result<u32> {
    let mut magic = [0u8; 8];
    r.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "bad checkpoint magic"));
    }
    let mut b4 = [0u8; 4];
    r.read_exact(&mut b4)?;
    let version = u32::from_le_bytes(b4);
    if version != VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported checkpoint version {version}"),
        ));
    }

    r.read_exact(&mut b4)?;
    let id = u32::from_le_bytes(b4);
    r.read_exact(&mut b4)?;
    write.previous_state_id = u32::from_le_bytes(b4);
    r.read_exact(&mut b4)?;
    write.iteration_count = u32::from_le_bytes(b4);
    r.read_exact(&mut b4)?;
    write.stage_number = u32::from_le_bytes(b4);
    r.read_exact(&mut b4)?;
    write.stage_iteration_count = u32::from_le_bytes(b4);

    let mut b8 = [0u8; 8];
    r.read_exact(&mut b8)?;
    write.stage_start_time = f64::from_le_bytes(b8);
    r.read_exact(&mut b8)?;
    write.stage_elapsed_time = f64::from_le_bytes(b8);
    r.read_exact(&mut b8)?;
    write.last_timestep = f64::from_le_bytes(b8);

    r.read_exact(&mut b4)?;
    let status_raw = i32::from_le_bytes(b4);

    r.read_exact(&mut b8)?;
    let n = u64::from_le_bytes(b8) as usize;
    if n != write.spin.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("checkpoint has {n} cells, mesh has {}", write.spin.len()),
        ));
    }
    for i in 0..n {
        let mut xb = [0u8; 8];
        let mut yb = [0u8; 8];
        let mut zb = [0u8; 8];
        r.read_exact(&mut xb)?;
        r.read_exact(&mut yb)?;
        r.read_exact(&mut zb)?;
        write.spin[i] = Vec3::new(f64::from_le_bytes(xb), f64::from_le_bytes(yb), f64::from_le_bytes(zb));
    }

    if let Some(status) = ProblemStatus::from_i32(status_raw) {
        let _ = write.derived_data.add(derived_keys::PROBLEM_STATUS, status as i32 as f64);
    }

    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::UniformRectangularMesh;
    use std::sync::Arc;

    fn pool_with_state(n: usize) -> (StatePool, ReadKey<SimState>) {
        let mesh: Arc<dyn crate::mesh::Mesh> = Arc::new(UniformRectangularMesh::new(n, 1, 1, 1e-9, 1e-9, 1e-9));
        let mut pool = StatePool::new(mesh);
        pool.reserve_state_requests(4);
        let mut write = pool.get_new_simulation_state().unwrap();
        for i in 0..n {
            write.spin[i] = Vec3::new(0.6, 0.8, 0.0);
        }
        write.iteration_count = 25;
        write.stage_number = 1;
        write.stage_iteration_count = 10;
        write.stage_start_time = 1e-10;
        write.stage_elapsed_time = 2.5e-11;
        write.last_timestep = 1e-13;
        write
            .derived_data
            .add(derived_keys::PROBLEM_STATUS, ProblemStatus::InsideStage as i32 as f64)
            .unwrap();
        let id = pool.next_id();
        (pool, write.finalize_state(id))
    }

    fn checkpoint(path: PathBuf, cleanup: CleanupPolicy, restart_required: bool) -> Checkpoint {
        Checkpoint::new(CheckpointConfig { path, interval_secs: 60.0, cleanup, restart_required }).unwrap()
    }

    #[test]
    fn write_then_restore_round_trips_bit_identical() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.ckpt");
        let (mut pool, state) = pool_with_state(4);

        let ckpt = checkpoint(path.clone(), CleanupPolicy::Never, false);
        ckpt.write(&state).unwrap();
        assert!(path.exists());
        assert!(!ckpt.tmp_path().exists());

        let ms = MeshValue::from_vec(vec![8e5; 4]);
        let ms_inverse = MeshValue::from_vec(vec![1.0 / 8e5; 4]);
        let restored = ckpt.restore(&mut pool, &ms, &ms_inverse).unwrap().unwrap();
        assert_eq!(restored.iteration_count, state.iteration_count);
        assert_eq!(restored.stage_number, state.stage_number);
        assert_eq!(restored.stage_iteration_count, state.stage_iteration_count);
        assert_eq!(restored.stage_start_time, state.stage_start_time);
        assert_eq!(restored.stage_elapsed_time, state.stage_elapsed_time);
        assert_eq!(restored.last_timestep, state.last_timestep);
        for i in 0..4 {
            assert_eq!(restored.spin[i], state.spin[i]);
        }
        assert_eq!(restored.problem_status(), Some(ProblemStatus::InsideStage));
        assert_eq!(restored.ms[0], 8e5);
        assert_eq!(restored.id, state.id());
    }

    #[test]
    fn restore_without_file_returns_none_when_not_mandatory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.ckpt");
        let mesh: Arc<dyn crate::mesh::Mesh> = Arc::new(UniformRectangularMesh::new(2, 1, 1, 1e-9, 1e-9, 1e-9));
        let mut pool = StatePool::new(mesh);
        pool.reserve_state_requests(2);

        let ckpt = checkpoint(path, CleanupPolicy::Never, false);
        let ms = MeshValue::from_vec(vec![8e5; 2]);
        let ms_inverse = MeshValue::from_vec(vec![1.0 / 8e5; 2]);
        assert!(ckpt.restore(&mut pool, &ms, &ms_inverse).unwrap().is_none());
    }

    #[test]
    fn mandatory_restart_with_missing_file_fails_at_init() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.ckpt");
        let result = Checkpoint::new(CheckpointConfig {
            path,
            interval_secs: 60.0,
            cleanup: CleanupPolicy::Never,
            restart_required: true,
        });
        assert!(result.is_err());
    }

    #[test]
    fn cleanup_done_only_keeps_file_unless_status_is_done() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.ckpt");
        let (_pool, state) = pool_with_state(2);
        let ckpt = checkpoint(path.clone(), CleanupPolicy::DoneOnly, false);
        ckpt.write(&state).unwrap();

        ckpt.cleanup(Some(ProblemStatus::InsideStage)).unwrap();
        assert!(path.exists());
        ckpt.cleanup(Some(ProblemStatus::Done)).unwrap();
        assert!(!path.exists());
    }
}
