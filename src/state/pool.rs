//! State pool.
//!
//! The Director pre-allocates a bounded number of `SimState` slots
//! (reservation count set at problem init). Ids are assigned monotonically
//! and are never reused within a run.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::error::{LlgError, Result};
use crate::mesh::Mesh;
use crate::state::lock::{Lock, WriteKey};
use crate::state::sim_state::SimState;

pub struct StatePool {
    mesh: Arc<dyn Mesh>,
    capacity: usize,
    slots: Vec<Lock<SimState>>,
    next_id: AtomicU32,
}

impl StatePool {
    /// Start with no slots; call `reserve_state_requests` during init.
    pub fn new(mesh: Arc<dyn Mesh>) -> Self {
        Self {
            mesh,
            capacity: 0,
            slots: Vec::new(),
            next_id: AtomicU32::new(1), // id 0 is reserved for "transient"
        }
    }

    /// Enlarge the pool by `n` entries.
    pub fn reserve_state_requests(&mut self, n: usize) {
        self.capacity += n;
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Yield a pool slot with a fresh WRITE lock, id 0. Grows the backing
    /// `Vec` lazily up to `capacity`; exceeding the reservation is a
    /// programming error.
    pub fn get_new_simulation_state(&mut self) -> Result<WriteKey<SimState>> {
        for slot in &self.slots {
            if slot.is_free() {
                if let Ok(write) = slot.try_write() {
                    return Ok(write);
                }
            }
        }
        if self.slots.len() >= self.capacity {
            return Err(LlgError::Internal(format!(
                "state pool reservation exhausted (capacity={}, no free slot)",
                self.capacity
            )));
        }
        let slot = Lock::new(SimState::blank(Arc::clone(&self.mesh)));
        let write = slot
            .try_write()
            .expect("freshly constructed slot is always free for WRITE");
        self.slots.push(slot);
        Ok(write)
    }

    /// Next id to assign to a finalized state. Ids are never reused.
    pub fn next_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::AcqRel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::UniformRectangularMesh;

    fn mesh() -> Arc<dyn Mesh> {
        Arc::new(UniformRectangularMesh::new(2, 2, 1, 1.0, 1.0, 1.0))
    }

    #[test]
    fn grows_up_to_capacity_and_then_errors() {
        let mut pool = StatePool::new(mesh());
        pool.reserve_state_requests(2);
        let w1 = pool.get_new_simulation_state().unwrap();
        let r1 = w1.finalize_state(pool.next_id());
        let _w2 = pool.get_new_simulation_state().unwrap();
        // Slot 1 still held (r1 alive), slot 2 held by w2: pool exhausted.
        assert!(pool.get_new_simulation_state().is_err());
        drop(r1);
        // Now slot 1 is free again.
        assert!(pool.get_new_simulation_state().is_ok());
    }

    #[test]
    fn ids_are_monotonic_and_never_reused() {
        let mut pool = StatePool::new(mesh());
        pool.reserve_state_requests(5);
        let mut ids = Vec::new();
        for _ in 0..5 {
            let id = pool.next_id();
            ids.push(id);
        }
        for w in ids.windows(2) {
            assert!(w[1] > w[0]);
        }
    }
}
