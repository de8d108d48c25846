//! Reader-writer lock substrate for `SimState`.
//!
//! ```text
//!      INVALID --set_dep--> DEP --promote--> READ --demote--> DEP
//!                            |                 ^
//!                            +--promote--> WRITE  (exclusive; id still 0)
//!                                     +--finalize--> READ (id now assigned)
//! ```
//!
//! At most one holder may hold WRITE; any number may hold READ while no
//! WRITE is outstanding; DEP holds coexist with anything and only pin the
//! object's lifetime plus a remembered id for change detection.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{ArcRwLockReadGuard, ArcRwLockWriteGuard, RawRwLock, RwLock};

use crate::error::{LlgError, Result};

/// Shared identity: the id is 0 until `WriteKey::finalize` assigns one, after
/// which the backing value is never mutated again.
struct Identity {
    id: AtomicU32,
}

/// A lockable slot holding a `T` (in this crate, always `SimState`).
pub struct Lock<T> {
    identity: Arc<Identity>,
    content: Arc<RwLock<T>>,
}

impl<T> Lock<T> {
    pub fn new(value: T) -> Self {
        Self {
            identity: Arc::new(Identity { id: AtomicU32::new(0) }),
            content: Arc::new(RwLock::new(value)),
        }
    }

    pub fn id(&self) -> u32 {
        self.identity.id.load(Ordering::Acquire)
    }

    /// True if no outstanding read or write guard exists for this slot, i.e.
    /// it is safe for the pool to hand out as a fresh write target. DEP keys
    /// do not count against this (they pin lifetime, not lock state).
    pub fn is_free(&self) -> bool {
        Arc::strong_count(&self.content) == 1
    }

    /// Attempt to take the WRITE lock. Fails (`LockError`) if any other
    /// reader/writer currently holds a guard. Write locks may only be taken
    /// while `id == 0`, and at most one holder may hold WRITE.
    pub fn try_write(&self) -> Result<WriteKey<T>> {
        if self.id() != 0 {
            return Err(LlgError::Lock(
                "cannot take WRITE on a state with a finalized (non-zero) id".to_string(),
            ));
        }
        let guard = self
            .content
            .try_write_arc()
            .ok_or_else(|| LlgError::Lock("WRITE requested on an already-held state".to_string()))?;
        Ok(WriteKey {
            identity: Arc::clone(&self.identity),
            content: Arc::clone(&self.content),
            guard: Some(guard),
        })
    }

    /// Take a READ lock. Any number may coexist as long as no WRITE is held.
    pub fn read(&self) -> ReadKey<T> {
        let guard = self.content.read_arc();
        ReadKey {
            identity: Arc::clone(&self.identity),
            content: Arc::clone(&self.content),
            remembered_id: self.id(),
            guard,
        }
    }

    /// Take a lightweight DEP hold: pins lifetime, remembers the current id
    /// for later `same_state` comparisons, does not block readers/writers.
    pub fn dep(&self) -> DepKey<T> {
        DepKey {
            identity: Arc::clone(&self.identity),
            content: Arc::clone(&self.content),
            remembered_id: self.id(),
        }
    }
}

/// Exclusive write handle. `id` remains 0 until `finalize`.
pub struct WriteKey<T> {
    identity: Arc<Identity>,
    content: Arc<RwLock<T>>,
    guard: Option<ArcRwLockWriteGuard<RawRwLock, T>>,
}

impl<T> WriteKey<T> {
    /// Assign the next id and downgrade to a READ key. After this call the
    /// backing value is never mutated again.
    ///
    /// The write guard is released and a read guard reacquired immediately
    /// after; this is race-free because a `WriteKey` is only ever created
    /// for a freshly allocated, not-yet-shared pool slot (see
    /// `StatePool::get_new_simulation_state`), so no other holder can be
    /// racing to acquire it in the gap.
    pub fn finalize(mut self, id: u32) -> ReadKey<T> {
        debug_assert_ne!(id, 0, "finalized state ids are never 0");
        self.identity.id.store(id, Ordering::Release);
        drop(self.guard.take());
        let guard = self.content.read_arc();
        ReadKey {
            identity: Arc::clone(&self.identity),
            content: Arc::clone(&self.content),
            remembered_id: id,
            guard,
        }
    }
}

impl<T> std::ops::Deref for WriteKey<T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.guard.as_ref().expect("write guard present until finalize/drop")
    }
}

impl<T> std::ops::DerefMut for WriteKey<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.as_mut().expect("write guard present until finalize/drop")
    }
}

impl<T> Drop for WriteKey<T> {
    fn drop(&mut self) {
        if self.guard.is_some() && self.identity.id.load(Ordering::Acquire) == 0 {
            // Dropping a WriteKey without finalizing is allowed (the state
            // is simply discarded), but never leaves a stale non-zero id.
            // Nothing further to do: the guard's own Drop releases the lock.
        }
    }
}

/// Shared read handle; content is immutable and `id` is fixed for as long as
/// any `ReadKey` is outstanding.
pub struct ReadKey<T> {
    identity: Arc<Identity>,
    content: Arc<RwLock<T>>,
    remembered_id: u32,
    guard: ArcRwLockReadGuard<RawRwLock, T>,
}

impl<T> ReadKey<T> {
    pub fn id(&self) -> u32 {
        self.remembered_id
    }

    /// Whether the slot's current id still matches the id this key was
    /// created against.
    pub fn same_state(&self, id: u32) -> bool {
        self.remembered_id == id
    }

    /// Downgrade-equivalent: drop the read guard, keep a lifetime-pinning
    /// DEP hold remembering the same id.
    pub fn demote(self) -> DepKey<T> {
        DepKey {
            identity: self.identity,
            content: self.content,
            remembered_id: self.remembered_id,
        }
    }
}

impl<T> Clone for ReadKey<T> {
    fn clone(&self) -> Self {
        ReadKey {
            identity: Arc::clone(&self.identity),
            content: Arc::clone(&self.content),
            remembered_id: self.remembered_id,
            guard: self.content.read_arc(),
        }
    }
}

impl<T> std::ops::Deref for ReadKey<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

/// Lightweight dependency hold: pins the slot's lifetime without blocking
/// readers or writers.
pub struct DepKey<T> {
    identity: Arc<Identity>,
    content: Arc<RwLock<T>>,
    remembered_id: u32,
}

impl<T> DepKey<T> {
    pub fn same_state(&self, id: u32) -> bool {
        self.remembered_id == id
    }

    pub fn id(&self) -> u32 {
        self.identity.id.load(Ordering::Acquire)
    }

    /// Promote to a READ key, re-reading content through the lock.
    pub fn promote_read(self) -> ReadKey<T> {
        let guard = self.content.read_arc();
        ReadKey {
            identity: self.identity,
            content: self.content,
            remembered_id: self.remembered_id,
            guard,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_finalize_yields_read_with_id() {
        let lock = Lock::new(0_i32);
        let write = lock.try_write().unwrap();
        assert_eq!(lock.id(), 0);
        let read = write.finalize(42);
        assert_eq!(lock.id(), 42);
        assert_eq!(read.id(), 42);
        assert!(*read == 0);
    }

    #[test]
    fn cannot_take_second_write_while_one_outstanding() {
        let lock = Lock::new(0_i32);
        let _w1 = lock.try_write().unwrap();
        assert!(lock.try_write().is_err());
    }

    #[test]
    fn cannot_write_a_finalized_state() {
        let lock = Lock::new(0_i32);
        let w = lock.try_write().unwrap();
        let _r = w.finalize(1);
        assert!(lock.try_write().is_err());
    }

    #[test]
    fn many_readers_coexist() {
        let lock = Lock::new(0_i32);
        let w = lock.try_write().unwrap();
        let r1 = w.finalize(1);
        let r2 = lock.read();
        let r3 = lock.read();
        assert_eq!(r1.id(), r2.id());
        assert_eq!(r2.id(), r3.id());
    }

    #[test]
    fn dep_key_detects_state_change() {
        let lock = Lock::new(0_i32);
        let w = lock.try_write().unwrap();
        let r = w.finalize(5);
        let dep = r.clone().demote();
        assert!(dep.same_state(5));
        assert!(!dep.same_state(6));
    }

    #[test]
    fn is_free_reflects_outstanding_keys() {
        let lock = Lock::new(0_i32);
        assert!(lock.is_free());
        let w = lock.try_write().unwrap();
        assert!(!lock.is_free());
        let r = w.finalize(1);
        assert!(!lock.is_free());
        drop(r);
        assert!(lock.is_free());
    }
}
