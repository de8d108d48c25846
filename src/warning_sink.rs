//! Rate-limited warning sink.
//!
//! Checkpoint I/O failures are logged but must never be allowed to spam a
//! long-running simulation's log every `checkpoint_interval`. Each distinct
//! warning class gets its own counter; once it hits `limit`, further
//! warnings of that class demote to `tracing::trace!`.

use std::collections::HashMap;
use std::sync::Mutex;

/// Default number of warnings emitted per class before demotion.
pub const DEFAULT_WARNING_LIMIT: u32 = 3;

pub struct WarningSink {
    limit: u32,
    counts: Mutex<HashMap<&'static str, u32>>,
}

impl WarningSink {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            counts: Mutex::new(HashMap::new()),
        }
    }

    /// Emit a warning under `class`. Returns true if it was actually logged
    /// at `warn` level (false if demoted to `trace`).
    pub fn warn(&self, class: &'static str, message: &str) -> bool {
        let mut counts = self.counts.lock().unwrap();
        let count = counts.entry(class).or_insert(0);
        *count += 1;
        if *count <= self.limit {
            tracing::warn!(class, count = *count, "{message}");
            true
        } else {
            tracing::trace!(class, count = *count, "{message}");
            false
        }
    }

    /// Number of warnings seen so far for `class` (for tests).
    pub fn count(&self, class: &'static str) -> u32 {
        *self.counts.lock().unwrap().get(class).unwrap_or(&0)
    }
}

impl Default for WarningSink {
    fn default() -> Self {
        Self::new(DEFAULT_WARNING_LIMIT)
    }
}
