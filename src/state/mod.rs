pub mod lock;
pub mod pool;
pub mod sim_state;

pub use lock::{DepKey, Lock, ReadKey, WriteKey};
pub use pool::StatePool;
pub use sim_state::{derived_keys, DerivedData, ProblemStatus, SimState, TriState};
