//! `llg-core`: the adaptive-step driver/evolver core of a micromagnetic
//! time-evolution engine integrating the Landau-Lifshitz-Gilbert equation.
//!
//! This crate owns the state-and-lock substrate, the driver state machine,
//! the RKF54 evolver, the pluggable dm/dt kernels, the fixed-spin mask, and
//! the checkpoint subsystem. The specific energy/field terms, mesh geometry,
//! problem-configuration parsing, output serialization, and any GUI/TUI or
//! script-host layer are external collaborators a host embeds this crate
//! underneath; this crate never depends on them concretely, only through
//! the `EnergyProvider`/`Mesh`/`Atlas` traits.

pub mod checkpoint;
pub mod dmdt;
pub mod driver;
pub mod energy;
pub mod error;
pub mod evolver;
pub mod fixed_spin;
pub mod mesh;
pub mod output_cache;
pub mod rk_tableau;
pub mod state;
pub mod striped;
pub mod vec3;
pub mod warning_sink;

pub use error::{LlgError, Result};
pub use evolver::{Evolver, EvolverConfig, StageStartMode, StepOutcome};
pub use driver::{Driver, DriverConfig, DriverEvent, StageStopCriteria, TimeStopCriteria};
pub use output_cache::{OutputCache, SpinAngleCache};
pub use state::{DerivedData, ProblemStatus, ReadKey, SimState, StatePool, WriteKey};
