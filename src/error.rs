//! Crate-wide error type.
//!
//! Step rejection is not an error (see `evolver::StepOutcome`) -- these
//! variants are reserved for genuine failures.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, LlgError>;

#[derive(Debug, Error)]
pub enum LlgError {
    /// Invalid MIF-layer input: unknown option, incompatible pair, malformed list.
    #[error("config error: {0}")]
    Config(String),

    /// Non-uniform mesh where uniformity is required, or mesh identity changed
    /// between steps.
    #[error("mesh error: {0}")]
    Mesh(String),

    /// Lock state machine misuse (e.g. WRITE taken on a multiply-held state).
    #[error("lock error: {0}")]
    Lock(String),

    /// Write-twice of a derived-data key.
    #[error("derived data error: {0}")]
    DerivedData(String),

    /// I/O failure writing or renaming a checkpoint. Callers should treat
    /// this as non-fatal and route it through `WarningSink` rather than
    /// aborting the run.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// All-zero Ms field, negative Ms value, or other fatal numeric defect
    /// detected at init time.
    #[error("numeric error: {0}")]
    Numeric(String),

    /// Unreachable branch reached (e.g. DONE status inside the driver loop).
    #[error("internal error: {0}")]
    Internal(String),
}
