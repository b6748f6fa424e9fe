//! Error types for the Tactica engine
//!
//! Provides a unified error type and domain-specific error variants.
//! Recoverable conditions (cold start, unsafe policy, persistence failure)
//! are handled locally by their owners and surfaced as flags, never as hard
//! failures; only a registry invariant that cold-start repair cannot fix is
//! fatal.

use thiserror::Error;

use crate::types::policy_graph::Effect;

/// Result type alias using TacticaError
pub type Result<T> = std::result::Result<T, TacticaError>;

/// Unified error type for Tactica operations
#[derive(Debug, Error)]
pub enum TacticaError {
    // Selection errors
    #[error("Selection error: {0}")]
    Selection(#[from] SelectionError),

    // Numerical errors in bandit heads
    #[error("Numeric error: {0}")]
    Numeric(#[from] NumericError),

    // Safety gate rejections
    #[error("Safety gate error: {0}")]
    Gate(#[from] GateError),

    // Durable storage errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Selection-path errors
#[derive(Debug, Error)]
pub enum SelectionError {
    #[error("Mode not present in registry: {0}")]
    UnknownMode(String),

    #[error("No safe fallback arm for mode {mode} after cold-start repair")]
    FallbackUnavailable { mode: String },

    #[error("Update for arm {arm_id} has no cached selection context")]
    PairingMismatch { arm_id: String },
}

/// Numerical errors from bandit head linear algebra
#[derive(Debug, Error)]
pub enum NumericError {
    #[error("Cholesky factorization failed after {attempts} jitter retries")]
    CholeskyFailed { attempts: u32 },

    #[error("Non-finite value encountered in {context}")]
    NonFinite { context: String },

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Safety gate errors
#[derive(Debug, Error)]
pub enum GateError {
    #[error("Policy graph declares forbidden effect combination: {combo:?}")]
    ForbiddenCombination { combo: Vec<Effect> },

    #[error("Effect policy load failed: {0}")]
    PolicyLoad(String),
}

/// Errors from durable arm storage
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Arm not found: {0}")]
    NotFound(String),

    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

// Implement From for common external error types
impl From<serde_json::Error> for TacticaError {
    fn from(err: serde_json::Error) -> Self {
        TacticaError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for TacticaError {
    fn from(err: anyhow::Error) -> Self {
        TacticaError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TacticaError::Selection(SelectionError::UnknownMode("planful".to_string()));
        assert!(err.to_string().contains("planful"));
    }

    #[test]
    fn test_gate_error_names_effects() {
        let err = GateError::ForbiddenCombination {
            combo: vec![Effect::Write, Effect::NetAccess],
        };
        let msg = err.to_string();
        assert!(msg.contains("Write"));
        assert!(msg.contains("NetAccess"));
    }
}
