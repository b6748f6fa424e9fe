//! # Tactica Common
//!
//! Shared types and the unified error taxonomy for the Tactica decision
//! engine.
//!
//! ## Key Concepts
//!
//! - **Policy Graph**: a small directed graph of typed, effect-declaring
//!   steps. Structurally immutable once minted; a mutation creates a new arm.
//! - **Episode**: one full selection-to-outcome cycle.
//! - **Niche**: a coarse behavior descriptor used by the Quality-Diversity
//!   archive to track diversity of good solutions.

pub mod error;
pub mod types;

// Re-export core types
pub use error::{
    GateError, NumericError, Result, SelectionError, StoreError, TacticaError,
};
pub use types::episode::{Episode, OutcomeVector};
pub use types::niche::Niche;
pub use types::policy_graph::{Effect, NodeKind, PolicyGraph, PolicyNode};
