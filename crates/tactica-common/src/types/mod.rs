//! Core domain types shared across Tactica crates

pub mod episode;
pub mod niche;
pub mod policy_graph;

pub use episode::{Episode, OutcomeVector};
pub use niche::Niche;
pub use policy_graph::{Effect, NodeKind, PolicyGraph, PolicyNode};
